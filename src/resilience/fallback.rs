use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};

type Producer<T> = Arc<dyn Fn(&Error) -> T + Send + Sync>;
type Filter = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Where a fallback value comes from.
#[derive(Clone)]
pub enum FallbackSource<T> {
    /// A fixed value, cloned on each use.
    Value(T),
    /// Computed from the error that engaged the fallback.
    With(Producer<T>),
}

/// Substitute result for a failed call, optionally limited to some errors.
#[derive(Clone)]
pub struct Fallback<T> {
    source: FallbackSource<T>,
    filter: Option<Filter>,
}

impl<T> fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            FallbackSource::Value(_) => "value",
            FallbackSource::With(_) => "function",
        };
        f.debug_struct("Fallback")
            .field("source", &source)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl<T: Clone> Fallback<T> {
    /// Falls back to a fixed value.
    pub const fn value(value: T) -> Self {
        Self {
            source: FallbackSource::Value(value),
            filter: None,
        }
    }

    /// Falls back to a value computed from the error.
    pub fn with(producer: impl Fn(&Error) -> T + Send + Sync + 'static) -> Self {
        Self {
            source: FallbackSource::With(Arc::new(producer)),
            filter: None,
        }
    }

    /// Engages only for errors matching `predicate`.
    #[must_use]
    pub fn when(mut self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(predicate));
        self
    }

    /// Whether `err` engages this fallback.
    pub fn applies_to(&self, err: &Error) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(err))
    }

    /// Turns `err` into the fallback value, or hands it back if filtered out.
    ///
    /// # Errors
    ///
    /// Returns `err` unchanged when the predicate rejects it.
    pub fn apply(&self, err: Error) -> Result<T> {
        if !self.applies_to(&err) {
            return Err(err);
        }
        info!(kind = %err.kind(), error = %err, "serving fallback");
        Ok(match &self.source {
            FallbackSource::Value(value) => value.clone(),
            FallbackSource::With(producer) => producer(&err),
        })
    }
}
