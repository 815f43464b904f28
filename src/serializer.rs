//! Panic-free JSON encoding with a sanitizing fallback.
//!
//! [`SafeSerializer`] runs a cheap scan over a value before encoding it. The
//! scan is a `serde::Serializer` that writes nothing and only records
//! findings: nesting past the depth bound (the shape a reference cycle takes
//! once serialized), 128-bit integers outside the 64-bit range, map keys
//! that are not strings, and `Serialize` impls that fail.
//!
//! A clean scan goes straight to [`serde_json::to_string`]. Otherwise a
//! mirror encoder rebuilds the value as a [`serde_json::Value`] with every
//! offending node replaced by a placeholder, unless the serializer is
//! strict, in which case the findings are returned as an error.
//!
//! Every encoded text then passes a string-aware post-pass that drops raw
//! control characters and trailing commas.

use std::fmt::{self, Display};

use serde::Serialize;
use serde::ser::{self, Impossible};
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::error::SerializationError;

/// Default nesting bound for encoded values.
pub const DEFAULT_MAX_DEPTH: usize = 20;

/// Placeholder for nodes nested beyond the depth bound.
pub const MAX_DEPTH_MARKER: &str = "[Max Depth Exceeded]";

/// Findings kept per scan; the rest are counted only by the fallback.
const MAX_FINDINGS: usize = 16;

/// Tuning for [`SafeSerializer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializerOptions {
    /// Nodes deeper than this are replaced by [`MAX_DEPTH_MARKER`].
    pub max_depth: usize,
    /// Replacement for stripped control characters inside strings.
    ///
    /// Ignored when the mask is itself a control character, `"` or `\`.
    pub mask: Option<char>,
    /// Use the mirror encoder when the scan finds problems. When `false`,
    /// findings are an error.
    pub allow_fallback: bool,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            mask: None,
            allow_fallback: true,
        }
    }
}

/// Something in a value that plain `serde_json` cannot encode faithfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// Nesting went past the configured bound.
    DepthExceeded {
        /// The bound in force.
        max_depth: usize,
    },
    /// A 128-bit integer does not fit in 64 bits.
    BigInteger {
        /// The value in decimal.
        value: String,
    },
    /// A map key serialized as something other than a string or integer.
    NonStringKey,
    /// A `Serialize` impl returned an error.
    Failed {
        /// The error it returned.
        message: String,
    },
}

impl Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DepthExceeded { max_depth } => {
                write!(f, "nesting deeper than {max_depth} levels")
            }
            Self::BigInteger { value } => write!(f, "integer {value} is outside the 64-bit range"),
            Self::NonStringKey => f.write_str("map key is not a string"),
            Self::Failed { message } => write!(f, "Serialize impl failed: {message}"),
        }
    }
}

/// JSON encoder that never panics and degrades gracefully.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafeSerializer {
    options: SerializerOptions,
}

impl SafeSerializer {
    /// Creates a serializer with the given options.
    #[must_use]
    pub const fn new(options: SerializerOptions) -> Self {
        Self { options }
    }

    /// Creates a serializer that rejects values instead of sanitizing them.
    #[must_use]
    pub fn strict() -> Self {
        Self::new(SerializerOptions {
            allow_fallback: false,
            ..SerializerOptions::default()
        })
    }

    /// Returns the options in force.
    #[must_use]
    pub const fn options(&self) -> &SerializerOptions {
        &self.options
    }

    /// Lists what standard encoding would get wrong about `value`.
    pub fn scan<T: ?Sized + Serialize>(&self, value: &T) -> Vec<Finding> {
        let mut scan = Scan {
            max_depth: self.options.max_depth,
            depth: 0,
            findings: Vec::new(),
        };
        scan.child(value);
        scan.findings
    }

    /// Encodes `value` as compact JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Unrepresentable`] when the value cannot
    /// be encoded as-is and fallback is disabled.
    pub fn stringify<T: ?Sized + Serialize>(
        &self,
        value: &T,
    ) -> Result<String, SerializationError> {
        let findings = self.scan(value);
        let text = if findings.is_empty() {
            match serde_json::to_string(value) {
                Ok(text) => text,
                Err(err) => {
                    let finding = Finding::Failed {
                        message: err.to_string(),
                    };
                    encode(&self.fallback(value, &[finding])?)?
                }
            }
        } else {
            encode(&self.fallback(value, &findings)?)?
        };
        Ok(sanitize_json_text(&text, self.options.mask))
    }

    /// Encodes `value` as a [`Value`] tree.
    ///
    /// # Errors
    ///
    /// Same conditions as [`SafeSerializer::stringify`].
    pub fn to_value<T: ?Sized + Serialize>(&self, value: &T) -> Result<Value, SerializationError> {
        let findings = self.scan(value);
        if !findings.is_empty() {
            return self.fallback(value, &findings);
        }
        match serde_json::to_value(value) {
            Ok(tree) => Ok(tree),
            Err(err) => self.fallback(
                value,
                &[Finding::Failed {
                    message: err.to_string(),
                }],
            ),
        }
    }

    fn fallback<T: ?Sized + Serialize>(
        &self,
        value: &T,
        findings: &[Finding],
    ) -> Result<Value, SerializationError> {
        if !self.options.allow_fallback {
            return Err(SerializationError::Unrepresentable {
                findings: findings.iter().map(ToString::to_string).collect(),
            });
        }
        debug!(
            findings = findings.len(),
            first = %findings.first().map(ToString::to_string).unwrap_or_default(),
            "encoding through the sanitizing fallback"
        );
        Ok(Mirror::root(self.options.max_depth).mirror(value))
    }
}

fn encode(tree: &Value) -> Result<String, SerializationError> {
    serde_json::to_string(tree).map_err(|e| SerializationError::Encode {
        message: e.to_string(),
    })
}

/// Wire-safe copy of an error and its source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSnapshot {
    /// Short error name (its kind).
    pub name: String,
    /// Top-level message.
    pub message: String,
    /// Messages of each source, outermost first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl ErrorSnapshot {
    /// Captures `err` and walks its [`source`](std::error::Error::source) chain.
    #[must_use]
    pub fn capture(name: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            name: name.into(),
            message: err.to_string(),
            chain,
        }
    }
}

impl From<&crate::error::Error> for ErrorSnapshot {
    fn from(err: &crate::error::Error) -> Self {
        Self::capture(err.kind().as_str(), err)
    }
}

/// Strips raw control characters and trailing commas from JSON text.
///
/// Characters in `U+0000..=U+001F` and `U+007F..=U+009F` are removed, or
/// replaced by `mask` when they sit inside a string literal. A comma whose
/// next significant character closes an object or array is dropped. Commas
/// and brackets inside string literals are left alone.
#[must_use]
pub fn sanitize_json_text(text: &str, mask: Option<char>) -> String {
    let mask = mask.filter(|&c| !is_stripped_control(c) && c != '"' && c != '\\');
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if is_stripped_control(ch) {
            if in_string && let Some(m) = mask {
                out.push(m);
            }
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' if closes_next(&text[idx + 1..]) => {}
            _ => out.push(ch),
        }
    }
    out
}

fn closes_next(rest: &str) -> bool {
    rest.trim_start_matches(|c: char| c.is_whitespace() || is_stripped_control(c))
        .starts_with(['}', ']'])
}

const fn is_stripped_control(ch: char) -> bool {
    matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'..='\u{009F}')
}

/// Early exit raised inside the scan and mirror serializers.
#[derive(Debug)]
enum Abort {
    DepthLimit,
    NotAKey,
    Custom(String),
}

impl Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DepthLimit => f.write_str("depth limit reached"),
            Self::NotAKey => f.write_str("map key is not a string"),
            Self::Custom(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for Abort {}

impl ser::Error for Abort {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

struct Scan {
    max_depth: usize,
    depth: usize,
    findings: Vec<Finding>,
}

impl Scan {
    const fn enter(&self) -> Result<(), Abort> {
        if self.depth > self.max_depth {
            Err(Abort::DepthLimit)
        } else {
            Ok(())
        }
    }

    fn record(&mut self, finding: Finding) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(finding);
        }
    }

    /// Scans one child node, turning its failure into a finding.
    fn child<T: ?Sized + Serialize>(&mut self, value: &T) {
        let depth = self.depth;
        let outcome = value.serialize(&mut *self);
        // A failing impl may leave a compound open.
        self.depth = depth;
        match outcome {
            Ok(()) => {}
            Err(Abort::DepthLimit) => self.record(Finding::DepthExceeded {
                max_depth: self.max_depth,
            }),
            Err(Abort::NotAKey) => self.record(Finding::NonStringKey),
            Err(Abort::Custom(message)) => self.record(Finding::Failed { message }),
        }
    }

    fn check_wide(&mut self, fits: bool, value: impl Display) -> Result<(), Abort> {
        self.enter()?;
        if !fits {
            self.record(Finding::BigInteger {
                value: value.to_string(),
            });
        }
        Ok(())
    }
}

impl<'a> ser::Serializer for &'a mut Scan {
    type Ok = ();
    type Error = Abort;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_i8(self, _: i8) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_i16(self, _: i16) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_i32(self, _: i32) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_i64(self, _: i64) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_i128(self, v: i128) -> Result<(), Abort> {
        self.check_wide(i64::try_from(v).is_ok(), v)
    }
    fn serialize_u8(self, _: u8) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_u16(self, _: u16) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_u32(self, _: u32) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_u64(self, _: u64) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_u128(self, v: u128) -> Result<(), Abort> {
        self.check_wide(u64::try_from(v).is_ok(), v)
    }
    fn serialize_f32(self, _: f32) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_f64(self, _: f64) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_char(self, _: char) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_str(self, _: &str) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_none(self) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), Abort> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<(), Abort> {
        self.enter()
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Abort> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), Abort> {
        self.enter()?;
        self.depth += 1;
        self.child(value);
        self.depth -= 1;
        Ok(())
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self, Abort> {
        self.enter()?;
        self.depth += 1;
        Ok(self)
    }
    fn serialize_tuple(self, len: usize) -> Result<Self, Abort> {
        self.serialize_seq(Some(len))
    }
    fn serialize_tuple_struct(self, _: &'static str, len: usize) -> Result<Self, Abort> {
        self.serialize_seq(Some(len))
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        len: usize,
    ) -> Result<Self, Abort> {
        self.serialize_seq(Some(len))
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self, Abort> {
        self.serialize_seq(None)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, Abort> {
        self.serialize_seq(None)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, Abort> {
        self.serialize_seq(None)
    }
}

impl Scan {
    const fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

impl ser::SerializeSeq for &mut Scan {
    type Ok = ();
    type Error = Abort;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        self.child(value);
        Ok(())
    }
    fn end(self) -> Result<(), Abort> {
        self.close();
        Ok(())
    }
}

impl ser::SerializeTuple for &mut Scan {
    type Ok = ();
    type Error = Abort;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        self.child(value);
        Ok(())
    }
    fn end(self) -> Result<(), Abort> {
        self.close();
        Ok(())
    }
}

impl ser::SerializeTupleStruct for &mut Scan {
    type Ok = ();
    type Error = Abort;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        self.child(value);
        Ok(())
    }
    fn end(self) -> Result<(), Abort> {
        self.close();
        Ok(())
    }
}

impl ser::SerializeTupleVariant for &mut Scan {
    type Ok = ();
    type Error = Abort;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        self.child(value);
        Ok(())
    }
    fn end(self) -> Result<(), Abort> {
        self.close();
        Ok(())
    }
}

impl ser::SerializeMap for &mut Scan {
    type Ok = ();
    type Error = Abort;
    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), Abort> {
        if key.serialize(KeyProbe).is_err() {
            self.record(Finding::NonStringKey);
        }
        Ok(())
    }
    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        self.child(value);
        Ok(())
    }
    fn end(self) -> Result<(), Abort> {
        self.close();
        Ok(())
    }
}

impl ser::SerializeStruct for &mut Scan {
    type Ok = ();
    type Error = Abort;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Abort> {
        self.child(value);
        Ok(())
    }
    fn end(self) -> Result<(), Abort> {
        self.close();
        Ok(())
    }
}

impl ser::SerializeStructVariant for &mut Scan {
    type Ok = ();
    type Error = Abort;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Abort> {
        self.child(value);
        Ok(())
    }
    fn end(self) -> Result<(), Abort> {
        self.close();
        Ok(())
    }
}

/// Accepts the key shapes `serde_json` writes natively: strings, chars,
/// integers up to 64 bits and unit variants.
struct KeyProbe;

macro_rules! reject_key {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method(self, _: $ty) -> Result<(), Abort> {
                Err(Abort::NotAKey)
            }
        )*
    };
}

macro_rules! accept_key {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method(self, _: $ty) -> Result<(), Abort> {
                Ok(())
            }
        )*
    };
}

impl ser::Serializer for KeyProbe {
    type Ok = ();
    type Error = Abort;
    type SerializeSeq = Impossible<(), Abort>;
    type SerializeTuple = Impossible<(), Abort>;
    type SerializeTupleStruct = Impossible<(), Abort>;
    type SerializeTupleVariant = Impossible<(), Abort>;
    type SerializeMap = Impossible<(), Abort>;
    type SerializeStruct = Impossible<(), Abort>;
    type SerializeStructVariant = Impossible<(), Abort>;

    accept_key! {
        serialize_i8: i8, serialize_i16: i16, serialize_i32: i32, serialize_i64: i64,
        serialize_u8: u8, serialize_u16: u16, serialize_u32: u32, serialize_u64: u64,
        serialize_char: char, serialize_str: &str,
    }

    reject_key! {
        serialize_bool: bool, serialize_i128: i128, serialize_u128: u128,
        serialize_f32: f32, serialize_f64: f64, serialize_bytes: &[u8],
        serialize_unit_struct: &'static str,
    }

    fn serialize_none(self) -> Result<(), Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_some<T: ?Sized + Serialize>(self, _: &T) -> Result<(), Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_unit(self) -> Result<(), Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<(), Abort> {
        Ok(())
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Abort> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<(), Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq, Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple, Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct, Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant, Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct, Abort> {
        Err(Abort::NotAKey)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant, Abort> {
        Err(Abort::NotAKey)
    }
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

/// Rebuilds a value as a [`Value`] tree, replacing what cannot be encoded.
#[derive(Debug, Clone, Copy)]
struct Mirror {
    depth: usize,
    max_depth: usize,
}

impl Mirror {
    const fn root(max_depth: usize) -> Self {
        Self {
            depth: 0,
            max_depth,
        }
    }

    const fn child(self) -> Self {
        Self {
            depth: self.depth + 1,
            max_depth: self.max_depth,
        }
    }

    const fn guard(self) -> Result<(), Abort> {
        if self.depth > self.max_depth {
            Err(Abort::DepthLimit)
        } else {
            Ok(())
        }
    }

    fn mirror<T: ?Sized + Serialize>(self, value: &T) -> Value {
        match value.serialize(self) {
            Ok(tree) => tree,
            Err(Abort::DepthLimit) => Value::String(MAX_DEPTH_MARKER.to_owned()),
            Err(Abort::NotAKey) => Value::String("[Unserializable: map key]".to_owned()),
            Err(Abort::Custom(message)) => Value::String(format!("[Unserializable: {message}]")),
        }
    }
}

fn wrap_variant(variant: Option<&'static str>, inner: Value) -> Value {
    match variant {
        Some(name) => {
            let mut map = Map::new();
            map.insert(name.to_owned(), inner);
            Value::Object(map)
        }
        None => inner,
    }
}

fn key_string(key: Value) -> String {
    match key {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl ser::Serializer for Mirror {
    type Ok = Value;
    type Error = Abort;
    type SerializeSeq = MirrorSeq;
    type SerializeTuple = MirrorSeq;
    type SerializeTupleStruct = MirrorSeq;
    type SerializeTupleVariant = MirrorSeq;
    type SerializeMap = MirrorMap;
    type SerializeStruct = MirrorMap;
    type SerializeStructVariant = MirrorMap;

    fn serialize_bool(self, v: bool) -> Result<Value, Abort> {
        self.guard()?;
        Ok(Value::Bool(v))
    }
    fn serialize_i8(self, v: i8) -> Result<Value, Abort> {
        self.serialize_i64(i64::from(v))
    }
    fn serialize_i16(self, v: i16) -> Result<Value, Abort> {
        self.serialize_i64(i64::from(v))
    }
    fn serialize_i32(self, v: i32) -> Result<Value, Abort> {
        self.serialize_i64(i64::from(v))
    }
    fn serialize_i64(self, v: i64) -> Result<Value, Abort> {
        self.guard()?;
        Ok(Value::from(v))
    }
    fn serialize_i128(self, v: i128) -> Result<Value, Abort> {
        self.guard()?;
        Ok(i64::try_from(v).map_or_else(|_| Value::String(v.to_string()), Value::from))
    }
    fn serialize_u8(self, v: u8) -> Result<Value, Abort> {
        self.serialize_u64(u64::from(v))
    }
    fn serialize_u16(self, v: u16) -> Result<Value, Abort> {
        self.serialize_u64(u64::from(v))
    }
    fn serialize_u32(self, v: u32) -> Result<Value, Abort> {
        self.serialize_u64(u64::from(v))
    }
    fn serialize_u64(self, v: u64) -> Result<Value, Abort> {
        self.guard()?;
        Ok(Value::from(v))
    }
    fn serialize_u128(self, v: u128) -> Result<Value, Abort> {
        self.guard()?;
        Ok(u64::try_from(v).map_or_else(|_| Value::String(v.to_string()), Value::from))
    }
    fn serialize_f32(self, v: f32) -> Result<Value, Abort> {
        self.serialize_f64(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Result<Value, Abort> {
        self.guard()?;
        Ok(Number::from_f64(v).map_or(Value::Null, Value::Number))
    }
    fn serialize_char(self, v: char) -> Result<Value, Abort> {
        self.guard()?;
        Ok(Value::String(v.to_string()))
    }
    fn serialize_str(self, v: &str) -> Result<Value, Abort> {
        self.guard()?;
        Ok(Value::String(v.to_owned()))
    }
    fn serialize_bytes(self, v: &[u8]) -> Result<Value, Abort> {
        self.guard()?;
        Ok(Value::Array(v.iter().map(|&b| Value::from(b)).collect()))
    }
    fn serialize_none(self) -> Result<Value, Abort> {
        self.serialize_unit()
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Value, Abort> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<Value, Abort> {
        self.guard()?;
        Ok(Value::Null)
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<Value, Abort> {
        self.serialize_unit()
    }
    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
    ) -> Result<Value, Abort> {
        self.serialize_str(variant)
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<Value, Abort> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, Abort> {
        self.guard()?;
        Ok(wrap_variant(Some(variant), self.child().mirror(value)))
    }
    fn serialize_seq(self, len: Option<usize>) -> Result<MirrorSeq, Abort> {
        self.guard()?;
        Ok(MirrorSeq {
            child: self.child(),
            items: Vec::with_capacity(len.unwrap_or(0).min(1024)),
            variant: None,
        })
    }
    fn serialize_tuple(self, len: usize) -> Result<MirrorSeq, Abort> {
        self.serialize_seq(Some(len))
    }
    fn serialize_tuple_struct(self, _: &'static str, len: usize) -> Result<MirrorSeq, Abort> {
        self.serialize_seq(Some(len))
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<MirrorSeq, Abort> {
        let mut seq = self.serialize_seq(Some(len))?;
        seq.variant = Some(variant);
        Ok(seq)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<MirrorMap, Abort> {
        self.guard()?;
        Ok(MirrorMap {
            child: self.child(),
            map: Map::new(),
            pending_key: None,
            variant: None,
        })
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<MirrorMap, Abort> {
        self.serialize_map(None)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<MirrorMap, Abort> {
        let mut map = self.serialize_map(None)?;
        map.variant = Some(variant);
        Ok(map)
    }
}

struct MirrorSeq {
    child: Mirror,
    items: Vec<Value>,
    variant: Option<&'static str>,
}

impl MirrorSeq {
    fn push<T: ?Sized + Serialize>(&mut self, value: &T) {
        let item = self.child.mirror(value);
        self.items.push(item);
    }

    fn finish(self) -> Value {
        wrap_variant(self.variant, Value::Array(self.items))
    }
}

impl ser::SerializeSeq for MirrorSeq {
    type Ok = Value;
    type Error = Abort;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        self.push(value);
        Ok(())
    }
    fn end(self) -> Result<Value, Abort> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for MirrorSeq {
    type Ok = Value;
    type Error = Abort;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        self.push(value);
        Ok(())
    }
    fn end(self) -> Result<Value, Abort> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for MirrorSeq {
    type Ok = Value;
    type Error = Abort;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        self.push(value);
        Ok(())
    }
    fn end(self) -> Result<Value, Abort> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleVariant for MirrorSeq {
    type Ok = Value;
    type Error = Abort;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        self.push(value);
        Ok(())
    }
    fn end(self) -> Result<Value, Abort> {
        Ok(self.finish())
    }
}

struct MirrorMap {
    child: Mirror,
    map: Map<String, Value>,
    pending_key: Option<String>,
    variant: Option<&'static str>,
}

impl MirrorMap {
    fn insert<T: ?Sized + Serialize>(&mut self, key: String, value: &T) {
        let item = self.child.mirror(value);
        self.map.insert(key, item);
    }

    fn finish(self) -> Value {
        wrap_variant(self.variant, Value::Object(self.map))
    }
}

impl ser::SerializeMap for MirrorMap {
    type Ok = Value;
    type Error = Abort;
    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), Abort> {
        self.pending_key = Some(key_string(self.child.mirror(key)));
        Ok(())
    }
    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Abort> {
        let key = self.pending_key.take().unwrap_or_default();
        self.insert(key, value);
        Ok(())
    }
    fn end(self) -> Result<Value, Abort> {
        Ok(self.finish())
    }
}

impl ser::SerializeStruct for MirrorMap {
    type Ok = Value;
    type Error = Abort;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Abort> {
        self.insert(key.to_owned(), value);
        Ok(())
    }
    fn end(self) -> Result<Value, Abort> {
        Ok(self.finish())
    }
}

impl ser::SerializeStructVariant for MirrorMap {
    type Ok = Value;
    type Error = Abort;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Abort> {
        self.insert(key.to_owned(), value);
        Ok(())
    }
    fn end(self) -> Result<Value, Abort> {
        Ok(self.finish())
    }
}
