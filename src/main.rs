//! searchlight binary entry point.

use std::io::Write;
use std::time::Duration;

use clap::Parser;
use searchlight::cli::{self, Cli};
use searchlight::logging;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace period for blocking tasks at exit; tokio's stdin reader may still be
/// parked in a read.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_json)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(run(&cli));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);

    if let Some(output) = outcome? {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{output}")?;
    }
    Ok(())
}

async fn run(cli: &Cli) -> searchlight::Result<Option<String>> {
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                on_signal.cancel();
            }
            Err(err) => warn!(error = %err, "cannot listen for interrupts"),
        }
    });

    cli::execute(cli, shutdown).await
}
