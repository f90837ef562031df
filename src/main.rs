//! Registry migrator entry point

use clap::Parser;
use registry_migrator::cli::{Args, Runner};
use registry_migrator::logging::init_tracing;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let runner = Runner::new(args, cancel);
    match runner.run().await {
        Ok(summary) => ExitCode::from(summary.exit_code()),
        Err(err) => {
            error!("❌ {}", err);
            ExitCode::from(1)
        }
    }
}
