use std::process::ExitCode;

use clap::Parser;
use presence_kiosk::config::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match presence_kiosk::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "presence-kiosk exited with error");
            ExitCode::FAILURE
        }
    }
}
