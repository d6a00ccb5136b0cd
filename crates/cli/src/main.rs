use std::process::ExitCode;

use clap::Parser;

use simbridge_cli::Cli;
use simbridge_observability::tracing::LogFormat;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout stays machine-readable.
    simbridge_observability::tracing::init_with(LogFormat::Pretty);

    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr().lock();
    match simbridge_cli::execute(cli, &mut stdout, &mut stderr).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
