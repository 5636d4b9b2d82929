use booking_session_core::cli::{self, Cli, CliError};
use booking_session_core::telemetry;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config())
        .map_err(|err| CliError::Logging(err.to_string()))?;
    cli::run(cli).await?;
    Ok(())
}
