use clap::Parser;
use docverify_core::EXIT_FATAL;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod commands;
mod settings;

use cli::Cli;
use settings::{LogFormat, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()).and_then(|s| s.apply(&cli)) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    init_tracing(settings.log_format);

    match commands::execute(&cli, &settings).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Logs go to stderr so stdout carries only the report.
fn init_tracing(format: LogFormat) {
    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docverify=info,verify=info".into()),
        )
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}
