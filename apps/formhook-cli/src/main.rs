//! Formhook CLI
//!
//! Operates the webhook delivery engine from the command line: manage
//! registrations, fire events, and send test deliveries.

mod cli;
mod commands;
mod output;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use formhook_core::AppConfig;
use formhook_webhook::{generate_webhook_secret, WebhookService};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use crate::cli::{Args, Command};
use crate::commands::Registration;
use crate::output::OutputFormat;
use crate::telemetry::init_telemetry;

/// Registry file used when `storage.path` is not configured
const DEFAULT_STORE_PATH: &str = "formhook.json";

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let args = Args::parse();

    if let Err(e) = init_telemetry(&args) {
        output::error(&format!("{:#}", e));
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Command failed: {:#}", e);
            output::error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    args.validate()?;

    let format: OutputFormat = args.format.parse().map_err(anyhow::Error::msg)?;

    // Needs neither configuration nor a running service
    if matches!(args.command, Command::GenerateSecret) {
        println!("{}", generate_webhook_secret());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => AppConfig::load_from_file(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;
    let config = with_default_storage(config);

    let service = WebhookService::from_config(&config)
        .await
        .context("Failed to start webhook service")?;

    let result = tokio::select! {
        result = execute(&service, args.command, format) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling pending deliveries");
            Ok(())
        }
    };

    service.shutdown().await;
    result
}

/// Registrations must outlive a single invocation, so the CLI always uses a
/// file-backed registry
fn with_default_storage(mut config: AppConfig) -> AppConfig {
    if config.storage.path.is_none() {
        info!(path = DEFAULT_STORE_PATH, "No storage path configured, using default");
        config.storage.path = Some(PathBuf::from(DEFAULT_STORE_PATH));
    }
    config
}

async fn execute(service: &WebhookService, command: Command, format: OutputFormat) -> Result<()> {
    match command {
        Command::List { form_id } => commands::list(service, form_id.as_deref(), format),
        Command::Register {
            form_id,
            url,
            events,
            secret,
            unsigned,
            headers,
        } => {
            let registration = Registration {
                form_id,
                url,
                events,
                secret,
                unsigned,
                headers,
            };
            commands::register(service, registration, format).await
        }
        Command::Remove { id } => commands::remove(service, &id).await,
        Command::Test { id } => commands::test(service, &id, format).await,
        Command::Trigger {
            form_id,
            event,
            data,
        } => commands::trigger(service, &form_id, &event, &data, format).await,
        Command::GenerateSecret => {
            println!("{}", generate_webhook_secret());
            Ok(())
        }
    }
}
