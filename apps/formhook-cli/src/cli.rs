//! Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "formhook",
    about = "Formhook webhook delivery engine",
    version,
    long_about = "Register form webhooks, trigger events, and inspect \
                  signed deliveries with retry and backoff."
)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FORMHOOK_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Enable JSON log format (useful for production)
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Output format (text, json)
    #[arg(
        short,
        long,
        default_value = "text",
        value_parser = ["text", "json"]
    )]
    pub format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List registered webhooks
    List {
        /// Only show webhooks of this form
        #[arg(long)]
        form_id: Option<String>,
    },

    /// Register a webhook
    Register {
        /// Form the webhook belongs to
        #[arg(long)]
        form_id: String,

        /// Target URL (http or https)
        #[arg(long)]
        url: String,

        /// Subscribed event, repeatable (e.g. submission.created)
        #[arg(short, long = "event", required = true)]
        events: Vec<String>,

        /// Signing secret; generated when omitted
        #[arg(long)]
        secret: Option<String>,

        /// Send deliveries unsigned
        #[arg(long, conflicts_with = "secret")]
        unsigned: bool,

        /// Static header, repeatable (Name=value)
        #[arg(long = "header")]
        headers: Vec<String>,
    },

    /// Remove a webhook
    Remove {
        /// Webhook ID
        id: String,
    },

    /// Send a test delivery to a webhook
    Test {
        /// Webhook ID
        id: String,
    },

    /// Trigger an event and wait for its deliveries to settle
    Trigger {
        /// Form the event belongs to
        #[arg(long)]
        form_id: String,

        /// Event name (e.g. submission.created)
        #[arg(long)]
        event: String,

        /// Event data as JSON
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Print a new signing secret
    GenerateSecret,
}

impl Args {
    /// Validate the arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.config {
            if !path.exists() {
                anyhow::bail!("Configuration file not found: {}", path.display());
            }
        }
        Ok(())
    }
}
