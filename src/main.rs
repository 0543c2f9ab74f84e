#![allow(missing_docs)]

//! `trio` command-line entry point.
//!
//! `send` runs one trio against the configured SQLite store and email
//! provider, with every recipient connected to an in-process push hub.
//! `check-config` prints the effective configuration.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use trio::channels::email::{HttpEmailSender, LogEmailSender};
use trio::channels::message::SqliteMessageStore;
use trio::channels::socket::BroadcastPushChannel;
use trio::channels::EmailSender;
use trio::config::TrioConfig;
use trio::{logging, TrioCoordinator, TrioDeps, TrioRequest};

#[derive(Parser)]
#[command(name = "trio", version, about = "Email, persisted message and push as one unit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one trio and print its result as JSON.
    Send {
        /// Request JSON, or `@path` to read it from a file.
        #[arg(long)]
        request: String,
        /// Log emails instead of calling the provider.
        #[arg(long)]
        offline: bool,
    },
    /// Load and validate configuration, then print it.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = TrioConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let _guard = match &config.logging.dir {
        Some(dir) => Some(logging::init_production(dir, &config.logging.level)?),
        None => {
            logging::init_cli(&config.logging.level);
            None
        }
    };

    match cli.command {
        Command::Send { request, offline } => send(&config, &request, offline).await,
        Command::CheckConfig => {
            let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
            println!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn send(config: &TrioConfig, raw: &str, offline: bool) -> Result<ExitCode> {
    let body = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("failed to read request from {path}"))?,
        None => raw.to_owned(),
    };
    let request: TrioRequest = serde_json::from_str(&body).context("invalid trio request")?;

    let store = SqliteMessageStore::connect(&config.storage.message_db)
        .await
        .with_context(|| {
            format!(
                "failed to open message database {}",
                config.storage.message_db.display()
            )
        })?;

    let email: Arc<dyn EmailSender> = match (&config.email.endpoint, offline) {
        (Some(endpoint), false) => Arc::new(HttpEmailSender::from_config(endpoint, &config.email)),
        _ => {
            info!("no email provider in use, emails are logged only");
            Arc::new(LogEmailSender)
        }
    };

    let hub = Arc::new(BroadcastPushChannel::new());
    let mut receivers: Vec<_> = request
        .recipients
        .iter()
        .map(|r| (r.clone(), hub.subscribe(r)))
        .collect();

    let coordinator = TrioCoordinator::new(
        TrioDeps {
            email,
            messages: Arc::new(store),
            push: hub.clone(),
        },
        config,
    );
    let result = coordinator.create_trio(request).await;

    for (recipient, rx) in &mut receivers {
        while let Ok(event) = rx.try_recv() {
            info!(recipient = %recipient, event = %event.event, "push delivered");
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("failed to render result")?
    );
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
