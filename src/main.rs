mod api;
mod cache;
mod history;
mod lid;
mod presence;
mod qr;
mod service;
mod spa;
mod tenant;
#[cfg(test)]
mod testutil;
mod translate;
mod wakeup;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use quepasa_core::config::Config;
use quepasa_core::error::QpError;
use quepasa_core::wcl::{WclEvent, WclFactory, WhatsappClient};
use quepasa_store::Store;
use service::GatewayService;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "quepasa",
    version,
    about = "QuePasa — multi-tenant WhatsApp HTTP gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway: load tenants, reconnect verified ones, serve HTTP.
    Start,
    /// Print the resolved configuration and tenant counts, then exit.
    Status,
}

/// Stand-in for a real WhatsApp client binding. The gateway is written
/// against the [`WhatsappClient`] trait; linking a concrete binding means
/// replacing this factory in `main` and nothing else.
struct UnconfiguredFactory;

#[async_trait]
impl WclFactory for UnconfiguredFactory {
    async fn create(
        &self,
        token: &str,
        _events: mpsc::Sender<WclEvent>,
    ) -> Result<Arc<dyn WhatsappClient>, QpError> {
        Err(QpError::Upstream(format!(
            "no whatsapp client binding compiled in; cannot start server {token}"
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    match cli.command {
        Commands::Start => {
            let store = Store::new(&config.database).await?;
            let factory: Arc<dyn WclFactory> = Arc::new(UnconfiguredFactory);
            let service = GatewayService::new(config, store, factory)?;

            service.startup().await?;
            service.arm_wakeup();

            let state = api::ApiState::new(service)?;
            api::serve(state).await?;
        }
        Commands::Status => {
            println!("QuePasa — Status\n");
            println!(
                "  listen: {}:{}{}",
                config.http.host, config.http.port, config.http.api_prefix
            );
            println!("  log level: {}", config.log_level);
            println!(
                "  master key: {}",
                if config.auth.master_key.is_empty() {
                    "not set"
                } else {
                    "set"
                }
            );
            println!(
                "  account setup: {}",
                if config.auth.account_setup {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!();

            let store = Store::new(&config.database).await?;
            let servers = store.list_servers().await?;
            let verified = servers.iter().filter(|s| s.verified).count();
            println!("  servers: {} ({} verified)", servers.len(), verified);
        }
    }

    Ok(())
}
