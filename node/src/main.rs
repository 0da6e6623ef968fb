use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use scopenode::cache::MetadataCache;
use scopenode::config::AppConfig;
use scopenode::db::{self, Registry};
use scopenode::mdns;
use scopenode::notify::{Notifier, NullNotifier, WebhookNotifier};
use scopenode::retention;
use scopenode::scanner::{AppContext, Scanner};
use tracing::info;

/// Scopenode — node-side controller for behavioural acquisition devices.
#[derive(Parser, Debug)]
#[command(name = "scopenode", version, about)]
struct Cli {
    /// Path to the registry SQLite database file.
    #[arg(short, long, default_value = "scopenode.db")]
    db: String,

    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    config: Option<String>,

    /// Override the results directory.
    #[arg(long)]
    results_dir: Option<String>,

    /// Override the metadata cache directory.
    #[arg(long)]
    cache_dir: Option<String>,
}

const BANNER: &str = r#"
  ___                                   _
 / __| __ ___ _ __  ___ _ _  ___  __| |___
 \__ \/ _/ _ \ '_ \/ -_) ' \/ _ \/ _` / -_)
 |___/\__\___/ .__/\___|_||_\___/\__,_\___|
             |_|
"#;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scopenode=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    println!("{BANNER}");
    info!(version = env!("CARGO_PKG_VERSION"), "Starting scopenode");

    let mut config = if let Some(ref path) = cli.config {
        AppConfig::from_file(path)?
    } else {
        AppConfig::default()
    };
    if let Some(results_dir) = cli.results_dir {
        config.node.results_dir = results_dir;
    }
    if let Some(cache_dir) = cli.cache_dir {
        config.node.cache_dir = cache_dir;
    }

    let registry = Registry::open(&cli.db).await?;
    info!(path = %cli.db, "Registry initialized");

    // Users kept in a pre-registry flat config file are imported once.
    let legacy_users = Path::new(&config.node.config_dir).join("users.json");
    db::migrate_legacy_users(registry.pool(), &legacy_users).await?;

    let notifier: Arc<dyn Notifier> = match &config.alerts.webhook_url {
        Some(url) if !url.is_empty() => {
            info!(url = %url, "Alert webhook configured");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        _ => {
            info!("No alert transport configured");
            Arc::new(NullNotifier)
        }
    };

    let cache = MetadataCache::new(&config.node.cache_dir);
    let ctx = AppContext::new(config.clone(), registry.clone(), cache, notifier);

    retention::start_maintenance_task(registry, config.retention.clone());

    let events = mdns::start_browser(mdns::SERVICE_TYPE)?;
    let scanner = Arc::new(Scanner::new(ctx));
    let runner = scanner.clone();
    tokio::spawn(async move {
        runner.run(events).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scanner.stop().await;

    Ok(())
}
