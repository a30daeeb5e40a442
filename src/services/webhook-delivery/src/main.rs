//! Main binary entry point for the AI-CORE Webhook Delivery Service
//!
//! Runs the delivery worker pool together with the operational HTTP server
//! (`/health`, `/metrics`).

use anyhow::Context;
use clap::Parser;
use std::process;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use webhook_delivery_service::config::CONFIG_FILE_ENV;
use webhook_delivery_service::{WebhookDeliveryConfig, WebhookService};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "webhook-delivery-server", version, about)]
struct Args {
    /// Configuration file, layered between defaults and environment variables
    #[arg(short, long, env = CONFIG_FILE_ENV)]
    config: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env file: {}", e);
        }
    }
    let args = Args::parse();

    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize tracing: {}", e);
        process::exit(1);
    }

    info!(
        "Starting AI-CORE Webhook Delivery Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(args).await {
        error!("Webhook delivery service failed: {:#}", e);
        process::exit(1);
    }

    info!("AI-CORE Webhook Delivery Service shutdown complete");
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = WebhookDeliveryConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;
    log_configuration(&config);

    if args.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let service = WebhookService::new(config)
        .await
        .context("Failed to initialize service")?;
    service.start().await.context("Service error")?;
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let log_level =
        std::env::var("WEBHOOK_DELIVERY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_format =
        std::env::var("WEBHOOK_DELIVERY_LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log_level))
        .or_else(|_| EnvFilter::try_new("info"))?;

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        "pretty" | "text" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_file(true)
                        .with_line_number(true)
                        .with_thread_ids(true)
                        .with_target(false),
                )
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()?;
        }
    }

    Ok(())
}

/// Log the backends and limits this process runs with
fn log_configuration(config: &WebhookDeliveryConfig) {
    if config.database.enabled {
        info!(max_connections = config.database.max_connections, "Store: PostgreSQL");
    } else {
        warn!("Store: in-memory (records are lost on restart)");
    }

    if config.redis.enabled {
        info!(
            key_prefix = %config.redis.key_prefix,
            visibility_timeout = config.redis.visibility_timeout,
            "Queue: Redis"
        );
    } else {
        warn!("Queue: in-memory (jobs are lost on restart)");
    }

    if config.worker.enabled {
        info!(
            concurrency = config.worker.concurrency,
            request_timeout = config.delivery.request_timeout,
            "Worker pool enabled"
        );
    } else {
        info!("Worker pool disabled; this process only serves health and metrics");
    }

    if config.registry.require_https {
        info!("HTTPS required for endpoint URLs");
    }

    info!(
        max_attempts = config.retry.max_attempts,
        strategy = ?config.retry.backoff_strategy,
        initial_delay_ms = config.retry.initial_delay_ms,
        max_delay_ms = config.retry.max_delay_ms,
        "Default retry policy"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["webhook-delivery-server", "--check-config"]);
        assert!(args.check_config);
    }

    #[test]
    fn test_log_configuration() {
        log_configuration(&WebhookDeliveryConfig::default());
    }
}
