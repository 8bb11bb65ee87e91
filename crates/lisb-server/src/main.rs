//! LiSB - mail-filtering gateway entry point

use anyhow::{Context, Result};
use lisb_common::config::{Config, LoggingConfig};
use lisb_core::filtering::filters::{LinearModel, Model};
use lisb_core::{
    DnsSpfResolver, FilterChain, FilteringManager, ForwarderSettings, MailForwarder, Shutdown,
    SmtpRelay, SmtpServer, StorageManager,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting LiSB mail-filtering gateway...");

    let shutdown = Shutdown::new();

    // Filter state storage
    let storage = Arc::new(
        StorageManager::new(
            &config.filtering.data_dir,
            config.filtering.storing_interval(),
        )
        .await?,
    );

    // Filter chain
    let resolver = Arc::new(DnsSpfResolver::new(config.filtering.dns_timeout()));
    let model = match &config.filtering.model_path {
        Some(path) => {
            let model = LinearModel::from_file(path)
                .with_context(|| format!("Failed to load classifier model {}", path.display()))?;
            Some(Box::new(model) as Box<dyn Model>)
        }
        None => None,
    };
    let chain = FilterChain::from_config(&config.filtering, resolver, model)?;
    chain.load_state(&storage).await;

    let storage_handle = storage
        .clone()
        .spawn_daemon(chain.persisted(), shutdown.flush_token());

    let filtering = Arc::new(FilteringManager::new(&config.filtering, chain));

    // Forwarder pool; stopped explicitly once ingress has closed
    let relay = Arc::new(SmtpRelay::from_config(&config.forwarding));
    let forwarder = MailForwarder::start(
        relay,
        ForwarderSettings::from(&config.forwarding),
        &CancellationToken::new(),
    );
    info!(
        "Forwarding to {}:{}",
        config.forwarding.remote_ip, config.forwarding.remote_port
    );

    // SMTP ingress
    let smtp_server = SmtpServer::new(
        config.server.clone(),
        filtering,
        forwarder.queue(),
        shutdown.token(),
    );
    let smtp_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = smtp_server.run().await;
            if let Err(e) = &result {
                error!("SMTP server error: {:#}", e);
                shutdown.request();
            }
            result
        })
    };

    info!("LiSB gateway started successfully");

    // Wait for shutdown signal
    shutdown.wait_for_signal().await;

    // Sessions still deciding may update filter state until this returns
    let served = match smtp_handle.await {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("SMTP server task failed: {}", e)),
    };

    let undelivered = forwarder.shutdown().await;
    if undelivered > 0 {
        warn!("{} messages lost at shutdown", undelivered);
    }

    shutdown.complete();
    if let Err(e) = storage_handle.await {
        error!("Storage daemon failed: {}", e);
    }

    info!("LiSB shutdown complete");

    served
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
