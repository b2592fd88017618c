pub mod config;

use std::sync::Arc;

use anyhow::Context;
use dimse::{Connector, DicomClient, Negotiator, TcpConnector};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::{Config, ConfigError, LoggingConfig};

pub use dimse;

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    if logging.log_to_file {
        let file = std::fs::File::create(&logging.log_file_path)
            .with_context(|| format!("Failed to create log file {}", logging.log_file_path))?;
        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .with_filter(filter());

        tracing_subscriber::registry()
            .with(file_appender)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_filter(filter()),
            )
            .try_init()
            .context("Failed to initialize logging")?;
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_filter(filter()),
            )
            .try_init()
            .context("Failed to initialize logging")?;
    }

    Ok(())
}

/// Connector matching the remote's transport settings
pub fn connector_for(config: &Config) -> Result<Arc<dyn Connector>, ConfigError> {
    let tcp = TcpConnector::new(&config.client);
    if config.remote.use_tls {
        return tls_connector(config, tcp);
    }
    Ok(Arc::new(tcp))
}

#[cfg(feature = "tls")]
fn tls_connector(config: &Config, tcp: TcpConnector) -> Result<Arc<dyn Connector>, ConfigError> {
    let tls = config
        .tls
        .as_ref()
        .ok_or_else(|| ConfigError::MissingTls(config.remote.ae_title.clone()))?;
    let connector = dimse::TlsConnector::from_ca_bundle(tcp, &tls.ca_bundle_path)?;
    Ok(Arc::new(connector))
}

#[cfg(not(feature = "tls"))]
fn tls_connector(config: &Config, _tcp: TcpConnector) -> Result<Arc<dyn Connector>, ConfigError> {
    Err(ConfigError::Client(dimse::DimseError::config(format!(
        "{} requires TLS but courier was built without the tls feature",
        config.remote.ae_title
    ))))
}

/// Build a client for the configured remote
pub fn build_client(
    config: &Config,
    negotiator: Arc<dyn Negotiator>,
) -> Result<DicomClient, ConfigError> {
    config.validate()?;
    let connector = connector_for(config)?;

    tracing::info!(
        "Client {} -> {}@{}:{}",
        config.client.calling_aet,
        config.remote.ae_title,
        config.remote.host,
        config.remote.port
    );

    let client = DicomClient::builder(config.remote.clone())
        .options(config.client.clone())
        .connector(connector)
        .negotiator(negotiator)
        .build()?;
    Ok(client)
}

/// Token cancelled when the process receives Ctrl-C
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("Interrupted, cancelling outstanding requests");
                cancel.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
    token
}
