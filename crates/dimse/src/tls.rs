//! TLS support for DIMSE connections
//!
//! Wraps [`TcpConnector`] and upgrades connections to nodes flagged with
//! `use_tls`. Trust anchors come from a PEM bundle.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::association::{Connection, Connector};
use crate::config::RemoteNode;
use crate::transport::TcpConnector;
use crate::{DimseError, Result};

/// Connector that speaks TLS to nodes which require it
pub struct TlsConnector {
    tcp: TcpConnector,
    tls: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Build a connector trusting the certificates in `ca_bundle_path`
    pub fn from_ca_bundle(tcp: TcpConnector, ca_bundle_path: &Path) -> Result<Self> {
        let file = File::open(ca_bundle_path).map_err(|e| {
            DimseError::config(format!(
                "Failed to open CA bundle {:?}: {}",
                ca_bundle_path, e
            ))
        })?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            roots.add(cert?)?;
        }
        if roots.is_empty() {
            return Err(DimseError::config(format!(
                "CA bundle {:?} contains no certificates",
                ca_bundle_path
            )));
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tcp,
            tls: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, node: &RemoteNode, cancel: CancellationToken) -> Result<Connection> {
        let stream = self.tcp.open_stream(node, &cancel).await?;
        if !node.use_tls {
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(node.host.clone()).map_err(|e| {
            DimseError::config(format!("Invalid TLS server name {:?}: {}", node.host, e))
        })?;

        debug!("Starting TLS handshake with {}", node.host);
        let tls_stream = tokio::select! {
            _ = cancel.cancelled() => return Err(DimseError::Cancelled),
            handshake = self.tls.connect(server_name, stream) => handshake?,
        };

        Ok(Box::new(tls_stream))
    }
}
