//! TCP transport for outgoing associations

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::association::{Connection, Connector};
use crate::config::{ClientOptions, RemoteNode};
use crate::{DimseError, Result};

/// Opens plain TCP connections
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    no_delay: bool,
}

impl TcpConnector {
    pub fn new(options: &ClientOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout(),
            no_delay: options.tcp_no_delay,
        }
    }

    /// Connect a TCP stream, honouring the node's timeout and the cancellation token
    pub async fn open_stream(
        &self,
        node: &RemoteNode,
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        let addr = format!("{}:{}", node.host, node.port);
        let timeout = node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.connect_timeout);

        debug!("Connecting to {}@{} (timeout {:?})", node.ae_title, addr, timeout);

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(DimseError::Cancelled),
            connected = tokio::time::timeout(timeout, TcpStream::connect(&addr)) => {
                match connected {
                    Ok(stream) => stream?,
                    Err(_) => {
                        return Err(DimseError::Network(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connecting to {} timed out after {:?}", addr, timeout),
                        )))
                    }
                }
            }
        };

        stream.set_nodelay(self.no_delay)?;
        if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
            warn!("Failed to enable TCP keepalive for {}: {}", addr, e);
        }

        Ok(stream)
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(&ClientOptions::default())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, node: &RemoteNode, cancel: CancellationToken) -> Result<Connection> {
        if node.use_tls {
            return Err(DimseError::config(format!(
                "{} requires TLS but the plain TCP connector is in use",
                node.ae_title
            )));
        }
        let stream = self.open_stream(node, &cancel).await?;
        Ok(Box::new(stream))
    }
}
