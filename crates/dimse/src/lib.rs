//! DIMSE (DICOM Message Service Element) service class user
//!
//! This crate provides the client side of the DICOM upper layer protocol:
//! requests are queued on a [`DicomClient`], which opens connections,
//! negotiates associations, sends requests within the negotiated
//! asynchronous operations window and releases (or aborts) the association
//! once the queue has drained.
//!
//! # Features
//! - Queueing of C-ECHO, C-FIND, C-MOVE, C-GET and C-STORE requests
//! - Association reuse with a configurable linger period
//! - Retry of association requests that time out
//! - Graceful release or immediate abort on cancellation
//! - Role selection, extended negotiation and C-STORE sub-operations for C-GET
//! - TLS transport (optional, feature = "tls")
//!
//! PDU encoding and association negotiation content are provided by a
//! [`Negotiator`] implementation; the byte stream comes from a [`Connector`].

pub mod association;
pub mod client;
pub mod config;
pub mod error;
mod queue;
pub mod request;
pub mod session;
pub mod signal;
pub mod transport;
pub mod types;

#[cfg(feature = "tls")]
pub mod tls;

// Re-export commonly used types
pub use association::{
    Association, AssociationInfo, AssociationRejection, AssociationRequest, Connection,
    Connector, ExtendedNegotiation, IncomingStore, Negotiator, ResponseSender, RoleSelection,
    StoreHandler,
};
pub use client::{CancellationMode, ClientEvent, ClientPhase, DicomClient, DicomClientBuilder};
pub use config::{ClientOptions, RemoteNode, UserIdentityOptions};
pub use error::{DimseError, Result};
pub use request::{DimseRequest, DimseRequestPayload, DimseResponse, ResponseHandle};
pub use transport::TcpConnector;
pub use types::{DatasetStream, DimseCommand, DimseStatus};

#[cfg(feature = "tls")]
pub use tls::TlsConnector;

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Default TLS DICOM port
pub const DEFAULT_DIMSE_TLS_PORT: u16 = 2762;
