//! Configuration types for the DIMSE client

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DimseError, Result};
use crate::DEFAULT_DIMSE_PORT;

/// Options that shape how a [`DicomClient`](crate::DicomClient) schedules its requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Local (calling) Application Entity Title
    #[serde(default = "default_calling_aet")]
    pub calling_aet: String,

    /// How long to wait for an association accept/reject, in milliseconds
    #[serde(default = "default_association_request_timeout")]
    pub association_request_timeout_ms: u64,

    /// How long to wait for an association release response, in milliseconds
    #[serde(default = "default_association_release_timeout")]
    pub association_release_timeout_ms: u64,

    /// How long to wait for an abort to be written, in milliseconds
    #[serde(default = "default_association_abort_timeout")]
    pub association_abort_timeout_ms: u64,

    /// How long an idle association stays open waiting for new requests, in milliseconds
    #[serde(default = "default_association_linger_timeout")]
    pub association_linger_timeout_ms: u64,

    /// Upper bound on requests carried by a single association (unbounded when absent)
    #[serde(default)]
    pub max_requests_per_association: Option<usize>,

    /// Consecutive association request timeouts tolerated before giving up
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timed_out_association_requests: u32,

    /// Default per-request timeout in milliseconds (no timeout when absent)
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Disable Nagle's algorithm on outgoing connections
    #[serde(default = "default_true")]
    pub tcp_no_delay: bool,

    /// User identity negotiation (optional)
    #[serde(default)]
    pub user_identity: Option<UserIdentityOptions>,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote (called) Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use TLS for this connection
    #[serde(default)]
    pub use_tls: bool,

    /// Connection timeout in milliseconds (overrides the client setting)
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides the client setting)
    pub max_pdu: Option<u32>,
}

/// User identity sub-item proposed during association negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentityOptions {
    /// Kind of identity being asserted
    pub kind: UserIdentityType,

    /// Username, Kerberos ticket, SAML assertion or JWT
    pub primary_field: String,

    /// Passcode (only for `UsernameAndPasscode`)
    #[serde(default)]
    pub secondary_field: Option<String>,

    /// Whether a positive server response is requested, and how strictly
    #[serde(default)]
    pub response: IdentityResponsePolicy,
}

/// User identity types from PS3.7 D.3.3.7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserIdentityType {
    Username,
    UsernameAndPasscode,
    Kerberos,
    Saml,
    Jwt,
}

/// How the client reacts when the peer omits the user identity server response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityResponsePolicy {
    /// No positive response is requested
    #[default]
    NotRequested,
    /// A response is requested; its absence is logged and tolerated
    Optional,
    /// A response is requested; its absence fails the association
    Required,
}

impl UserIdentityType {
    /// Wire value of the user identity type field
    pub fn code(self) -> u8 {
        match self {
            UserIdentityType::Username => 1,
            UserIdentityType::UsernameAndPasscode => 2,
            UserIdentityType::Kerberos => 3,
            UserIdentityType::Saml => 4,
            UserIdentityType::Jwt => 5,
        }
    }
}

impl UserIdentityOptions {
    /// Whether the proposal asks the peer for a positive response
    pub fn positive_response_requested(&self) -> bool {
        self.response != IdentityResponsePolicy::NotRequested
    }

    fn validate(&self) -> Result<()> {
        if self.primary_field.is_empty() {
            return Err(DimseError::config("User identity primary field cannot be empty"));
        }
        match (self.kind, &self.secondary_field) {
            (UserIdentityType::UsernameAndPasscode, None) => Err(DimseError::config(
                "User identity of type username_and_passcode requires a secondary field",
            )),
            (UserIdentityType::UsernameAndPasscode, Some(_)) | (_, None) => Ok(()),
            (_, Some(_)) => Err(DimseError::config(
                "Only username_and_passcode identities carry a secondary field",
            )),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            calling_aet: default_calling_aet(),
            association_request_timeout_ms: default_association_request_timeout(),
            association_release_timeout_ms: default_association_release_timeout(),
            association_abort_timeout_ms: default_association_abort_timeout(),
            association_linger_timeout_ms: default_association_linger_timeout(),
            max_requests_per_association: None,
            max_consecutive_timed_out_association_requests: default_max_consecutive_timeouts(),
            request_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout(),
            max_pdu: default_max_pdu(),
            tcp_no_delay: true,
            user_identity: None,
        }
    }
}

impl ClientOptions {
    /// Get association request timeout as Duration
    pub fn association_request_timeout(&self) -> Duration {
        Duration::from_millis(self.association_request_timeout_ms)
    }

    /// Get association release timeout as Duration
    pub fn association_release_timeout(&self) -> Duration {
        Duration::from_millis(self.association_release_timeout_ms)
    }

    /// Get association abort timeout as Duration
    pub fn association_abort_timeout(&self) -> Duration {
        Duration::from_millis(self.association_abort_timeout_ms)
    }

    /// Get linger duration; zero disables lingering
    pub fn association_linger_timeout(&self) -> Duration {
        Duration::from_millis(self.association_linger_timeout_ms)
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the default per-request timeout
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Requests one association may carry, `usize::MAX` when unbounded
    pub fn request_limit(&self) -> usize {
        self.max_requests_per_association.unwrap_or(usize::MAX)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.calling_aet, "Calling")?;

        if self.max_consecutive_timed_out_association_requests == 0 {
            return Err(DimseError::config(
                "Maximum consecutive timed out association requests must be greater than 0",
            ));
        }

        if self.max_requests_per_association == Some(0) {
            return Err(DimseError::config(
                "Maximum requests per association must be greater than 0",
            ));
        }

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        if let Some(identity) = &self.user_identity {
            identity.validate()?;
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            use_tls: false,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Enable TLS for this node
    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Connection timeout for this node, falling back to the client setting
    pub fn connect_timeout(&self, options: &ClientOptions) -> Duration {
        self.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| options.connect_timeout())
    }

    /// Maximum PDU size for this node, falling back to the client setting
    pub fn max_pdu(&self, options: &ClientOptions) -> u32 {
        self.max_pdu.unwrap_or(options.max_pdu)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title, "Remote")?;

        if self.host.is_empty() {
            return Err(DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(DimseError::config("Remote port must be greater than 0"));
        }

        Ok(())
    }
}

fn validate_ae_title(aet: &str, role: &str) -> Result<()> {
    if aet.trim().is_empty() || aet.len() > 16 {
        return Err(DimseError::InvalidAeTitle(format!(
            "{} AE title must be 1-16 characters, got {:?}",
            role, aet
        )));
    }
    if aet.contains('\\') || aet.chars().any(|c| c.is_control()) {
        return Err(DimseError::InvalidAeTitle(format!(
            "{} AE title contains forbidden characters: {:?}",
            role, aet
        )));
    }
    Ok(())
}

// Default value functions
fn default_calling_aet() -> String {
    "COURIER_SCU".to_string()
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_association_request_timeout() -> u64 {
    5_000
}

fn default_association_release_timeout() -> u64 {
    10_000
}

fn default_association_abort_timeout() -> u64 {
    100
}

fn default_association_linger_timeout() -> u64 {
    50
}

fn default_max_consecutive_timeouts() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_true() -> bool {
    true
}
