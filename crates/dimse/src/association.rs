//! Seams between the client scheduler and the upper layer protocol machinery
//!
//! The scheduler never encodes PDUs itself. It asks a [`Connector`] for a byte
//! stream, hands that stream together with an [`AssociationRequest`] to a
//! [`Negotiator`], and then drives the resulting [`Association`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{RemoteNode, UserIdentityOptions};
use crate::request::{DimseRequest, DimseResponse};
use crate::types::{DatasetStream, DimseStatus};
use crate::{DimseError, Result};

/// Most presentation contexts one A-ASSOCIATE-RQ can carry (odd IDs 1..=255)
pub const MAX_PRESENTATION_CONTEXTS: usize = 128;

/// Byte stream to a remote node
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An open transport connection
pub type Connection = Box<dyn AsyncStream>;

/// Channel on which an association reports the responses to one request
pub type ResponseSender = mpsc::UnboundedSender<Result<DimseResponse>>;

/// Opens transport connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the given node
    async fn connect(&self, node: &RemoteNode, cancel: CancellationToken) -> Result<Connection>;
}

/// Performs A-ASSOCIATE negotiation over an open connection
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Negotiate an association.
    ///
    /// A refusal from the peer must be reported as
    /// [`DimseError::AssociationRejected`](crate::DimseError::AssociationRejected).
    async fn negotiate(
        &self,
        connection: Connection,
        request: AssociationRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Association>>;
}

/// A negotiated association
///
/// Implementations own their connection exclusively and close it on
/// [`dispose`](Association::dispose).
#[async_trait]
pub trait Association: Send + Sync {
    /// Parameters accepted by the peer
    fn info(&self) -> &AssociationInfo;

    /// Whether further P-DATA can still be written on this association
    fn can_send_requests(&self) -> bool;

    /// Transmit a request.
    ///
    /// Resolves once the request has been fully written. Pending and final
    /// responses are pushed to `responses` afterwards; closing the channel
    /// without a final response signals a lost connection.
    async fn send_request(
        &self,
        request: &DimseRequest,
        responses: ResponseSender,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Send A-RELEASE-RQ and wait for A-RELEASE-RP
    async fn release(&self, cancel: CancellationToken) -> Result<()>;

    /// Send A-ABORT
    async fn abort(&self, cancel: CancellationToken) -> Result<()>;

    /// Close the underlying connection
    fn dispose(&self);
}

/// Receives C-STORE sub-operations the peer sends back on the association,
/// e.g. the instances retrieved by a C-GET
#[async_trait]
pub trait StoreHandler: Send + Sync {
    /// Store one instance and return the status for the C-STORE-RSP
    async fn on_store(&self, request: IncomingStore) -> DimseStatus;
}

/// A C-STORE request received from the peer
#[derive(Debug, Clone)]
pub struct IncomingStore {
    pub message_id: u16,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub dataset: DatasetStream,
}

/// A-ASSOCIATE-RQ parameters proposed by the client
#[derive(Clone)]
pub struct AssociationRequest {
    pub calling_ae: String,
    pub called_ae: String,
    pub max_pdu: u32,
    /// Asynchronous operations window; 0 means unlimited
    pub max_async_ops_invoked: u16,
    pub max_async_ops_performed: u16,
    pub presentation_contexts: Vec<PresentationContextProposal>,
    pub extended_negotiations: Vec<ExtendedNegotiation>,
    pub user_identity: Option<UserIdentityOptions>,
    /// Handler for C-STORE requests arriving on the association
    pub store_handler: Option<Arc<dyn StoreHandler>>,
}

/// One proposed presentation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposal {
    /// Odd context identifier, 1..=255
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
    /// SCP/SCU role selection sub-item; `None` keeps the default roles
    pub role: Option<RoleSelection>,
}

/// Roles proposed for the requestor on one abstract syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSelection {
    pub scu: bool,
    pub scp: bool,
}

/// SOP class extended negotiation sub-item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedNegotiation {
    pub sop_class_uid: String,
    /// Service class application information, as encoded for the SOP class
    pub application_info: Option<Vec<u8>>,
    pub service_class_uid: Option<String>,
    pub related_general_sop_classes: Vec<String>,
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationInfo {
    pub called_ae: String,
    pub max_pdu: u32,
    /// Operations the peer lets us have outstanding; 0 means unlimited
    pub max_async_ops_invoked: u16,
    pub accepted_abstract_syntaxes: Vec<String>,
    /// Server response to a user identity negotiation, if the peer sent one
    pub user_identity_response: Option<Vec<u8>>,
}

/// A-ASSOCIATE-RJ parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationRejection {
    pub result: RejectResult,
    pub source: RejectSource,
    pub reason: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectResult {
    Permanent,
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectSource {
    ServiceUser,
    ServiceProviderAcse,
    ServiceProviderPresentation,
}

impl AssociationRequest {
    /// Create an empty proposal between two AE titles
    pub fn new(calling_ae: impl Into<String>, called_ae: impl Into<String>) -> Self {
        Self {
            calling_ae: calling_ae.into(),
            called_ae: called_ae.into(),
            max_pdu: 65536,
            max_async_ops_invoked: 1,
            max_async_ops_performed: 1,
            presentation_contexts: Vec::new(),
            extended_negotiations: Vec::new(),
            user_identity: None,
            store_handler: None,
        }
    }

    /// Propose an abstract syntax, merging transfer syntaxes if it is already present
    ///
    /// Returns the context ID. Fails once [`MAX_PRESENTATION_CONTEXTS`]
    /// distinct abstract syntaxes are proposed.
    pub fn add_presentation_context<S: AsRef<str>>(
        &mut self,
        abstract_syntax: &str,
        transfer_syntaxes: &[S],
    ) -> Result<u8> {
        self.add_presentation_context_with_role(abstract_syntax, None, transfer_syntaxes)
    }

    /// Like [`add_presentation_context`](Self::add_presentation_context), also
    /// proposing SCU/SCP roles. A role given here replaces an earlier one.
    pub fn add_presentation_context_with_role<S: AsRef<str>>(
        &mut self,
        abstract_syntax: &str,
        role: Option<RoleSelection>,
        transfer_syntaxes: &[S],
    ) -> Result<u8> {
        if let Some(existing) = self
            .presentation_contexts
            .iter_mut()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
        {
            for ts in transfer_syntaxes {
                let ts: &str = ts.as_ref();
                if !existing.transfer_syntaxes.iter().any(|t| t.as_str() == ts) {
                    existing.transfer_syntaxes.push(ts.to_string());
                }
            }
            if role.is_some() {
                existing.role = role;
            }
            return Ok(existing.id);
        }

        let count = self.presentation_contexts.len();
        if count >= MAX_PRESENTATION_CONTEXTS {
            return Err(DimseError::config(format!(
                "cannot propose {}: an association carries at most {} presentation contexts",
                abstract_syntax, MAX_PRESENTATION_CONTEXTS
            )));
        }

        // Odd IDs 1, 3, .., 255
        let id = u8::try_from(count * 2 + 1)
            .map_err(|_| DimseError::internal("presentation context ID out of range"))?;
        self.presentation_contexts.push(PresentationContextProposal {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes
                .iter()
                .map(|ts| AsRef::<str>::as_ref(ts).to_string())
                .collect(),
            role,
        });
        Ok(id)
    }

    /// Whether another new abstract syntax still fits in the proposal
    pub fn has_room(&self) -> bool {
        self.presentation_contexts.len() < MAX_PRESENTATION_CONTEXTS
    }

    /// Add an extended negotiation item, merging with one for the same SOP class
    ///
    /// Values present on `negotiation` win over those already proposed.
    pub fn add_extended_negotiation(&mut self, negotiation: ExtendedNegotiation) {
        let Some(existing) = self
            .extended_negotiations
            .iter_mut()
            .find(|en| en.sop_class_uid == negotiation.sop_class_uid)
        else {
            self.extended_negotiations.push(negotiation);
            return;
        };

        if negotiation.application_info.is_some() {
            existing.application_info = negotiation.application_info;
        }
        if negotiation.service_class_uid.is_some() {
            existing.service_class_uid = negotiation.service_class_uid;
        }
        if !negotiation.related_general_sop_classes.is_empty() {
            existing.related_general_sop_classes = negotiation.related_general_sop_classes;
        }
    }

    /// Extended negotiation proposed for a SOP class
    pub fn extended_negotiation(&self, sop_class_uid: &str) -> Option<&ExtendedNegotiation> {
        self.extended_negotiations
            .iter()
            .find(|en| en.sop_class_uid == sop_class_uid)
    }

    /// Whether an abstract syntax is part of the proposal
    pub fn proposes(&self, abstract_syntax: &str) -> bool {
        self.presentation_contexts
            .iter()
            .any(|pc| pc.abstract_syntax == abstract_syntax)
    }
}

impl fmt::Debug for AssociationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationRequest")
            .field("calling_ae", &self.calling_ae)
            .field("called_ae", &self.called_ae)
            .field("max_pdu", &self.max_pdu)
            .field("max_async_ops_invoked", &self.max_async_ops_invoked)
            .field("max_async_ops_performed", &self.max_async_ops_performed)
            .field("presentation_contexts", &self.presentation_contexts)
            .field("extended_negotiations", &self.extended_negotiations)
            .field("user_identity", &self.user_identity)
            .field("store_handler", &self.store_handler.is_some())
            .finish()
    }
}

impl RoleSelection {
    /// Requestor acts as SCU only
    pub fn scu() -> Self {
        Self {
            scu: true,
            scp: false,
        }
    }

    /// Requestor acts as SCP only, e.g. for storage contexts used by C-GET
    pub fn scp() -> Self {
        Self {
            scu: false,
            scp: true,
        }
    }

    pub fn both() -> Self {
        Self {
            scu: true,
            scp: true,
        }
    }
}

impl ExtendedNegotiation {
    /// Item carrying service class application information
    pub fn new(sop_class_uid: impl Into<String>, application_info: Vec<u8>) -> Self {
        Self {
            sop_class_uid: sop_class_uid.into(),
            application_info: Some(application_info),
            ..Default::default()
        }
    }

    /// Declare the common service class and related general SOP classes
    pub fn with_service_class(
        mut self,
        service_class_uid: impl Into<String>,
        related_general_sop_classes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.service_class_uid = Some(service_class_uid.into());
        self.related_general_sop_classes = related_general_sop_classes
            .into_iter()
            .map(Into::into)
            .collect();
        self
    }
}

impl AssociationInfo {
    /// Upper bound on requests outstanding at once
    pub fn concurrency_limit(&self) -> usize {
        match self.max_async_ops_invoked {
            0 => usize::MAX,
            n => n as usize,
        }
    }
}

impl AssociationRejection {
    pub fn new(result: RejectResult, source: RejectSource, reason: u8) -> Self {
        Self {
            result,
            source,
            reason,
        }
    }

    /// Human readable reason as listed in PS3.8 Table 9-21
    pub fn reason_text(&self) -> &'static str {
        match (self.source, self.reason) {
            (RejectSource::ServiceUser, 1) => "no reason given",
            (RejectSource::ServiceUser, 2) => "application context name not supported",
            (RejectSource::ServiceUser, 3) => "calling AE title not recognized",
            (RejectSource::ServiceUser, 7) => "called AE title not recognized",
            (RejectSource::ServiceProviderAcse, 1) => "no reason given",
            (RejectSource::ServiceProviderAcse, 2) => "protocol version not supported",
            (RejectSource::ServiceProviderPresentation, 1) => "temporary congestion",
            (RejectSource::ServiceProviderPresentation, 2) => "local limit exceeded",
            _ => "unknown reason",
        }
    }
}

impl fmt::Display for AssociationRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self.result {
            RejectResult::Permanent => "permanent",
            RejectResult::Transient => "transient",
        };
        let source = match self.source {
            RejectSource::ServiceUser => "service user",
            RejectSource::ServiceProviderAcse => "service provider (ACSE)",
            RejectSource::ServiceProviderPresentation => "service provider (presentation)",
        };
        write!(
            f,
            "{} rejection by {}: {} ({})",
            result,
            source,
            self.reason_text(),
            self.reason
        )
    }
}
