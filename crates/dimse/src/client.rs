//! Request queue and association scheduler
//!
//! A [`DicomClient`] accumulates requests and, when [`DicomClient::send`] is
//! called, works through them on as few associations as it can:
//!
//! 1. connect and propose an association covering the queued requests
//! 2. send requests while keeping at most the negotiated number outstanding
//! 3. pick up requests queued in the meantime, lingering briefly for more
//! 4. release the association, then start over while requests remain
//!
//! Association requests that time out are retried on a fresh connection, up
//! to a configurable number of consecutive attempts. Requests pulled for an
//! attempt that never got to send them are retried first.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dicom_dictionary_std::uids;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::association::{
    AssociationInfo, AssociationRejection, AssociationRequest, Connector, ExtendedNegotiation,
    Negotiator, RoleSelection, StoreHandler, MAX_PRESENTATION_CONTEXTS,
};
use crate::config::{ClientOptions, IdentityResponsePolicy, RemoteNode};
use crate::queue::{Batch, RequestQueue};
use crate::request::{DimseRequest, DimseRequestPayload, DimseResponse};
use crate::session::ClientAssociation;
use crate::signal::ManualResetEvent;
use crate::transport::TcpConnector;
use crate::types::DimseCommand;
use crate::{DimseError, Result};

const EVENT_CAPACITY: usize = 1024;

const DEFAULT_TRANSFER_SYNTAXES: [&str; 2] = [
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
];

/// What to do with an open association when sending is cancelled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancellationMode {
    /// Stop sending new requests and release the association
    #[default]
    ReleaseAssociation,
    /// Abort the association immediately
    AbortAssociation,
}

/// Where the sending loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    Connecting,
    RequestingAssociation,
    Sending,
    Lingering,
    Releasing,
    Aborting,
}

/// Notifications published while sending
#[derive(Debug, Clone)]
pub enum ClientEvent {
    AssociationAccepted(AssociationInfo),
    AssociationRejected(AssociationRejection),
    /// The association was released or aborted and its connection closed
    AssociationReleased,
    AssociationRequestTimedOut {
        timeout: Duration,
        attempt: u32,
        max_attempts: u32,
    },
    RequestTimedOut {
        request_id: Uuid,
        message_id: u16,
        timeout: Duration,
    },
    PhaseChanged {
        from: ClientPhase,
        to: ClientPhase,
    },
}

/// Proposal settings that apply to every association
struct NegotiationSettings {
    async_ops_invoked: u16,
    async_ops_performed: u16,
    presentation_contexts: Vec<ExtraContext>,
    extended_negotiations: Vec<ExtendedNegotiation>,
    store_handler: Option<Arc<dyn StoreHandler>>,
}

/// Presentation context proposed regardless of the queued requests
struct ExtraContext {
    abstract_syntax: String,
    role: Option<RoleSelection>,
    transfer_syntaxes: Vec<String>,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            async_ops_invoked: 1,
            async_ops_performed: 1,
            presentation_contexts: Vec::new(),
            extended_negotiations: Vec::new(),
            store_handler: None,
        }
    }
}

/// Client for one remote application entity
pub struct DicomClient {
    node: RemoteNode,
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    negotiator: Arc<dyn Negotiator>,
    queue: RequestQueue,
    more_requests: ManualResetEvent,
    is_sending: AtomicBool,
    next_message_id: AtomicU16,
    negotiation: Mutex<NegotiationSettings>,
    phase: Mutex<ClientPhase>,
    events: broadcast::Sender<ClientEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the sending flag however the loop exits
struct SendingGuard<'a> {
    client: &'a DicomClient,
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.client.set_phase(ClientPhase::Idle);
        self.client.is_sending.store(false, Ordering::Release);
    }
}

impl DicomClient {
    pub fn new(
        node: RemoteNode,
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        negotiator: Arc<dyn Negotiator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            node,
            options,
            connector,
            negotiator,
            queue: RequestQueue::default(),
            more_requests: ManualResetEvent::default(),
            is_sending: AtomicBool::new(false),
            next_message_id: AtomicU16::new(1),
            negotiation: Mutex::new(NegotiationSettings::default()),
            phase: Mutex::new(ClientPhase::Idle),
            events,
        }
    }

    pub fn builder(node: RemoteNode) -> DicomClientBuilder {
        DicomClientBuilder::new(node)
    }

    pub fn node(&self) -> &RemoteNode {
        &self.node
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Queue a request; it is sent by the next (or current) call to [`send`](Self::send)
    pub fn add_request(&self, mut request: DimseRequest) {
        self.prepare(&mut request);
        debug!("Queued {}", request);
        self.queue.push(request);
        self.more_requests.set();
    }

    /// Queue several requests, keeping their order
    pub fn add_requests(&self, requests: impl IntoIterator<Item = DimseRequest>) {
        let requests: Vec<DimseRequest> = requests
            .into_iter()
            .map(|mut request| {
                self.prepare(&mut request);
                request
            })
            .collect();
        if requests.is_empty() {
            return;
        }
        debug!("Queued {} requests", requests.len());
        self.queue.extend(requests);
        self.more_requests.set();
    }

    /// Number of requests waiting for an association
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// True when requests are queued and no sending loop is running
    pub fn is_send_required(&self) -> bool {
        !self.is_sending.load(Ordering::Acquire) && !self.queue.is_empty()
    }

    pub fn is_sending(&self) -> bool {
        self.is_sending.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ClientPhase {
        *lock(&self.phase)
    }

    /// Receive client events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Client events as a stream; events missed by a slow consumer are skipped
    pub fn event_stream(&self) -> impl Stream<Item = ClientEvent> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(lagged) => {
                    warn!("Client event consumer fell behind: {}", lagged);
                    None
                }
            }
        })
    }

    /// Propose an asynchronous operations window for the next associations
    ///
    /// Zero means unlimited.
    pub fn negotiate_async_ops(&self, invoked: u16, performed: u16) {
        let mut settings = lock(&self.negotiation);
        settings.async_ops_invoked = invoked;
        settings.async_ops_performed = performed;
    }

    /// Propose an extra presentation context on every association
    ///
    /// `role` adds an SCP/SCU role selection item; C-GET needs the SCP role
    /// on the storage SOP classes it retrieves. Extra contexts are proposed
    /// ahead of those derived from queued requests, so at most
    /// [`MAX_PRESENTATION_CONTEXTS`] distinct ones can be registered.
    pub fn add_presentation_context(
        &self,
        abstract_syntax: impl Into<String>,
        role: Option<RoleSelection>,
        transfer_syntaxes: &[&str],
    ) -> Result<()> {
        let abstract_syntax = abstract_syntax.into();
        let mut settings = lock(&self.negotiation);
        let contexts = &mut settings.presentation_contexts;

        if let Some(existing) = contexts
            .iter_mut()
            .find(|context| context.abstract_syntax == abstract_syntax)
        {
            for ts in transfer_syntaxes {
                if !existing.transfer_syntaxes.iter().any(|t| t == ts) {
                    existing.transfer_syntaxes.push(ts.to_string());
                }
            }
            if role.is_some() {
                existing.role = role;
            }
            return Ok(());
        }

        if contexts.len() >= MAX_PRESENTATION_CONTEXTS {
            return Err(DimseError::config(format!(
                "cannot register {}: at most {} presentation contexts fit in an association",
                abstract_syntax, MAX_PRESENTATION_CONTEXTS
            )));
        }
        contexts.push(ExtraContext {
            abstract_syntax,
            role,
            transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
        });
        Ok(())
    }

    /// Propose an extended negotiation item on every association
    pub fn add_extended_negotiation(&self, negotiation: ExtendedNegotiation) {
        lock(&self.negotiation).extended_negotiations.push(negotiation);
    }

    /// Handle C-STORE requests the peer sends during C-GET
    pub fn set_store_handler(&self, handler: Arc<dyn StoreHandler>) {
        lock(&self.negotiation).store_handler = Some(handler);
    }

    /// Send every queued request, opening associations as needed
    ///
    /// Returns immediately if another call is already sending; requests
    /// added meanwhile are picked up by that call. Completes once the queue
    /// is empty, on cancellation, or on the first failure that stops the
    /// loop. Individual request failures are reported through their
    /// handles and never stop the loop.
    pub async fn send(&self, cancel: CancellationToken, mode: CancellationMode) -> Result<()> {
        if self
            .is_sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Already sending, requests will be picked up by the running loop");
            return Ok(());
        }
        let _guard = SendingGuard { client: self };

        let mut retry = Vec::new();
        let mut consecutive_timeouts = 0u32;
        let mut outcome = Ok(());

        while !cancel.is_cancelled() && !(self.queue.is_empty() && retry.is_empty()) {
            if let Err(e) = self
                .run_association(&mut retry, &mut consecutive_timeouts, &cancel, mode)
                .await
            {
                outcome = Err(e);
                break;
            }
        }

        if !retry.is_empty() {
            debug!("Returning {} unsent requests to the queue", retry.len());
            self.queue.push_front_all(retry);
        }

        outcome
    }

    fn prepare(&self, request: &mut DimseRequest) {
        request.assign_message_id(self.next_message_id());
        request.apply_default_timeout(self.options.request_timeout());
    }

    fn next_message_id(&self) -> u16 {
        // Zero is not a valid message ID
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn set_phase(&self, to: ClientPhase) {
        let from = std::mem::replace(&mut *lock(&self.phase), to);
        if from != to {
            debug!("[{:?}] --> [{:?}]", from, to);
            self.emit(ClientEvent::PhaseChanged { from, to });
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// One connection: negotiate, send, tear down
    async fn run_association(
        &self,
        retry: &mut Vec<DimseRequest>,
        consecutive_timeouts: &mut u32,
        cancel: &CancellationToken,
        mode: CancellationMode,
    ) -> Result<()> {
        self.set_phase(ClientPhase::Connecting);
        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            connection = self.connector.connect(&self.node, cancel.child_token()) => {
                match connection {
                    Ok(connection) => connection,
                    Err(_) if cancel.is_cancelled() => return Ok(()),
                    Err(e) => {
                        error!(
                            "Failed to connect to {}@{}:{}: {}",
                            self.node.ae_title, self.node.host, self.node.port, e
                        );
                        return Err(e);
                    }
                }
            }
        };

        self.set_phase(ClientPhase::RequestingAssociation);
        let mut batch = Batch::new(self.options.request_limit());
        batch.take_retries(retry);
        self.more_requests.reset();
        batch.fill_from(&self.queue);
        if batch.is_empty() {
            return Ok(());
        }

        let proposal = self.association_request(&mut batch);
        let timeout = self.options.association_request_timeout();
        let negotiation_cancel = cancel.child_token();
        debug!(
            "Requesting association with {} for {} requests",
            self.node.ae_title,
            batch.len()
        );

        let negotiated = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                retry.extend(batch.drain());
                return Ok(());
            }
            negotiated = tokio::time::timeout(
                timeout,
                self.negotiator.negotiate(connection, proposal, negotiation_cancel.clone()),
            ) => negotiated,
        };

        let association = match negotiated {
            Ok(Ok(association)) => {
                *consecutive_timeouts = 0;
                ClientAssociation::new(association)
            }
            Ok(Err(DimseError::AssociationRejected(rejection))) => {
                *consecutive_timeouts = 0;
                warn!("Association rejected by {}: {}", self.node.ae_title, rejection);
                self.emit(ClientEvent::AssociationRejected(rejection));
                for mut request in batch.drain() {
                    request.complete(Err(DimseError::AssociationRejected(rejection)));
                }
                return Err(DimseError::AssociationRejected(rejection));
            }
            Ok(Err(_)) if cancel.is_cancelled() => {
                retry.extend(batch.drain());
                return Ok(());
            }
            Ok(Err(e)) => {
                error!("Association request to {} failed: {}", self.node.ae_title, e);
                retry.extend(batch.drain());
                return Err(e);
            }
            Err(_) => {
                negotiation_cancel.cancel();
                *consecutive_timeouts += 1;
                let max_attempts = self.options.max_consecutive_timed_out_association_requests;
                warn!(
                    "Association request to {} timed out after {:?} (attempt {}/{})",
                    self.node.ae_title, timeout, consecutive_timeouts, max_attempts
                );
                self.emit(ClientEvent::AssociationRequestTimedOut {
                    timeout,
                    attempt: *consecutive_timeouts,
                    max_attempts,
                });
                retry.extend(batch.drain());
                if *consecutive_timeouts >= max_attempts {
                    return Err(DimseError::AssociationRequestTimedOut {
                        timeout,
                        attempts: *consecutive_timeouts,
                    });
                }
                return Ok(());
            }
        };

        info!(
            "Association accepted by {} (max async ops invoked: {})",
            self.node.ae_title,
            association.info().max_async_ops_invoked
        );
        self.emit(ClientEvent::AssociationAccepted(association.info().clone()));

        if let Err(e) = self.check_user_identity(association.info()) {
            error!("{}", e);
            retry.extend(batch.drain());
            self.abort_association(&association).await;
            return Err(e);
        }

        let submitted = self.send_requests(&association, &mut batch, cancel).await;
        let stranded = batch.len();
        retry.extend(batch.drain());

        if cancel.is_cancelled() {
            warn!("Sending to {} was cancelled ({:?})", self.node.ae_title, mode);
            match mode {
                CancellationMode::ReleaseAssociation => {
                    self.release_association(&association).await
                }
                CancellationMode::AbortAssociation => {
                    self.abort_association(&association).await
                }
            }
            return Ok(());
        }

        if stranded > 0 {
            warn!(
                "Association with {} stopped accepting requests, {} will be retried",
                self.node.ae_title, stranded
            );
            self.abort_association(&association).await;
            if submitted == 0 {
                return Err(DimseError::operation_failed(format!(
                    "association with {} did not accept any request",
                    self.node.ae_title
                )));
            }
            return Ok(());
        }

        self.release_association(&association).await;
        Ok(())
    }

    /// Build the A-ASSOCIATE-RQ for a batch
    ///
    /// Requests whose SOP class no longer fits in the proposal go back to the
    /// front of the queue for the next association, and the batch takes no
    /// further requests.
    fn association_request(&self, batch: &mut Batch) -> AssociationRequest {
        let settings = lock(&self.negotiation);
        let mut proposal =
            AssociationRequest::new(&self.options.calling_aet, &self.node.ae_title);
        proposal.max_pdu = self.node.max_pdu(&self.options);
        proposal.max_async_ops_invoked = settings.async_ops_invoked;
        proposal.max_async_ops_performed = settings.async_ops_performed;
        proposal.user_identity = self.options.user_identity.clone();
        proposal.store_handler = settings.store_handler.clone();

        for context in &settings.presentation_contexts {
            if let Err(e) = proposal.add_presentation_context_with_role(
                &context.abstract_syntax,
                context.role,
                context.transfer_syntaxes.as_slice(),
            ) {
                warn!("{}", e);
            }
        }

        let deferred = batch.split_off(|request| {
            let Some(abstract_syntax) = request.abstract_syntax() else {
                return true;
            };
            let mut transfer_syntaxes: Vec<&str> = Vec::new();
            if let DimseRequestPayload::Store(dataset) = request.payload() {
                if let Some(ts) = dataset.metadata().transfer_syntax.as_deref() {
                    transfer_syntaxes.push(ts);
                }
            }
            transfer_syntaxes.extend(DEFAULT_TRANSFER_SYNTAXES);
            if proposal
                .add_presentation_context(&abstract_syntax, transfer_syntaxes.as_slice())
                .is_err()
            {
                return false;
            }
            if let Some(info) = request.application_info() {
                proposal.add_extended_negotiation(ExtendedNegotiation::new(
                    abstract_syntax,
                    info.to_vec(),
                ));
            }
            true
        });

        for negotiation in &settings.extended_negotiations {
            proposal.add_extended_negotiation(negotiation.clone());
        }

        if proposal.store_handler.is_none()
            && batch.iter().any(|request| request.command() == DimseCommand::Get)
        {
            warn!("C-GET queued without a store handler, retrieved instances will be refused");
        }

        if !deferred.is_empty() {
            debug!(
                "Presentation contexts exhausted, deferring {} requests to the next association",
                deferred.len()
            );
            self.queue.push_front_all(deferred);
        }

        proposal
    }

    fn check_user_identity(&self, info: &AssociationInfo) -> Result<()> {
        let Some(identity) = &self.options.user_identity else {
            return Ok(());
        };
        if info.user_identity_response.is_some() {
            return Ok(());
        }
        match identity.response {
            IdentityResponsePolicy::NotRequested => Ok(()),
            IdentityResponsePolicy::Optional => {
                warn!(
                    "{} did not answer the user identity negotiation",
                    self.node.ae_title
                );
                Ok(())
            }
            IdentityResponsePolicy::Required => Err(DimseError::MissingUserIdentityResponse),
        }
    }

    /// Send the batch, then anything queued while the association is open.
    /// Returns how many requests were submitted.
    async fn send_requests(
        &self,
        association: &ClientAssociation,
        batch: &mut Batch,
        cancel: &CancellationToken,
    ) -> usize {
        let linger = self.options.association_linger_timeout();
        let mut submitted = 0;

        loop {
            self.set_phase(ClientPhase::Sending);
            submitted += self.dispatch(association, batch, cancel).await;

            // Leftovers mean the association stopped taking requests
            if cancel.is_cancelled() || !batch.is_empty() {
                return submitted;
            }

            self.more_requests.reset();
            batch.fill_from(&self.queue);

            if batch.is_empty()
                && batch.has_capacity()
                && !linger.is_zero()
                && association.can_send_requests()
            {
                self.set_phase(ClientPhase::Lingering);
                debug!(
                    "Lingering on association with {} for {:?}",
                    self.node.ae_title, linger
                );
                tokio::select! {
                    _ = self.more_requests.wait() => {}
                    _ = tokio::time::sleep(linger) => {}
                    _ = cancel.cancelled() => return submitted,
                }
                self.more_requests.reset();
                batch.fill_from(&self.queue);
            }

            if batch.is_empty() {
                return submitted;
            }
        }
    }

    /// Send requests from the batch with at most the negotiated number outstanding
    async fn dispatch(
        &self,
        association: &ClientAssociation,
        batch: &mut Batch,
        cancel: &CancellationToken,
    ) -> usize {
        let limit = association.info().concurrency_limit();
        let mut in_flight = FuturesUnordered::new();
        let mut submitted = 0;

        loop {
            while in_flight.len() < limit
                && !cancel.is_cancelled()
                && association.can_send_requests()
            {
                let Some(request) = batch.pop() else {
                    break;
                };
                let (sent_tx, sent_rx) = oneshot::channel();
                in_flight.push(self.exchange(association, request, sent_tx, cancel.clone()));
                submitted += 1;

                // Admit the next request once this one is on the wire
                tokio::select! {
                    _ = sent_rx => {}
                    Some(()) = in_flight.next() => {}
                }
            }

            if in_flight.is_empty() {
                return submitted;
            }
            in_flight.next().await;

            if !cancel.is_cancelled() && association.can_send_requests() {
                let added = batch.fill_from(&self.queue);
                if added > 0 {
                    debug!("Picked up {} more requests on the open association", added);
                }
            }
        }
    }

    /// Send one request and deliver its responses
    async fn exchange(
        &self,
        association: &ClientAssociation,
        mut request: DimseRequest,
        sent: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) {
        debug!("Sending {}", request);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DimseError::Cancelled),
            outcome = await_responses(association, &request, sent, &cancel) => outcome,
        };

        match outcome {
            Ok(response) => {
                debug!("{} completed with status {:?}", request, response.status);
                request.complete(Ok(response));
            }
            Err(DimseError::RequestTimedOut {
                message_id,
                timeout,
            }) => {
                warn!("{} got no response within {:?}", request, timeout);
                self.emit(ClientEvent::RequestTimedOut {
                    request_id: request.id(),
                    message_id,
                    timeout,
                });
                request.complete(Err(DimseError::RequestTimedOut {
                    message_id,
                    timeout,
                }));
            }
            Err(DimseError::Cancelled) => {
                debug!("{} cancelled", request);
                request.complete(Err(DimseError::Cancelled));
            }
            Err(e) => {
                warn!("{} failed: {}", request, e);
                request.complete(Err(e));
            }
        }
    }

    async fn release_association(&self, association: &ClientAssociation) {
        self.set_phase(ClientPhase::Releasing);
        let timeout = self.options.association_release_timeout();
        let release_cancel = CancellationToken::new();
        match tokio::time::timeout(timeout, association.release(release_cancel.clone())).await {
            Ok(Ok(())) => info!("Association with {} released", self.node.ae_title),
            Ok(Err(e)) => {
                warn!("Releasing association with {} failed: {}", self.node.ae_title, e)
            }
            Err(_) => {
                release_cancel.cancel();
                debug!(
                    "No release response from {} within {:?}, closing connection",
                    self.node.ae_title, timeout
                );
            }
        }
        association.dispose();
        self.emit(ClientEvent::AssociationReleased);
    }

    async fn abort_association(&self, association: &ClientAssociation) {
        self.set_phase(ClientPhase::Aborting);
        let timeout = self.options.association_abort_timeout();
        let abort_cancel = CancellationToken::new();
        match tokio::time::timeout(timeout, association.abort(abort_cancel.clone())).await {
            Ok(Ok(())) => info!("Association with {} aborted", self.node.ae_title),
            Ok(Err(e)) => {
                warn!("Aborting association with {} failed: {}", self.node.ae_title, e)
            }
            Err(_) => {
                abort_cancel.cancel();
                debug!(
                    "Abort of association with {} timed out after {:?}",
                    self.node.ae_title, timeout
                );
            }
        }
        association.dispose();
        self.emit(ClientEvent::AssociationReleased);
    }
}

/// Submit a request and wait for its final response
///
/// The request timeout counts from the end of transmission and starts over
/// with every pending response.
async fn await_responses(
    association: &ClientAssociation,
    request: &DimseRequest,
    sent: oneshot::Sender<()>,
    cancel: &CancellationToken,
) -> Result<DimseResponse> {
    let (responses_tx, mut responses) = mpsc::unbounded_channel();
    association.send_request(request, responses_tx, cancel).await?;
    // The dispatcher may have moved on already
    let _ = sent.send(());

    loop {
        let next = match request.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, responses.recv())
                .await
                .map_err(|_| DimseError::RequestTimedOut {
                    message_id: request.message_id(),
                    timeout,
                })?,
            None => responses.recv().await,
        };
        match next {
            Some(Ok(response)) if response.is_final() => return Ok(response),
            Some(Ok(response)) => request.deliver_pending(response),
            Some(Err(e)) => return Err(e),
            None => return Err(DimseError::ConnectionClosed),
        }
    }
}

/// Builder for [`DicomClient`]
pub struct DicomClientBuilder {
    node: RemoteNode,
    options: ClientOptions,
    connector: Option<Arc<dyn Connector>>,
    negotiator: Option<Arc<dyn Negotiator>>,
    store_handler: Option<Arc<dyn StoreHandler>>,
}

impl DicomClientBuilder {
    pub fn new(node: RemoteNode) -> Self {
        Self {
            node,
            options: ClientOptions::default(),
            connector: None,
            negotiator: None,
            store_handler: None,
        }
    }

    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn calling_aet(mut self, aet: impl Into<String>) -> Self {
        self.options.calling_aet = aet.into();
        self
    }

    pub fn linger_timeout(mut self, timeout: Duration) -> Self {
        self.options.association_linger_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_requests_per_association(mut self, max: usize) -> Self {
        self.options.max_requests_per_association = Some(max);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    pub fn store_handler(mut self, handler: Arc<dyn StoreHandler>) -> Self {
        self.store_handler = Some(handler);
        self
    }

    /// Validate the configuration and build the client
    ///
    /// Without an explicit connector, plain TCP is used.
    pub fn build(self) -> Result<DicomClient> {
        self.options.validate()?;
        self.node.validate()?;

        let negotiator = self
            .negotiator
            .ok_or_else(|| DimseError::config("A negotiator is required"))?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(&self.options)));

        let client = DicomClient::new(self.node, self.options, connector, negotiator);
        if let Some(handler) = self.store_handler {
            client.set_store_handler(handler);
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{Association, Connection, ResponseSender};
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(
            &self,
            _node: &RemoteNode,
            _cancel: CancellationToken,
        ) -> Result<Connection> {
            Err(DimseError::Network(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        }
    }

    struct UnusedNegotiator;

    #[async_trait]
    impl Negotiator for UnusedNegotiator {
        async fn negotiate(
            &self,
            _connection: Connection,
            _request: AssociationRequest,
            _cancel: CancellationToken,
        ) -> Result<Box<dyn Association>> {
            Err(DimseError::internal("not expected"))
        }
    }

    struct NullAssociation(AssociationInfo);

    #[async_trait]
    impl Association for NullAssociation {
        fn info(&self) -> &AssociationInfo {
            &self.0
        }
        fn can_send_requests(&self) -> bool {
            true
        }
        async fn send_request(
            &self,
            _request: &DimseRequest,
            _responses: ResponseSender,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
        async fn release(&self, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn abort(&self, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }
        fn dispose(&self) {}
    }

    fn client() -> DicomClient {
        DicomClient::new(
            RemoteNode::new("REMOTE", "127.0.0.1", 104),
            ClientOptions::default(),
            Arc::new(RefusingConnector),
            Arc::new(UnusedNegotiator),
        )
    }

    #[test]
    fn test_message_ids_are_sequential_and_skip_zero() {
        let client = client();
        client.next_message_id.store(u16::MAX, Ordering::Relaxed);

        let (first, _h1) = DimseRequest::echo();
        let (second, _h2) = DimseRequest::echo();
        client.add_requests([first, second]);

        let ids: Vec<u16> = std::iter::from_fn(|| client.queue.pop())
            .map(|r| r.message_id())
            .collect();
        assert_eq!(ids, vec![u16::MAX, 1]);
    }

    #[test]
    fn test_default_request_timeout_applied_on_enqueue() {
        let mut options = ClientOptions::default();
        options.request_timeout_ms = Some(250);
        let client = DicomClient::new(
            RemoteNode::new("REMOTE", "127.0.0.1", 104),
            options,
            Arc::new(RefusingConnector),
            Arc::new(UnusedNegotiator),
        );

        let (request, _handle) = DimseRequest::echo();
        client.add_request(request);
        let (explicit, _handle) = DimseRequest::echo();
        client.add_request(explicit.with_timeout(Duration::from_secs(2)));

        let timeouts: Vec<_> = std::iter::from_fn(|| client.queue.pop())
            .map(|r| r.timeout())
            .collect();
        assert_eq!(
            timeouts,
            vec![Some(Duration::from_millis(250)), Some(Duration::from_secs(2))]
        );
    }

    #[test]
    fn test_proposal_covers_batch_and_extra_contexts() {
        let client = client();
        client.negotiate_async_ops(4, 2);
        client
            .add_presentation_context(uids::VERIFICATION, None, &[uids::IMPLICIT_VR_LITTLE_ENDIAN])
            .unwrap();
        client
            .add_presentation_context("1.2.3.4", None, &[uids::EXPLICIT_VR_LITTLE_ENDIAN])
            .unwrap();

        let (echo, _handle) = DimseRequest::echo();
        client.add_request(echo);
        let mut batch = Batch::new(usize::MAX);
        batch.fill_from(&client.queue);

        let proposal = client.association_request(&mut batch);
        assert_eq!(proposal.max_async_ops_invoked, 4);
        assert_eq!(proposal.max_async_ops_performed, 2);
        assert_eq!(proposal.calling_ae, client.options.calling_aet);
        assert_eq!(proposal.called_ae, "REMOTE");
        assert!(proposal.proposes(uids::VERIFICATION));
        assert!(proposal.proposes("1.2.3.4"));
        // Verification was proposed once, with both transfer syntaxes
        assert_eq!(proposal.presentation_contexts.len(), 2);
    }

    #[test]
    fn test_extended_negotiation_and_roles_are_proposed() {
        use crate::types::{DatasetStream, FindQuery};

        let client = client();
        client
            .add_presentation_context(
                uids::CT_IMAGE_STORAGE,
                Some(RoleSelection::scp()),
                &[uids::EXPLICIT_VR_LITTLE_ENDIAN],
            )
            .unwrap();
        client.add_extended_negotiation(ExtendedNegotiation::new(uids::CT_IMAGE_STORAGE, vec![1]));

        let (find, _find_handle) = DimseRequest::find(FindQuery::patient(None));
        let (store, _store_handle) = DimseRequest::store(DatasetStream::from_bytes(
            bytes::Bytes::from_static(b"mr"),
            uids::MR_IMAGE_STORAGE,
        ));
        client.add_requests([find.with_application_info(vec![1, 1]), store]);
        let mut batch = Batch::new(usize::MAX);
        batch.fill_from(&client.queue);

        let proposal = client.association_request(&mut batch);
        assert_eq!(batch.len(), 2);
        assert_eq!(proposal.presentation_contexts[0].abstract_syntax, uids::CT_IMAGE_STORAGE);
        assert_eq!(proposal.presentation_contexts[0].role, Some(RoleSelection::scp()));
        assert!(proposal.proposes(uids::MR_IMAGE_STORAGE));

        let find_sop = uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
        assert_eq!(
            proposal.extended_negotiation(find_sop).and_then(|en| en.application_info.clone()),
            Some(vec![1, 1])
        );
        assert!(proposal.extended_negotiation(uids::CT_IMAGE_STORAGE).is_some());
        assert!(proposal.extended_negotiation(uids::MR_IMAGE_STORAGE).is_none());
    }

    #[test]
    fn test_extra_contexts_are_capped() {
        let client = client();
        for n in 0..MAX_PRESENTATION_CONTEXTS {
            let abstract_syntax = format!("1.2.3.{}", n);
            client
                .add_presentation_context(abstract_syntax, None, &[uids::IMPLICIT_VR_LITTLE_ENDIAN])
                .unwrap();
        }
        // Merging into a registered context is always possible
        client
            .add_presentation_context("1.2.3.0", Some(RoleSelection::both()), &[])
            .unwrap();
        assert!(matches!(
            client.add_presentation_context("1.2.3.999", None, &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
            Err(DimseError::Config(_))
        ));

        // A request needing a context of its own waits for the next association
        let (echo, _handle) = DimseRequest::echo();
        client.add_request(echo);
        let mut batch = Batch::new(usize::MAX);
        batch.fill_from(&client.queue);

        let proposal = client.association_request(&mut batch);
        assert_eq!(proposal.presentation_contexts.len(), MAX_PRESENTATION_CONTEXTS);
        assert_eq!(proposal.presentation_contexts[0].role, Some(RoleSelection::both()));
        assert!(batch.is_empty());
        assert_eq!(client.queued(), 1);
    }

    #[test]
    fn test_identity_policy() {
        use crate::config::{UserIdentityOptions, UserIdentityType};

        let mut options = ClientOptions::default();
        options.user_identity = Some(UserIdentityOptions {
            kind: UserIdentityType::Username,
            primary_field: "alice".into(),
            secondary_field: None,
            response: IdentityResponsePolicy::Required,
        });
        let mut client = client();
        client.options = options;

        let mut info = AssociationInfo::default();
        assert!(matches!(
            client.check_user_identity(&info),
            Err(DimseError::MissingUserIdentityResponse)
        ));

        info.user_identity_response = Some(b"token".to_vec());
        assert!(client.check_user_identity(&info).is_ok());

        if let Some(identity) = client.options.user_identity.as_mut() {
            identity.response = IdentityResponsePolicy::Optional;
        }
        assert!(client.check_user_identity(&AssociationInfo::default()).is_ok());
    }

    #[tokio::test]
    async fn test_send_with_empty_queue_returns_immediately() {
        let client = client();
        client.send(CancellationToken::new(), CancellationMode::default()).await.unwrap();
        assert_eq!(client.phase(), ClientPhase::Idle);
        assert!(!client.is_sending());
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_requests_queued() {
        let client = client();
        let (request, _handle) = DimseRequest::echo();
        client.add_request(request);
        assert!(client.is_send_required());

        let result = client.send(CancellationToken::new(), CancellationMode::default()).await;
        assert!(matches!(result, Err(DimseError::Network(_))));
        assert_eq!(client.queued(), 1);
        assert!(client.is_send_required());
        assert_eq!(client.phase(), ClientPhase::Idle);
    }

    #[tokio::test]
    async fn test_release_emits_released_event() {
        let client = client();
        let mut events = client.subscribe();
        let association =
            ClientAssociation::new(Box::new(NullAssociation(AssociationInfo::default())));

        client.release_association(&association).await;

        assert!(association.is_disposed());
        let mut saw_release = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::AssociationReleased) {
                saw_release = true;
            }
        }
        assert!(saw_release);
    }

    #[test]
    fn test_builder_requires_negotiator() {
        let result = DicomClient::builder(RemoteNode::new("REMOTE", "127.0.0.1", 104)).build();
        assert!(matches!(result, Err(DimseError::Config(_))));

        let client = DicomClient::builder(RemoteNode::new("REMOTE", "127.0.0.1", 104))
            .calling_aet("LOCAL")
            .max_requests_per_association(3)
            .negotiator(Arc::new(UnusedNegotiator))
            .build()
            .unwrap();
        assert_eq!(client.options().calling_aet, "LOCAL");
        assert_eq!(client.options().request_limit(), 3);
    }

    #[test]
    fn test_builder_linger_saturates() {
        let builder = DicomClient::builder(RemoteNode::new("REMOTE", "127.0.0.1", 104))
            .linger_timeout(Duration::MAX);
        assert_eq!(builder.options.association_linger_timeout_ms, u64::MAX);

        let builder = builder.linger_timeout(Duration::from_millis(1500));
        assert_eq!(builder.options.association_linger_timeout_ms, 1500);
    }
}
