//! Requests queued on the client and the handles callers await them with

use std::fmt;
use std::time::Duration;

use futures::stream::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::types::{DatasetStream, DimseCommand, DimseStatus, FindQuery, MoveQuery, QueryRoot};
use crate::{DimseError, Result};

/// A request waiting to be sent to the remote node
///
/// Created together with a [`ResponseHandle`]; the request is handed to the
/// client while the caller keeps the handle. The final outcome is delivered
/// to the handle exactly once.
#[derive(Debug)]
pub struct DimseRequest {
    id: Uuid,
    message_id: u16,
    command: DimseCommand,
    payload: DimseRequestPayload,
    timeout: Option<Duration>,
    application_info: Option<Vec<u8>>,
    completion: Option<oneshot::Sender<Result<DimseResponse>>>,
    pending: mpsc::UnboundedSender<DimseResponse>,
}

/// Payload types for DIMSE requests
#[derive(Debug, Clone)]
pub enum DimseRequestPayload {
    /// C-ECHO request (no additional data needed)
    Echo,

    /// C-FIND request with query parameters
    Find(FindQuery),

    /// C-MOVE request with query and destination
    Move(MoveQuery),

    /// C-GET request with query parameters
    Get(FindQuery),

    /// C-STORE request with dataset to store
    Store(DatasetStream),
}

/// A response received for a request
#[derive(Debug, Clone)]
pub struct DimseResponse {
    /// Message ID of the request this response answers
    pub message_id: u16,

    /// The command being answered
    pub command: DimseCommand,

    /// Status reported by the peer
    pub status: DimseStatus,

    /// The response payload
    pub payload: DimseResponsePayload,
}

/// Payload types for DIMSE responses
#[derive(Debug, Clone)]
pub enum DimseResponsePayload {
    /// Status only (C-ECHO, C-STORE)
    Empty,

    /// A matching or retrieved dataset (C-FIND, C-GET)
    Dataset(DatasetStream),

    /// Sub-operation counters (C-MOVE, C-GET)
    SubOperations {
        remaining: u16,
        completed: u16,
        failed: u16,
        warning: u16,
    },
}

/// Caller side of a queued request
#[derive(Debug)]
pub struct ResponseHandle {
    id: Uuid,
    completion: oneshot::Receiver<Result<DimseResponse>>,
    pending: mpsc::UnboundedReceiver<DimseResponse>,
}

impl DimseRequest {
    fn new(command: DimseCommand, payload: DimseRequestPayload) -> (Self, ResponseHandle) {
        let id = Uuid::new_v4();
        let (completion_tx, completion_rx) = oneshot::channel();
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        let request = Self {
            id,
            message_id: 0,
            command,
            payload,
            timeout: None,
            application_info: None,
            completion: Some(completion_tx),
            pending: pending_tx,
        };
        let handle = ResponseHandle {
            id,
            completion: completion_rx,
            pending: pending_rx,
        };
        (request, handle)
    }

    /// Create a new C-ECHO request
    pub fn echo() -> (Self, ResponseHandle) {
        Self::new(DimseCommand::Echo, DimseRequestPayload::Echo)
    }

    /// Create a new C-FIND request
    pub fn find(query: FindQuery) -> (Self, ResponseHandle) {
        Self::new(DimseCommand::Find, DimseRequestPayload::Find(query))
    }

    /// Create a new C-MOVE request
    pub fn move_request(query: MoveQuery) -> (Self, ResponseHandle) {
        Self::new(DimseCommand::Move, DimseRequestPayload::Move(query))
    }

    /// Create a new C-GET request
    pub fn get(query: FindQuery) -> (Self, ResponseHandle) {
        Self::new(DimseCommand::Get, DimseRequestPayload::Get(query))
    }

    /// Create a new C-STORE request
    pub fn store(dataset: DatasetStream) -> (Self, ResponseHandle) {
        Self::new(DimseCommand::Store, DimseRequestPayload::Store(dataset))
    }

    /// Fail the request if the peer stays silent for `timeout`
    ///
    /// Every pending response restarts the timer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Propose extended negotiation for this request's SOP class
    pub fn with_application_info(mut self, application_info: Vec<u8>) -> Self {
        self.application_info = Some(application_info);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Message ID assigned when the request was queued (0 before that)
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn command(&self) -> DimseCommand {
        self.command
    }

    pub fn payload(&self) -> &DimseRequestPayload {
        &self.payload
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn application_info(&self) -> Option<&[u8]> {
        self.application_info.as_deref()
    }

    /// SOP class that must be negotiated for this request
    pub fn abstract_syntax(&self) -> Option<String> {
        let root = match &self.payload {
            DimseRequestPayload::Find(query) | DimseRequestPayload::Get(query) => query.root,
            DimseRequestPayload::Move(query) => query.root,
            DimseRequestPayload::Store(dataset) => {
                return dataset.sop_class_uid().map(str::to_string)
            }
            DimseRequestPayload::Echo => QueryRoot::Study,
        };
        self.command.abstract_syntax(root).map(str::to_string)
    }

    /// Whether the final outcome has already been delivered
    pub fn is_completed(&self) -> bool {
        self.completion.is_none()
    }

    pub(crate) fn assign_message_id(&mut self, message_id: u16) {
        self.message_id = message_id;
    }

    pub(crate) fn apply_default_timeout(&mut self, timeout: Option<Duration>) {
        if self.timeout.is_none() {
            self.timeout = timeout;
        }
    }

    /// Forward a pending response to the caller
    pub(crate) fn deliver_pending(&self, response: DimseResponse) {
        // The caller may have stopped listening for intermediate responses
        let _ = self.pending.send(response);
    }

    /// Deliver the final outcome. Returns false if one was already delivered.
    pub(crate) fn complete(&mut self, outcome: Result<DimseResponse>) -> bool {
        match self.completion.take() {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("{} completed after its handle was dropped", self);
                }
                true
            }
            None => {
                debug!("{} already completed, ignoring outcome", self);
                false
            }
        }
    }
}

impl fmt::Display for DimseRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.command, self.message_id)
    }
}

impl DimseResponse {
    /// Create a status-only response
    pub fn new(message_id: u16, command: DimseCommand, status: DimseStatus) -> Self {
        Self {
            message_id,
            command,
            status,
            payload: DimseResponsePayload::Empty,
        }
    }

    /// Create a successful final response to `request`
    pub fn success(request: &DimseRequest) -> Self {
        Self::new(request.message_id(), request.command(), DimseStatus::Success)
    }

    /// Create a pending response to `request` carrying a dataset
    pub fn pending(request: &DimseRequest, dataset: DatasetStream) -> Self {
        Self::new(request.message_id(), request.command(), DimseStatus::Pending)
            .with_dataset(dataset)
    }

    /// Attach a dataset
    pub fn with_dataset(mut self, dataset: DatasetStream) -> Self {
        self.payload = DimseResponsePayload::Dataset(dataset);
        self
    }

    /// Attach sub-operation counters
    pub fn with_sub_operations(
        mut self,
        remaining: u16,
        completed: u16,
        failed: u16,
        warning: u16,
    ) -> Self {
        self.payload = DimseResponsePayload::SubOperations {
            remaining,
            completed,
            failed,
            warning,
        };
        self
    }

    /// Whether this is the last response for its request
    pub fn is_final(&self) -> bool {
        !self.status.is_pending()
    }
}

impl ResponseHandle {
    /// Identifier of the request this handle belongs to
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the final outcome of the request
    pub async fn response(self) -> Result<DimseResponse> {
        self.completion
            .await
            .unwrap_or(Err(DimseError::RequestAbandoned))
    }

    /// Wait for the next pending response; `None` once the request has finished
    pub async fn next_pending(&mut self) -> Option<DimseResponse> {
        self.pending.recv().await
    }

    /// Non-blocking check for the final outcome
    pub fn try_response(&mut self) -> Option<Result<DimseResponse>> {
        match self.completion.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DimseError::RequestAbandoned)),
        }
    }

    /// All responses in arrival order, the final outcome last
    pub fn into_stream(self) -> impl Stream<Item = Result<DimseResponse>> {
        let ResponseHandle {
            mut pending,
            completion,
            ..
        } = self;

        async_stream::stream! {
            while let Some(response) = pending.recv().await {
                yield Ok(response);
            }
            yield completion.await.unwrap_or(Err(DimseError::RequestAbandoned));
        }
    }
}
