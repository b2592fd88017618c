#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dicom_dictionary_std::uids;
use dimse::association::{AssociationInfo, RejectResult, RejectSource};
use dimse::{
    Association, AssociationRejection, AssociationRequest, ClientOptions, Connection, Connector,
    DatasetStream, DicomClient, DimseCommand, DimseError, DimseRequest, DimseResponse,
    DimseStatus, IncomingStore, Negotiator, RemoteNode, ResponseSender, Result, StoreHandler,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How the mock peer answers one association request
#[derive(Debug, Clone, Copy)]
pub enum Negotiation {
    /// Accept, capping the async ops window (0 accepts whatever was proposed)
    Accept { max_ops: u16 },
    Reject,
    /// Never answer
    Hang,
}

/// How the mock peer answers requests on accepted associations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// Final success after the configured delay
    Respond,
    /// Keep the request outstanding forever
    Hang,
    /// Close the response channel without a final response
    Drop,
}

/// Shared record of everything the mock peer saw
#[derive(Debug)]
pub struct Peer {
    pub connects: AtomicUsize,
    pub negotiations: AtomicUsize,
    pub proposals: Mutex<Vec<AssociationRequest>>,
    pub sent: Mutex<Vec<u16>>,
    pub sent_per_association: Mutex<Vec<usize>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub released: AtomicUsize,
    pub aborted: AtomicUsize,
    pub disposed: AtomicUsize,
    /// When each request started and finished transmitting
    pub transmissions: Mutex<Vec<(Instant, Instant)>>,
    /// Status the client returned for each C-STORE sub-operation
    pub store_statuses: Mutex<Vec<DimseStatus>>,
    script: Mutex<VecDeque<Negotiation>>,
    fallback: Mutex<Negotiation>,
    answer: Mutex<Answer>,
    response_delay: Mutex<Duration>,
    pending_interval: Mutex<Duration>,
    transmit_time: Mutex<Duration>,
    pending_per_request: AtomicUsize,
    instances_per_get: AtomicUsize,
    sends_per_association: Mutex<Option<usize>>,
    held: Mutex<Vec<ResponseSender>>,
}

impl Peer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            negotiations: AtomicUsize::new(0),
            proposals: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            sent_per_association: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            disposed: AtomicUsize::new(0),
            transmissions: Mutex::new(Vec::new()),
            store_statuses: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Negotiation::Accept { max_ops: 0 }),
            answer: Mutex::new(Answer::Respond),
            response_delay: Mutex::new(Duration::from_millis(10)),
            pending_interval: Mutex::new(Duration::ZERO),
            transmit_time: Mutex::new(Duration::ZERO),
            pending_per_request: AtomicUsize::new(0),
            instances_per_get: AtomicUsize::new(0),
            sends_per_association: Mutex::new(None),
            held: Mutex::new(Vec::new()),
        })
    }

    /// Answers for the next association requests, in order
    pub fn script(&self, steps: impl IntoIterator<Item = Negotiation>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Answer once the script has run out
    pub fn otherwise(&self, step: Negotiation) {
        *self.fallback.lock().unwrap() = step;
    }

    pub fn answer(&self, answer: Answer) {
        *self.answer.lock().unwrap() = answer;
    }

    pub fn response_delay(&self, delay: Duration) {
        *self.response_delay.lock().unwrap() = delay;
    }

    pub fn pending_per_request(&self, count: usize) {
        self.pending_per_request.store(count, Ordering::SeqCst);
    }

    /// Pause between consecutive responses to one request
    pub fn pending_interval(&self, interval: Duration) {
        *self.pending_interval.lock().unwrap() = interval;
    }

    /// Time `send_request` takes to put a request on the wire
    pub fn transmit_time(&self, time: Duration) {
        *self.transmit_time.lock().unwrap() = time;
    }

    /// Instances the peer sends back as C-STORE sub-operations of a C-GET
    pub fn instances_per_get(&self, count: usize) {
        self.instances_per_get.store(count, Ordering::SeqCst);
    }

    pub fn transmissions(&self) -> Vec<(Instant, Instant)> {
        self.transmissions.lock().unwrap().clone()
    }

    pub fn store_statuses(&self) -> Vec<DimseStatus> {
        self.store_statuses.lock().unwrap().clone()
    }

    /// Each association stops accepting requests after `count` sends
    pub fn sends_per_association(&self, count: usize) {
        *self.sends_per_association.lock().unwrap() = Some(count);
    }

    pub fn sent(&self) -> Vec<u16> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_per_association(&self) -> Vec<usize> {
        self.sent_per_association.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_negotiation(&self) -> Negotiation {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.fallback.lock().unwrap())
    }
}

pub struct MockConnector {
    peer: Arc<Peer>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _node: &RemoteNode, _cancel: CancellationToken) -> Result<Connection> {
        self.peer.connects.fetch_add(1, Ordering::SeqCst);
        let (client, _server) = tokio::io::duplex(1024);
        Ok(Box::new(client))
    }
}

pub struct MockNegotiator {
    peer: Arc<Peer>,
}

#[async_trait]
impl Negotiator for MockNegotiator {
    async fn negotiate(
        &self,
        _connection: Connection,
        request: AssociationRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Association>> {
        self.peer.negotiations.fetch_add(1, Ordering::SeqCst);
        let step = self.peer.next_negotiation();
        let proposed_ops = request.max_async_ops_invoked;
        let store_handler = request.store_handler.clone();
        let accepted = request
            .presentation_contexts
            .iter()
            .map(|pc| pc.abstract_syntax.clone())
            .collect();
        self.peer.proposals.lock().unwrap().push(request);

        match step {
            Negotiation::Accept { max_ops } => {
                let index = {
                    let mut per_association = self.peer.sent_per_association.lock().unwrap();
                    per_association.push(0);
                    per_association.len() - 1
                };
                let max_async_ops_invoked = match (max_ops, proposed_ops) {
                    (0, proposed) => proposed,
                    (cap, 0) => cap,
                    (cap, proposed) => cap.min(proposed),
                };
                Ok(Box::new(MockAssociation {
                    peer: self.peer.clone(),
                    index,
                    sends: AtomicUsize::new(0),
                    store_handler,
                    info: AssociationInfo {
                        called_ae: "MOCK".into(),
                        max_pdu: 16384,
                        max_async_ops_invoked,
                        accepted_abstract_syntaxes: accepted,
                        user_identity_response: None,
                    },
                }))
            }
            Negotiation::Reject => Err(DimseError::AssociationRejected(AssociationRejection::new(
                RejectResult::Permanent,
                RejectSource::ServiceUser,
                7,
            ))),
            Negotiation::Hang => {
                cancel.cancelled().await;
                Err(DimseError::Cancelled)
            }
        }
    }
}

pub struct MockAssociation {
    peer: Arc<Peer>,
    index: usize,
    sends: AtomicUsize,
    store_handler: Option<Arc<dyn StoreHandler>>,
    info: AssociationInfo,
}

#[async_trait]
impl Association for MockAssociation {
    fn info(&self) -> &AssociationInfo {
        &self.info
    }

    fn can_send_requests(&self) -> bool {
        match *self.peer.sends_per_association.lock().unwrap() {
            Some(limit) => self.sends.load(Ordering::SeqCst) < limit,
            None => true,
        }
    }

    async fn send_request(
        &self,
        request: &DimseRequest,
        responses: ResponseSender,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let transmit_time = *self.peer.transmit_time.lock().unwrap();
        if !transmit_time.is_zero() {
            tokio::time::sleep(transmit_time).await;
        }
        self.peer
            .transmissions
            .lock()
            .unwrap()
            .push((started, Instant::now()));

        self.sends.fetch_add(1, Ordering::SeqCst);
        self.peer.sent.lock().unwrap().push(request.message_id());
        self.peer.sent_per_association.lock().unwrap()[self.index] += 1;
        let now = self.peer.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peer.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let answer = *self.peer.answer.lock().unwrap();
        if answer == Answer::Hang {
            self.peer.held.lock().unwrap().push(responses);
            return Ok(());
        }

        let delay = *self.peer.response_delay.lock().unwrap();
        let interval = *self.peer.pending_interval.lock().unwrap();
        let pending: Vec<DimseResponse> = (0..self.peer.pending_per_request.load(Ordering::SeqCst))
            .map(|_| {
                let dataset = DatasetStream::from_bytes(
                    Bytes::from_static(b"match"),
                    uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
                );
                DimseResponse::pending(request, dataset)
            })
            .collect();
        let instances = match request.command() {
            DimseCommand::Get => self.peer.instances_per_get.load(Ordering::SeqCst),
            _ => 0,
        };
        let mut last = DimseResponse::success(request);
        let get = DimseResponse::new(request.message_id(), request.command(), DimseStatus::Pending);
        let handler = self.store_handler.clone();
        let peer = self.peer.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for response in pending {
                let _ = responses.send(Ok(response));
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }

            let (mut completed, mut failed) = (0u16, 0u16);
            for n in 0..instances {
                let status = match &handler {
                    Some(handler) => {
                        let incoming = IncomingStore {
                            message_id: 1000 + n as u16,
                            sop_class_uid: uids::CT_IMAGE_STORAGE.to_string(),
                            sop_instance_uid: format!("1.2.826.0.1.{}", n),
                            dataset: DatasetStream::from_bytes(
                                Bytes::from_static(b"ct"),
                                uids::CT_IMAGE_STORAGE,
                            ),
                        };
                        handler.on_store(incoming).await
                    }
                    // No handler: refuse as out of resources
                    None => DimseStatus::Failure(0xA702),
                };
                match status {
                    DimseStatus::Success | DimseStatus::Warning(_) => completed += 1,
                    _ => failed += 1,
                }
                peer.store_statuses.lock().unwrap().push(status);
                let remaining = (instances - n - 1) as u16;
                let progress = get.clone().with_sub_operations(remaining, completed, failed, 0);
                let _ = responses.send(Ok(progress));
            }
            if instances > 0 {
                last = last.with_sub_operations(0, completed, failed, 0);
            }

            peer.in_flight.fetch_sub(1, Ordering::SeqCst);
            if answer == Answer::Respond {
                let _ = responses.send(Ok(last));
            }
        });
        Ok(())
    }

    async fn release(&self, _cancel: CancellationToken) -> Result<()> {
        self.peer.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self, _cancel: CancellationToken) -> Result<()> {
        self.peer.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dispose(&self) {
        self.peer.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Options with short timers suitable for paused-clock tests
pub fn options() -> ClientOptions {
    let mut options = ClientOptions::default();
    options.calling_aet = "TEST_SCU".into();
    options.association_request_timeout_ms = 1000;
    options.association_release_timeout_ms = 1000;
    options.association_abort_timeout_ms = 100;
    options.association_linger_timeout_ms = 0;
    options
}

pub fn client(peer: &Arc<Peer>, options: ClientOptions) -> Arc<DicomClient> {
    Arc::new(DicomClient::new(
        RemoteNode::new("MOCK", "127.0.0.1", 11112),
        options,
        Arc::new(MockConnector { peer: peer.clone() }),
        Arc::new(MockNegotiator { peer: peer.clone() }),
    ))
}

pub fn echo_requests(count: usize) -> (Vec<DimseRequest>, Vec<dimse::ResponseHandle>) {
    (0..count).map(|_| DimseRequest::echo()).unzip()
}

pub fn is_echo(response: &DimseResponse) -> bool {
    response.command == DimseCommand::Echo
}

/// Store handler that keeps the SOP instance UIDs it was given
#[derive(Default)]
pub struct CollectingStore {
    pub received: Mutex<Vec<String>>,
}

#[async_trait]
impl StoreHandler for CollectingStore {
    async fn on_store(&self, request: IncomingStore) -> DimseStatus {
        self.received.lock().unwrap().push(request.sop_instance_uid);
        DimseStatus::Success
    }
}
