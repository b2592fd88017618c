//! Pending request queue and the per-association batch drawn from it

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::request::DimseRequest;

/// Requests waiting for an association
///
/// Producers push from any task; the single sending loop pops. The lock is
/// only held for the push or pop itself.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    items: Mutex<VecDeque<DimseRequest>>,
}

impl RequestQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<DimseRequest>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, request: DimseRequest) {
        self.lock().push_back(request);
    }

    pub fn extend(&self, requests: impl IntoIterator<Item = DimseRequest>) {
        self.lock().extend(requests);
    }

    /// Put requests back in front of everything queued, keeping their order
    pub fn push_front_all(&self, requests: Vec<DimseRequest>) {
        let mut items = self.lock();
        for request in requests.into_iter().rev() {
            items.push_front(request);
        }
    }

    pub fn pop(&self) -> Option<DimseRequest> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Requests assigned to one association attempt
#[derive(Debug)]
pub(crate) struct Batch {
    requests: VecDeque<DimseRequest>,
    taken: usize,
    limit: usize,
}

impl Batch {
    /// `limit` caps how many requests the association may carry in total
    pub fn new(limit: usize) -> Self {
        Self {
            requests: VecDeque::new(),
            taken: 0,
            limit,
        }
    }

    /// Take over requests left from a previous attempt; they go first
    pub fn take_retries(&mut self, retry: &mut Vec<DimseRequest>) {
        self.taken += retry.len();
        self.requests.extend(retry.drain(..));
    }

    /// Pull queued requests until the association limit is reached
    pub fn fill_from(&mut self, queue: &RequestQueue) -> usize {
        let mut added = 0;
        while self.has_capacity() {
            match queue.pop() {
                Some(request) => {
                    self.requests.push_back(request);
                    self.taken += 1;
                    added += 1;
                }
                None => break,
            }
        }
        added
    }

    pub fn pop(&mut self) -> Option<DimseRequest> {
        self.requests.pop_front()
    }

    pub fn has_capacity(&self) -> bool {
        self.taken < self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DimseRequest> {
        self.requests.iter()
    }

    /// Remove the requests `keep` turns down, in order
    ///
    /// Once anything is split off the batch is closed to further requests;
    /// later ones would need the same room the split ones lacked.
    pub fn split_off(
        &mut self,
        mut keep: impl FnMut(&DimseRequest) -> bool,
    ) -> Vec<DimseRequest> {
        let (kept, split): (VecDeque<_>, VecDeque<_>) =
            self.requests.drain(..).partition(|request| keep(request));
        self.requests = kept;
        if !split.is_empty() {
            self.limit = self.taken;
        }
        Vec::from(split)
    }

    /// Remove every request that has not been sent yet
    pub fn drain(&mut self) -> impl Iterator<Item = DimseRequest> + '_ {
        self.requests.drain(..)
    }
}
