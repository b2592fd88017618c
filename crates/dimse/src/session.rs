//! Lifetime guard around a negotiated association

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::association::{Association, AssociationInfo, ResponseSender};
use crate::request::DimseRequest;
use crate::{DimseError, Result};

/// Client-side owner of one association
///
/// Release, abort and dispose reach the wrapped association at most once,
/// whichever is called first. Sending after any of them fails with
/// [`DimseError::AssociationDisposed`]. Dropping the guard disposes the
/// association.
pub struct ClientAssociation {
    inner: Box<dyn Association>,
    closing: AtomicBool,
    disposed: AtomicBool,
}

impl ClientAssociation {
    pub fn new(inner: Box<dyn Association>) -> Self {
        Self {
            inner,
            closing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> &AssociationInfo {
        self.inner.info()
    }

    /// Whether requests may still be submitted
    pub fn can_send_requests(&self) -> bool {
        !self.closing.load(Ordering::Acquire)
            && !self.is_disposed()
            && self.inner.can_send_requests()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Transmit a request, see [`Association::send_request`]
    pub async fn send_request(
        &self,
        request: &DimseRequest,
        responses: ResponseSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.closing.load(Ordering::Acquire) || self.is_disposed() {
            return Err(DimseError::AssociationDisposed);
        }
        self.inner.send_request(request, responses, cancel).await
    }

    /// Release the association; later calls return immediately
    pub async fn release(&self, cancel: CancellationToken) -> Result<()> {
        if !self.begin_closing() {
            debug!("Association already closing, skipping release");
            return Ok(());
        }
        self.inner.release(cancel).await
    }

    /// Abort the association; later calls return immediately
    pub async fn abort(&self, cancel: CancellationToken) -> Result<()> {
        if !self.begin_closing() {
            debug!("Association already closing, skipping abort");
            return Ok(());
        }
        self.inner.abort(cancel).await
    }

    /// Close the underlying connection
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.inner.dispose();
        }
    }

    fn begin_closing(&self) -> bool {
        !self.is_disposed() && !self.closing.swap(true, Ordering::AcqRel)
    }
}

impl Drop for ClientAssociation {
    fn drop(&mut self) {
        self.dispose();
    }
}
