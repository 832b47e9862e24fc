//! Live range request handle

use super::ClientError;
use std::future::Future;
use tokio::task::{AbortHandle, JoinHandle};

/// The single outstanding transfer of one byte range
///
/// The transfer runs on its own task. [`RangeHandle::outcome`] waits for it;
/// [`LiveRequest::abort`] interrupts it from anywhere else.
#[derive(Debug)]
pub struct RangeHandle {
    from_offset: u64,
    join: JoinHandle<Result<u64, ClientError>>,
}

impl RangeHandle {
    /// Spawn `transfer` on the current runtime
    ///
    /// `transfer` resolves to the server's new received-bytes offset.
    pub fn spawn<F>(from_offset: u64, transfer: F) -> Self
    where
        F: Future<Output = Result<u64, ClientError>> + Send + 'static,
    {
        Self {
            from_offset,
            join: tokio::spawn(transfer),
        }
    }

    pub fn from_offset(&self) -> u64 {
        self.from_offset
    }

    /// A cloneable abort capability for this transfer
    pub fn live_request(&self) -> LiveRequest {
        LiveRequest {
            from_offset: self.from_offset,
            abort: self.join.abort_handle(),
        }
    }

    pub fn abort(&self) {
        self.join.abort();
    }

    /// Wait for the transfer; an aborted transfer yields [`ClientError::Aborted`]
    pub async fn outcome(self) -> Result<u64, ClientError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ClientError::Aborted),
            Err(e) => Err(ClientError::TransportError(format!(
                "Range transfer task failed: {}",
                e
            ))),
        }
    }
}

/// Abort capability of a [`RangeHandle`]
#[derive(Debug, Clone)]
pub struct LiveRequest {
    from_offset: u64,
    abort: AbortHandle,
}

impl LiveRequest {
    pub fn from_offset(&self) -> u64 {
        self.from_offset
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}
