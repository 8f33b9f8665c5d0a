use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GateError {
    #[error("readiness gate was already opened")]
    AlreadyOpen,
}

/// Write-once latch flipped when the consumer first joins its group.
///
/// Clones share the same state. Opening twice is a bug in the caller and is
/// reported instead of being ignored.
#[derive(Clone, Default)]
pub struct ReadinessGate {
    opened: Arc<AtomicBool>,
    signal: CancellationToken,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) -> Result<(), GateError> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(GateError::AlreadyOpen);
        }
        self.signal.cancel();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        self.signal.cancelled().await
    }

    /// Readiness probe: 200 once the gate is open, 503 before.
    pub async fn check(&self) -> StatusCode {
        if self.is_open() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
