use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Error categories surfaced by the peak calling engine
///
/// Warnings (low SNR, swapped states, undetectable fragmentation) are logged
/// and never represented here.
///
#[derive(Debug, Error)]
pub enum OmnipeakError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("input error: {0}")]
    Input(String),

    #[error("stored model is incompatible: {0}")]
    ModelMismatch(String),

    /// Cooperative cancellation, reported as a distinct kind from failure
    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error on '{path}': {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

impl OmnipeakError {
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type OmnipeakResult<T> = Result<T, OmnipeakError>;

/// Cooperative cancellation flag shared between the engine and its caller
///
/// Long loops (EM iterations, sensitivity sweeps, per-chromosome scoring)
/// call `checkpoint` at safe points and discard partial buffers on cancel.
///
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the engine observes the flag at its next
    /// checkpoint
    #[allow(dead_code)]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn checkpoint(&self) -> OmnipeakResult<()> {
        if self.is_cancelled() {
            Err(OmnipeakError::Cancelled)
        } else {
            Ok(())
        }
    }
}
