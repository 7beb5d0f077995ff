//! Progress reporting for long-running transfers.

/// Phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Encryption,
    Upload,
    Download,
    Decryption,
}

/// A progress sample: `done` of `total` bytes in the given phase.
///
/// `total` is `None` when the size is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub state: ProgressState,
    pub done: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn new(state: ProgressState, done: u64, total: Option<u64>) -> Self {
        Self { state, done, total }
    }

    /// Completed fraction in `0.0..=1.0`, if the total is known and non-zero.
    pub fn ratio(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.done.min(total) as f64) / (total as f64)),
            None => None,
        }
    }
}

/// Receiver of progress samples.
pub trait ProgressAware: Send + Sync {
    fn on_progress(&self, progress: Progress);
}

/// Discards all progress samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressAware for NoProgress {
    fn on_progress(&self, _progress: Progress) {}
}
