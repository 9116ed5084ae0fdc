pub mod bandwidth;

pub use bandwidth::{BandwidthSampler, SAMPLE_INTERVAL};

use serde::Serialize;

/// ETA reported when nothing is moving.
pub const ETA_INFINITE: u64 = u64::MAX;

/// Uploads below this rate (bytes/s) are shown as streaming rather than uploading.
pub const STREAMING_THRESHOLD: u64 = 102_400;

/// Coarse state rendered by the presentation layer for any transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Queued,
    WaitingForStart,
    WaitingForSources,
    Downloading,
    Uploading,
    Streaming,
    Paused,
    Complete,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }
}

/// Read-only view plus cancellation shared by downloads and uploads.
pub trait TransferSession: Send + Sync {
    fn display_name(&self) -> String;

    /// Total size in bytes, `0` while unknown.
    fn size(&self) -> u64;

    fn bytes_transferred(&self) -> u64;

    /// Current averaged speed in bytes/s.
    fn speed(&self) -> u64;

    fn state(&self) -> TransferState;

    fn cancel(&self);

    fn is_complete(&self) -> bool {
        self.state() == TransferState::Complete
    }

    fn progress(&self) -> u8 {
        if self.is_complete() {
            return 100;
        }
        progress_percent(self.bytes_transferred(), self.size())
    }

    /// Seconds left at the current speed, [`ETA_INFINITE`] when stalled.
    fn eta_secs(&self) -> u64 {
        eta_secs(self.size().saturating_sub(self.bytes_transferred()), self.speed())
    }
}

/// `floor(done * 100 / total)`, exactly 100 once `done` reaches `total`.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    if done >= total {
        return 100;
    }
    (u128::from(done) * 100 / u128::from(total)) as u8
}

pub fn eta_secs(remaining: u64, speed: u64) -> u64 {
    if speed == 0 {
        return ETA_INFINITE;
    }
    remaining / speed
}
