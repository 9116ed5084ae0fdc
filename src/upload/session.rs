use crate::logging::lock_recover;
use crate::transfer::{BandwidthSampler, STREAMING_THRESHOLD, TransferSession, TransferState};
use crate::upload::{FileDescriptor, Result, UploadError, UploadId, registry::UploadRegistry};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Uploading,
    Complete,
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    pub(crate) status: UploadStatus,
    bytes_sent: u64,
    sampler: BandwidthSampler,
}

/// One file being served to one peer. Counted in the registry's aggregate until it reaches a
/// terminal status.
#[derive(Debug)]
pub struct PeerUploadSession {
    id: UploadId,
    file: FileDescriptor,
    peer: SocketAddr,
    created_at: SystemTime,
    registry: Arc<UploadRegistry>,
    inner: Mutex<SessionInner>,
}

impl PeerUploadSession {
    /// Create a session and register it with `registry`.
    pub fn start(
        registry: &Arc<UploadRegistry>,
        file: FileDescriptor,
        peer: SocketAddr,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id: UploadId::next(),
            file,
            peer,
            created_at: SystemTime::now(),
            registry: registry.clone(),
            inner: Mutex::new(SessionInner {
                status: UploadStatus::Uploading,
                bytes_sent: 0,
                sampler: BandwidthSampler::default(),
            }),
        });
        registry.register(&session);
        tracing::debug!(
            id = %session.id,
            peer = %session.peer,
            file = %session.file.display_name,
            "upload started"
        );
        session
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        lock_recover(&self.inner, "upload session")
    }

    pub fn id(&self) -> UploadId {
        self.id
    }

    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn status(&self) -> UploadStatus {
        self.lock().status
    }

    pub fn bytes_sent(&self) -> u64 {
        self.lock().bytes_sent
    }

    pub fn add_bytes_sent(&self, n: u64) -> Result<()> {
        self.add_bytes_sent_at(n, Instant::now())
    }

    /// Record `n` more bytes sent at `now` and fold them into the speed sample.
    pub fn add_bytes_sent_at(&self, n: u64, now: Instant) -> Result<()> {
        let mut inner = self.lock();
        if inner.status != UploadStatus::Uploading {
            return Err(UploadError::NotUploading {
                id: self.id,
                status: inner.status,
            });
        }
        let attempted = inner.bytes_sent.saturating_add(n);
        if attempted > self.file.size {
            return Err(UploadError::Overrun {
                id: self.id,
                size: self.file.size,
                attempted,
            });
        }
        inner.bytes_sent = attempted;
        inner.sampler.update(attempted, now);
        Ok(())
    }

    pub fn upload_speed(&self) -> u64 {
        self.upload_speed_at(Instant::now())
    }

    /// Zero once everything is sent or the sample has gone stale.
    pub fn upload_speed_at(&self, now: Instant) -> u64 {
        let inner = self.lock();
        self.speed_locked(&inner, now)
    }

    pub(crate) fn speed_locked(&self, inner: &SessionInner, now: Instant) -> u64 {
        if inner.bytes_sent >= self.file.size {
            return 0;
        }
        inner.sampler.rate_at(now, self.registry.stall_after())
    }

    /// Terminal success; leaves the registry in the same step.
    pub fn complete(&self) {
        let changed = self.registry.finish_session(self.id, || {
            let mut inner = self.lock();
            if inner.status == UploadStatus::Uploading {
                inner.status = UploadStatus::Complete;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(id = %self.id, bytes = self.bytes_sent(), "upload complete");
        }
    }

    /// Abort the upload. A completed upload stays complete.
    pub fn remove(&self) {
        let changed = self.registry.finish_session(self.id, || {
            let mut inner = self.lock();
            if inner.status == UploadStatus::Uploading {
                inner.status = UploadStatus::Cancelled;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(id = %self.id, bytes = self.bytes_sent(), "upload cancelled");
        }
    }
}

impl TransferSession for PeerUploadSession {
    fn display_name(&self) -> String {
        self.file.display_name.clone()
    }

    fn size(&self) -> u64 {
        self.file.size
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes_sent()
    }

    fn speed(&self) -> u64 {
        self.upload_speed()
    }

    fn state(&self) -> TransferState {
        let inner = self.lock();
        match inner.status {
            UploadStatus::Cancelled => TransferState::Cancelled,
            UploadStatus::Complete => TransferState::Complete,
            UploadStatus::Uploading if inner.bytes_sent >= self.file.size => {
                TransferState::Complete
            }
            UploadStatus::Uploading => {
                if self.speed_locked(&inner, Instant::now()) < STREAMING_THRESHOLD {
                    TransferState::Streaming
                } else {
                    TransferState::Uploading
                }
            }
        }
    }

    fn cancel(&self) {
        self.remove();
    }
}

impl Drop for PeerUploadSession {
    fn drop(&mut self) {
        self.registry.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::ContentId;
    use crate::transfer::ETA_INFINITE;
    use std::time::Duration;

    fn file(size: u64) -> FileDescriptor {
        FileDescriptor {
            content_id: ContentId([3; 16]),
            size,
            display_name: "song.ogg".to_string(),
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 2], 4662))
    }

    #[test]
    fn speed_reflects_only_the_latest_window() {
        let registry = Arc::new(UploadRegistry::new());
        let s = PeerUploadSession::start(&registry, file(10_000), peer());
        let t0 = Instant::now();

        s.add_bytes_sent_at(500, t0).expect("first");
        assert_eq!(s.upload_speed_at(t0), 0);
        s.add_bytes_sent_at(500, t0 + Duration::from_millis(1000))
            .expect("second");
        assert_eq!(s.upload_speed_at(t0 + Duration::from_millis(1000)), 500);
        assert_eq!(s.bytes_sent(), 1000);
    }

    #[test]
    fn slow_upload_reports_streaming() {
        let registry = Arc::new(UploadRegistry::new());
        let s = PeerUploadSession::start(&registry, file(10_000_000), peer());
        let t0 = Instant::now();
        s.add_bytes_sent_at(1, t0).expect("prime");
        s.add_bytes_sent_at(1000, t0 + Duration::from_secs(1))
            .expect("slow");
        assert_eq!(s.state(), TransferState::Streaming);

        let fast = PeerUploadSession::start(&registry, file(10_000_000), peer());
        fast.add_bytes_sent_at(1, t0).expect("prime");
        fast.add_bytes_sent_at(200_000, t0 + Duration::from_secs(1))
            .expect("fast");
        assert_eq!(fast.state(), TransferState::Uploading);
    }

    #[test]
    fn eta_is_infinite_when_idle_and_progress_hits_100() {
        let registry = Arc::new(UploadRegistry::new());
        let s = PeerUploadSession::start(&registry, file(1000), peer());
        assert_eq!(s.eta_secs(), ETA_INFINITE);
        s.add_bytes_sent(333).expect("send");
        assert_eq!(s.progress(), 33);
        s.add_bytes_sent(667).expect("send rest");
        assert_eq!(s.progress(), 100);
        assert!(s.is_complete());
        assert_eq!(s.upload_speed(), 0);
    }

    #[test]
    fn terminal_sessions_reject_bytes_and_leave_registry() {
        let registry = Arc::new(UploadRegistry::new());
        let a = PeerUploadSession::start(&registry, file(100), peer());
        let b = PeerUploadSession::start(&registry, file(100), peer());
        assert_eq!(registry.len(), 2);

        a.complete();
        assert_eq!(a.status(), UploadStatus::Complete);
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            a.add_bytes_sent(1),
            Err(UploadError::NotUploading { .. })
        ));

        // remove() never downgrades a completed upload
        a.remove();
        assert_eq!(a.status(), UploadStatus::Complete);

        b.remove();
        assert_eq!(b.state(), TransferState::Cancelled);
        b.complete();
        assert_eq!(b.status(), UploadStatus::Cancelled);
        assert!(registry.is_empty());
    }

    #[test]
    fn overrun_is_rejected() {
        let registry = Arc::new(UploadRegistry::new());
        let s = PeerUploadSession::start(&registry, file(10), peer());
        assert!(matches!(
            s.add_bytes_sent(11),
            Err(UploadError::Overrun { attempted: 11, .. })
        ));
        assert_eq!(s.bytes_sent(), 0);
    }

    #[test]
    fn dropping_a_session_unregisters_it() {
        let registry = Arc::new(UploadRegistry::new());
        let s = PeerUploadSession::start(&registry, file(10), peer());
        assert_eq!(registry.len(), 1);
        drop(s);
        assert!(registry.is_empty());
    }
}
