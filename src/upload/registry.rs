use crate::logging::{lock_recover, warn_throttled};
use crate::upload::{UploadId, session::PeerUploadSession};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// Default age after which a session's last sample no longer counts as current speed.
pub const DEFAULT_STALL_AFTER: Duration = Duration::from_secs(5);

/// Live uploads, for aggregate outbound bandwidth.
///
/// Membership changes and the aggregate read are serialized on one lock. Sessions are held
/// weakly so a dropped session never keeps itself counted.
#[derive(Debug)]
pub struct UploadRegistry {
    sessions: Mutex<HashMap<UploadId, Weak<PeerUploadSession>>>,
    stall_after: Duration,
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::with_stall_after(DEFAULT_STALL_AFTER)
    }

    pub fn with_stall_after(stall_after: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            stall_after,
        }
    }

    pub fn stall_after(&self) -> Duration {
        self.stall_after
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UploadId, Weak<PeerUploadSession>>> {
        lock_recover(&self.sessions, "upload registry")
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sessions(&self) -> Vec<Arc<PeerUploadSession>> {
        self.lock().values().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn register(&self, session: &Arc<PeerUploadSession>) {
        self.lock().insert(session.id(), Arc::downgrade(session));
    }

    /// Run a session's terminal transition and drop its membership under the registry lock.
    pub(crate) fn finish_session(&self, id: UploadId, transition: impl FnOnce() -> bool) -> bool {
        let mut map = self.lock();
        let changed = transition();
        map.remove(&id);
        changed
    }

    pub(crate) fn forget(&self, id: UploadId) {
        self.lock().remove(&id);
    }

    /// Sum of current speeds over live uploads. Never fails: any problem reads as 0.
    pub fn total_bandwidth(&self) -> u64 {
        self.total_bandwidth_at(Instant::now())
    }

    pub fn total_bandwidth_at(&self, now: Instant) -> u64 {
        let (total, live) = {
            let map = match self.sessions.lock() {
                Ok(m) => m,
                Err(_) => {
                    if warn_throttled("upload_registry_poisoned", Duration::from_secs(60)) {
                        tracing::warn!("upload registry lock poisoned; reporting zero bandwidth");
                    }
                    return 0;
                }
            };
            let live: Vec<Arc<PeerUploadSession>> =
                map.values().filter_map(Weak::upgrade).collect();
            let total = live.iter().try_fold(0u64, |acc, s| {
                let inner = s.lock();
                acc.checked_add(s.speed_locked(&inner, now))
            });
            (total, live)
        };
        // Strong refs are released only after the lock so a final drop can unregister.
        drop(live);

        match total {
            Some(total) => total,
            None => {
                if warn_throttled("upload_bandwidth_overflow", Duration::from_secs(60)) {
                    tracing::warn!("aggregate upload bandwidth overflowed; reporting zero");
                }
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::ContentId;
    use crate::upload::FileDescriptor;
    use std::net::SocketAddr;

    fn start(registry: &Arc<UploadRegistry>) -> Arc<PeerUploadSession> {
        PeerUploadSession::start(
            registry,
            FileDescriptor {
                content_id: ContentId([1; 16]),
                size: u64::MAX,
                display_name: "f".to_string(),
            },
            SocketAddr::from(([127, 0, 0, 1], 4662)),
        )
    }

    #[test]
    fn empty_registry_reports_zero() {
        assert_eq!(UploadRegistry::new().total_bandwidth(), 0);
    }

    #[test]
    fn aggregate_sums_live_sessions() {
        let registry = Arc::new(UploadRegistry::new());
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let sessions: Vec<_> = [1000u64, 2000, 3000]
            .into_iter()
            .map(|rate| {
                let s = start(&registry);
                s.add_bytes_sent_at(0, t0).expect("prime");
                s.add_bytes_sent_at(rate, t1).expect("sample");
                s
            })
            .collect();
        assert_eq!(registry.total_bandwidth_at(t1), 6000);

        sessions[0].complete();
        assert_eq!(registry.total_bandwidth_at(t1), 5000);

        // Stale samples stop counting.
        assert_eq!(registry.total_bandwidth_at(t1 + Duration::from_secs(60)), 0);
    }

    #[test]
    fn overflow_is_suppressed_to_zero() {
        let registry = Arc::new(UploadRegistry::new());
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(1000);
        let a = start(&registry);
        let b = start(&registry);
        for s in [&a, &b] {
            s.add_bytes_sent_at(0, t0).expect("prime");
            s.add_bytes_sent_at(u64::MAX / 2 + 1, t1).expect("huge");
        }
        // Each rate is over half of u64::MAX; together they overflow.
        assert_eq!(registry.total_bandwidth_at(t1), 0);
    }

    #[test]
    fn poisoned_registry_reports_zero() {
        let registry = Arc::new(UploadRegistry::new());
        let s = start(&registry);
        let r = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = r.sessions.lock().expect("lock");
            panic!("poison the registry");
        })
        .join();
        assert_eq!(registry.total_bandwidth(), 0);

        // Membership keeps working on the recovered map.
        assert_eq!(registry.len(), 1);
        let t = start(&registry);
        assert_eq!(registry.sessions().len(), 2);
        t.remove();
        drop(s);
        assert!(registry.is_empty());
    }
}
