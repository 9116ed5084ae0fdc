use crate::download::{ranges::ByteRange, types::ContentId};
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One peer's offer of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub addr: SocketAddr,
    /// File index/handle at that peer.
    pub index: u32,
    pub size: u64,
    pub content_id: ContentId,
    /// How long the offer stays usable while the download is inactive. `None` never expires.
    pub ttl: Option<Duration>,
}

impl RemoteSource {
    pub fn new(addr: SocketAddr, index: u32, size: u64, content_id: ContentId) -> Self {
        Self {
            addr,
            index,
            size,
            content_id,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn key(&self) -> SourceKey {
        SourceKey {
            addr: self.addr,
            index: self.index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub addr: SocketAddr,
    pub index: u32,
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.addr, self.index)
    }
}

#[derive(Debug)]
pub enum SourceError {
    Unreachable { addr: SocketAddr, reason: String },
    Timeout { addr: SocketAddr },
    InvalidData { addr: SocketAddr, reason: String },
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable { addr, reason } => write!(f, "source {addr} unreachable: {reason}"),
            Self::Timeout { addr } => write!(f, "source {addr} stalled"),
            Self::InvalidData { addr, reason } => {
                write!(f, "source {addr} sent invalid data: {reason}")
            }
        }
    }
}

impl std::error::Error for SourceError {}

/// Network side of a download: fetches one byte range from one source.
///
/// The wire protocol lives behind this trait. Implementations must be cancel-safe: the
/// download may drop the returned future at any point.
pub trait SourceFetcher: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        source: &'a RemoteSource,
        range: ByteRange,
    ) -> BoxFuture<'a, Result<Vec<u8>, SourceError>>;
}

#[derive(Debug, Clone)]
struct SourceEntry {
    source: RemoteSource,
    added: Instant,
    busy: bool,
    bytes_served: u64,
}

/// Mutable candidate set owned by one downloader. Iteration order carries no meaning.
#[derive(Debug, Default)]
pub struct SourcePool {
    by_key: BTreeMap<SourceKey, SourceEntry>,
}

impl SourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn busy_count(&self) -> usize {
        self.by_key.values().filter(|e| e.busy).count()
    }

    pub fn contains(&self, key: SourceKey) -> bool {
        self.by_key.contains_key(&key)
    }

    /// Returns false when the source was already known; a re-announced source gets a fresh
    /// expiry.
    pub fn add(&mut self, source: RemoteSource, now: Instant) -> bool {
        match self.by_key.get_mut(&source.key()) {
            Some(entry) => {
                entry.added = now;
                entry.source.ttl = source.ttl;
                false
            }
            None => {
                self.by_key.insert(
                    source.key(),
                    SourceEntry {
                        source,
                        added: now,
                        busy: false,
                        bytes_served: 0,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, key: SourceKey) -> Option<RemoteSource> {
        self.by_key.remove(&key).map(|e| e.source)
    }

    /// Mark up to `limit` idle sources busy and hand them out.
    pub fn checkout_idle(&mut self, limit: usize) -> Vec<RemoteSource> {
        let mut out = Vec::new();
        for entry in self.by_key.values_mut() {
            if out.len() >= limit {
                break;
            }
            if !entry.busy {
                entry.busy = true;
                out.push(entry.source.clone());
            }
        }
        out
    }

    pub fn release(&mut self, key: SourceKey) {
        if let Some(entry) = self.by_key.get_mut(&key) {
            entry.busy = false;
        }
    }

    pub fn release_all(&mut self) {
        for entry in self.by_key.values_mut() {
            entry.busy = false;
        }
    }

    pub fn record_served(&mut self, key: SourceKey, bytes: u64) {
        if let Some(entry) = self.by_key.get_mut(&key) {
            entry.bytes_served = entry.bytes_served.saturating_add(bytes);
        }
    }

    pub fn bytes_served(&self, key: SourceKey) -> u64 {
        self.by_key.get(&key).map_or(0, |e| e.bytes_served)
    }

    /// Drop idle sources whose ttl ran out. Returns how many were removed.
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let before = self.by_key.len();
        self.by_key.retain(|_, e| {
            e.busy
                || e.source
                    .ttl
                    .is_none_or(|ttl| now.saturating_duration_since(e.added) < ttl)
        });
        before - self.by_key.len()
    }

    pub fn sources(&self) -> impl Iterator<Item = &RemoteSource> {
        self.by_key.values().map(|e| &e.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(port: u16, ttl: Option<Duration>) -> RemoteSource {
        RemoteSource {
            addr: SocketAddr::from(([10, 0, 0, 1], port)),
            index: 1,
            size: 1000,
            content_id: ContentId([1; 16]),
            ttl,
        }
    }

    #[test]
    fn add_deduplicates_by_address_and_index() {
        let now = Instant::now();
        let mut pool = SourcePool::new();
        assert!(pool.add(src(1, None), now));
        assert!(!pool.add(src(1, None), now));
        assert!(pool.add(src(2, None), now));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn checkout_marks_busy_until_release() {
        let now = Instant::now();
        let mut pool = SourcePool::new();
        pool.add(src(1, None), now);
        pool.add(src(2, None), now);
        let first = pool.checkout_idle(1);
        assert_eq!(first.len(), 1);
        assert_eq!(pool.busy_count(), 1);
        let rest = pool.checkout_idle(8);
        assert_eq!(rest.len(), 1);
        assert!(pool.checkout_idle(8).is_empty());
        pool.release(first[0].key());
        assert_eq!(pool.checkout_idle(8).len(), 1);
    }

    #[test]
    fn prune_drops_only_expired_idle_sources() {
        let now = Instant::now();
        let mut pool = SourcePool::new();
        pool.add(src(1, Some(Duration::from_secs(10))), now);
        pool.add(src(2, None), now);
        pool.add(src(3, Some(Duration::from_secs(10))), now);
        let busy = pool.checkout_idle(1);
        assert_eq!(busy[0].addr.port(), 1);

        let removed = pool.prune_expired(now + Duration::from_secs(11));
        assert_eq!(removed, 1);
        assert!(pool.contains(src(1, None).key()));
        assert!(pool.contains(src(2, None).key()));
        assert!(!pool.contains(src(3, None).key()));
    }
}
