use crate::download::{
    errors::DownloadError,
    magnet::MagnetOptions,
    ranges::RangeSet,
    source::{RemoteSource, SourceFetcher, SourcePool},
    store::{self, PART_MET_VERSION, PartMet, PartState},
    types::{ContentId, DownloadType, DownloaderId, QueryGuid},
    worker,
};
use crate::logging::{lock_recover, short_hex};
use crate::transfer::{BandwidthSampler, TransferSession, TransferState};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Knobs shared by every downloader a factory builds.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub incomplete_dir: PathBuf,
    /// Bytes requested from a source per fetch.
    pub block_size: u64,
    /// Sources fetched from concurrently per download.
    pub max_busy_sources: usize,
    pub source_timeout: Duration,
    /// Expiry given to sources that arrive without one. `None` keeps them forever.
    pub source_ttl: Option<Duration>,
    pub verify_on_complete: bool,
    /// Activations an in-network download gets before it gives up.
    pub in_network_max_attempts: u32,
    /// Speed reads drop to zero after this long without a sample.
    pub speed_stall_after: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            incomplete_dir: PathBuf::from("data/incomplete"),
            block_size: 184_320,
            max_busy_sources: 4,
            source_timeout: Duration::from_secs(60),
            source_ttl: None,
            verify_on_complete: true,
            in_network_max_attempts: 5,
            speed_stall_after: Duration::from_secs(5),
        }
    }
}

/// Automatic update artifact announced in-network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDescriptor {
    pub content_id: ContentId,
    pub size: u64,
    pub file_name: String,
    pub sources: Vec<RemoteSource>,
}

/// Origin-specific data. The factory is the only place that picks a variant.
#[derive(Debug, Clone)]
pub enum DownloadKind {
    Direct,
    Magnet {
        magnet: MagnetOptions,
    },
    InNetwork {
        update: UpdateDescriptor,
        start_at: SystemTime,
    },
    Resume {
        loaded_from_backup: bool,
    },
}

impl DownloadKind {
    pub fn download_type(&self) -> DownloadType {
        match self {
            Self::Direct => DownloadType::Direct,
            Self::Magnet { .. } => DownloadType::Magnet,
            Self::InNetwork { .. } => DownloadType::InNetwork,
            Self::Resume { .. } => DownloadType::Resume,
        }
    }

    fn start_at(&self) -> Option<SystemTime> {
        match self {
            Self::InNetwork { start_at, .. } => Some(*start_at),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    WaitingForStart,
    WaitingForSources,
    Downloading,
    Verifying,
    Paused,
    Complete,
    Cancelled,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Disk(String),
    SaveLocation(String),
    Corrupt { expected: ContentId, actual: ContentId },
    AttemptsExhausted { attempts: u32 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disk(msg) => write!(f, "disk error: {msg}"),
            Self::SaveLocation(msg) => write!(f, "save location error: {msg}"),
            Self::Corrupt { expected, actual } => {
                write!(f, "content hash mismatch: expected {expected}, got {actual}")
            }
            Self::AttemptsExhausted { attempts } => {
                write!(f, "gave up after {attempts} attempts")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Initializing,
    Initialized,
    Finished,
}

pub(crate) struct Inner {
    phase: Phase,
    pub(crate) state: DownloadState,
    pub(crate) size: Option<u64>,
    pub(crate) acquired: RangeSet,
    pub(crate) reserved: RangeSet,
    pub(crate) pool: SourcePool,
    pub(crate) sampler: BandwidthSampler,
    pub(crate) overwrite: bool,
    pub(crate) failure: Option<FailureReason>,
    /// Bumped whenever the running worker is abandoned; stale workers compare and bail.
    pub(crate) generation: u64,
    /// Acquired ranges changed since the sidecar was last written.
    pub(crate) dirty: bool,
    /// The partial and its sidecar are deleted; nothing may write them again.
    pub(crate) discarded: bool,
    inactive_priority: i32,
    attempts: u32,
    worker: Option<JoinHandle<()>>,
}

impl Inner {
    pub(crate) fn is_complete(&self) -> bool {
        self.size.is_some_and(|s| self.acquired.is_complete(s))
    }
}

/// State reachable from both the owning downloader and its background worker.
pub(crate) struct Shared {
    pub(crate) id: DownloaderId,
    pub(crate) content_id: ContentId,
    pub(crate) download_type: DownloadType,
    pub(crate) file_name: String,
    pub(crate) save_dir: PathBuf,
    pub(crate) incomplete_path: PathBuf,
    pub(crate) start_at: Option<SystemTime>,
    pub(crate) created_unix_secs: u64,
    pub(crate) cfg: Arc<DownloaderConfig>,
    pub(crate) sources_changed: Notify,
    inner: Mutex<Inner>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_recover(&self.inner, "downloader state")
    }

    pub(crate) fn save_path(&self) -> PathBuf {
        self.save_dir.join(&self.file_name)
    }

    fn met_path(&self) -> PathBuf {
        store::met_path_for(&self.incomplete_path)
    }

    fn snapshot_met(&self, inner: &Inner) -> PartMet {
        let state = match inner.state {
            DownloadState::Downloading | DownloadState::Verifying => PartState::Downloading,
            DownloadState::Paused => PartState::Paused,
            DownloadState::Cancelled => PartState::Cancelled,
            DownloadState::Failed => PartState::Error,
            _ => PartState::Queued,
        };
        PartMet {
            version: PART_MET_VERSION,
            content_id: self.content_id,
            file_name: self.file_name.clone(),
            file_size: inner.size,
            save_dir: Some(self.save_dir.clone()),
            download_type: self.download_type,
            state,
            acquired: inner.acquired.clone(),
            retry_count: inner.attempts,
            last_error: inner.failure.as_ref().map(ToString::to_string),
            created_unix_secs: self.created_unix_secs,
            updated_unix_secs: store::unix_now(),
        }
    }

    /// Write the sidecar for the current state. Failures only cost resume fidelity, so they
    /// are logged rather than surfaced.
    pub(crate) async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let met = {
            let mut inner = self.lock();
            if inner.discarded
                || matches!(inner.phase, Phase::Created | Phase::Initializing)
                || matches!(inner.state, DownloadState::Verifying | DownloadState::Complete)
            {
                return;
            }
            inner.dirty = false;
            self.snapshot_met(&inner)
        };
        if let Err(err) = store::save_part_met(&self.met_path(), &met).await
            && crate::logging::warn_throttled("download_persist_failed", Duration::from_secs(30))
        {
            tracing::warn!(id = %self.id, error = %err, "failed to persist part metadata");
        }
    }

    pub(crate) async fn persist_if_dirty(&self) {
        if self.lock().dirty {
            self.persist().await;
        }
    }

    /// Delete the partial and its sidecar and forget every acquired range. Used when the
    /// assembled bytes failed verification, so a later attempt starts from scratch.
    pub(crate) async fn discard_partial(&self) {
        let _guard = self.persist_lock.lock().await;
        {
            let mut inner = self.lock();
            inner.discarded = true;
            inner.dirty = false;
            inner.acquired = RangeSet::new();
        }
        if let Err(err) = tokio::fs::remove_file(&self.incomplete_path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(id = %self.id, error = %err, "failed to delete corrupt partial");
        }
        if let Err(err) = store::remove_part_met(&self.incomplete_path).await {
            tracing::warn!(id = %self.id, error = %err, "failed to delete part metadata");
        }
    }

    pub(crate) fn gate_remaining(&self, now: SystemTime) -> Option<Duration> {
        let start_at = self.start_at?;
        start_at.duration_since(now).ok().filter(|d| !d.is_zero())
    }
}

/// Everything the factory hands over to build a downloader.
pub(crate) struct NewDownloader {
    pub(crate) kind: DownloadKind,
    pub(crate) query_guid: Option<QueryGuid>,
    pub(crate) content_id: ContentId,
    pub(crate) size: Option<u64>,
    pub(crate) file_name: String,
    pub(crate) save_dir: PathBuf,
    pub(crate) incomplete_path: PathBuf,
    pub(crate) overwrite: bool,
    pub(crate) sources: Vec<RemoteSource>,
    pub(crate) acquired: RangeSet,
    pub(crate) attempts: u32,
    pub(crate) created_unix_secs: u64,
}

/// One logical file acquisition, fed by any number of remote sources.
pub struct CoreDownloader {
    kind: DownloadKind,
    query_guid: Option<QueryGuid>,
    fetcher: Arc<dyn SourceFetcher>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CoreDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreDownloader")
            .field("id", &self.shared.id)
            .field("type", &self.shared.download_type)
            .field("content_id", &self.shared.content_id)
            .field("file_name", &self.shared.file_name)
            .finish_non_exhaustive()
    }
}

impl CoreDownloader {
    pub(crate) fn new(
        parts: NewDownloader,
        cfg: Arc<DownloaderConfig>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        let now = Instant::now();
        let mut pool = SourcePool::new();
        for s in parts.sources {
            pool.add(with_default_ttl(s, &cfg), now);
        }
        let state = if parts.kind.start_at().is_some() {
            DownloadState::WaitingForStart
        } else if pool.is_empty() {
            DownloadState::WaitingForSources
        } else {
            DownloadState::Queued
        };
        let shared = Shared {
            id: DownloaderId::next(),
            content_id: parts.content_id,
            download_type: parts.kind.download_type(),
            file_name: parts.file_name,
            save_dir: parts.save_dir,
            incomplete_path: parts.incomplete_path,
            start_at: parts.kind.start_at(),
            created_unix_secs: parts.created_unix_secs,
            cfg,
            sources_changed: Notify::new(),
            inner: Mutex::new(Inner {
                phase: Phase::Created,
                state,
                size: parts.size,
                acquired: parts.acquired,
                reserved: RangeSet::new(),
                pool,
                sampler: BandwidthSampler::default(),
                overwrite: parts.overwrite,
                failure: None,
                generation: 0,
                dirty: false,
                discarded: false,
                inactive_priority: 0,
                attempts: parts.attempts,
                worker: None,
            }),
            persist_lock: tokio::sync::Mutex::new(()),
        };
        Self {
            kind: parts.kind,
            query_guid: parts.query_guid,
            fetcher,
            shared: Arc::new(shared),
        }
    }

    pub fn id(&self) -> DownloaderId {
        self.shared.id
    }

    pub fn kind(&self) -> &DownloadKind {
        &self.kind
    }

    pub fn download_type(&self) -> DownloadType {
        self.shared.download_type
    }

    /// Originating search/request id; `None` for resumed and in-network downloads.
    pub fn query_guid(&self) -> Option<QueryGuid> {
        self.query_guid
    }

    pub fn content_id(&self) -> ContentId {
        self.shared.content_id
    }

    pub fn size(&self) -> Option<u64> {
        self.shared.lock().size
    }

    pub fn file_name(&self) -> &str {
        &self.shared.file_name
    }

    pub fn save_dir(&self) -> &Path {
        &self.shared.save_dir
    }

    pub fn save_path(&self) -> PathBuf {
        self.shared.save_path()
    }

    pub fn incomplete_path(&self) -> &Path {
        &self.shared.incomplete_path
    }

    pub fn download_state(&self) -> DownloadState {
        self.shared.lock().state
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.shared.lock().failure.clone()
    }

    pub fn source_count(&self) -> usize {
        self.shared.lock().pool.len()
    }

    pub fn bytes_acquired(&self) -> u64 {
        self.shared.lock().acquired.covered()
    }

    pub fn attempts(&self) -> u32 {
        self.shared.lock().attempts
    }

    pub fn set_inactive_priority(&self, priority: i32) {
        self.shared.lock().inactive_priority = priority;
    }

    pub fn inactive_priority(&self) -> i32 {
        self.shared.lock().inactive_priority
    }

    /// Only consulted when the finished file is moved into place.
    pub fn set_overwrite(&self, overwrite: bool) {
        self.shared.lock().overwrite = overwrite;
    }

    pub fn overwrite(&self) -> bool {
        self.shared.lock().overwrite
    }

    /// Prepare the partial file and its sidecar. Must run exactly once, before
    /// [`start_download`](Self::start_download).
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut inner = self.shared.lock();
            if inner.phase != Phase::Created {
                return Err(DownloadError::InvalidState(format!(
                    "{} initialized twice",
                    self.shared.id
                )));
            }
            inner.phase = Phase::Initializing;
        }

        if let Err(err) = self.prepare_partial().await {
            let mut inner = self.shared.lock();
            inner.state = DownloadState::Failed;
            inner.failure = Some(FailureReason::Disk(err.to_string()));
            return Err(err);
        }
        {
            let mut inner = self.shared.lock();
            if inner.phase == Phase::Initializing {
                inner.phase = Phase::Initialized;
            }
        }

        self.shared.persist().await;
        tracing::debug!(
            id = %self.shared.id,
            content = %short_hex(&self.shared.content_id.to_hex_lower()),
            partial = %self.shared.incomplete_path.display(),
            "downloader initialized"
        );
        Ok(())
    }

    async fn prepare_partial(&self) -> Result<()> {
        let path = &self.shared.incomplete_path;
        if let Some(parent) = path.parent() {
            store::ensure_dir(parent).await?;
        }

        if matches!(self.kind, DownloadKind::Resume { .. }) {
            tokio::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|source| DownloadError::Disk {
                    path: path.clone(),
                    source,
                })?;
            return Ok(());
        }

        // A partial left behind by an earlier session for the same content is picked up.
        let adopted = self.adopt_existing_partial().await;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|source| DownloadError::Disk {
                path: path.clone(),
                source,
            })?;
        if !adopted {
            file.set_len(0).await.map_err(|source| DownloadError::Disk {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    async fn adopt_existing_partial(&self) -> bool {
        let path = &self.shared.incomplete_path;
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        let Ok((met, _)) = store::load_part_met_with_fallback(&store::met_path_for(path)).await
        else {
            return false;
        };
        // Bytes from a failed download are not trusted.
        if met.state == PartState::Error {
            return false;
        }
        let mut inner = self.shared.lock();
        if met.content_id != self.shared.content_id {
            return false;
        }
        if let (Some(a), Some(b)) = (met.file_size, inner.size)
            && a != b
        {
            return false;
        }
        if met.acquired.high_water() > meta.len() {
            return false;
        }
        if inner.size.is_none() {
            inner.size = met.file_size;
        }
        for r in met.acquired.ranges() {
            inner.acquired.insert(*r);
        }
        tracing::info!(
            id = %self.shared.id,
            bytes = inner.acquired.covered(),
            "adopted existing partial file"
        );
        true
    }

    /// Hand the transfer to a background task. A no-op while already running.
    pub fn start_download(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            DownloadError::InvalidState("start_download requires a tokio runtime".to_string())
        })?;

        let mut inner = self.shared.lock();
        match inner.phase {
            Phase::Created | Phase::Initializing => {
                return Err(DownloadError::InvalidState(format!(
                    "{} started before initialize",
                    self.shared.id
                )));
            }
            Phase::Finished => {
                return Err(DownloadError::InvalidState(format!(
                    "{} started after finish",
                    self.shared.id
                )));
            }
            Phase::Initialized => {}
        }
        if inner.worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        if inner.state.is_terminal() {
            return Err(DownloadError::InvalidState(format!(
                "{} already reached {:?}",
                self.shared.id, inner.state
            )));
        }

        inner.generation += 1;
        inner.attempts = inner.attempts.saturating_add(1);
        inner.reserved = RangeSet::new();
        inner.pool.release_all();
        inner.sampler.reset();
        inner.state = if self.shared.gate_remaining(SystemTime::now()).is_some() {
            DownloadState::WaitingForStart
        } else {
            DownloadState::Downloading
        };
        let generation = inner.generation;
        inner.worker = Some(runtime.spawn(worker::run(
            self.shared.clone(),
            self.fetcher.clone(),
            generation,
        )));
        tracing::info!(
            id = %self.shared.id,
            file = %self.shared.file_name,
            sources = inner.pool.len(),
            attempt = inner.attempts,
            "download started"
        );
        Ok(())
    }

    /// True while a background task holds network resources for this download.
    pub fn is_alive(&self) -> bool {
        self.shared
            .lock()
            .worker
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn should_be_restarted(&self) -> bool {
        let inner = self.shared.lock();
        if inner.phase != Phase::Initialized
            || inner.worker.as_ref().is_some_and(|h| !h.is_finished())
        {
            return false;
        }
        if inner.state.is_terminal() || inner.state == DownloadState::Paused {
            return false;
        }
        if self.shared.gate_remaining(SystemTime::now()).is_some() {
            return false;
        }
        if self.download_type() == DownloadType::InNetwork
            && inner.attempts >= self.shared.cfg.in_network_max_attempts
        {
            return false;
        }
        !inner.pool.is_empty() && inner.size.is_some()
    }

    pub fn should_be_removed(&self) -> bool {
        self.shared.lock().state.is_terminal()
    }

    /// Inactive bookkeeping: prune expired sources and re-evaluate eligibility. Never starts
    /// the download.
    pub fn handle_inactivity(&self) {
        let mut inner = self.shared.lock();
        if inner.phase != Phase::Initialized
            || inner.worker.as_ref().is_some_and(|h| !h.is_finished())
            || inner.state.is_terminal()
        {
            return;
        }

        let pruned = inner.pool.prune_expired(Instant::now());
        if pruned > 0 {
            tracing::debug!(id = %self.shared.id, pruned, "pruned expired sources");
        }

        if self.download_type() == DownloadType::InNetwork
            && inner.attempts >= self.shared.cfg.in_network_max_attempts
        {
            let attempts = inner.attempts;
            inner.state = DownloadState::Failed;
            inner.failure = Some(FailureReason::AttemptsExhausted { attempts });
            tracing::info!(id = %self.shared.id, attempts, "in-network download gave up");
            return;
        }

        if inner.state == DownloadState::Paused {
            return;
        }
        inner.state = if self.shared.gate_remaining(SystemTime::now()).is_some() {
            DownloadState::WaitingForStart
        } else if inner.pool.is_empty() {
            DownloadState::WaitingForSources
        } else {
            DownloadState::Queued
        };
    }

    pub fn is_queuable(&self) -> bool {
        let inner = self.shared.lock();
        inner.phase != Phase::Finished
            && !inner.state.is_terminal()
            && inner.state != DownloadState::Paused
    }

    /// Release the worker, file handles and sources. Safe to call any number of times.
    pub fn finish(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.phase == Phase::Finished {
                return;
            }
            let was_initialized = inner.phase == Phase::Initialized;
            inner.phase = Phase::Finished;
            abandon_worker(&mut inner);
            if !was_initialized {
                return;
            }
        }
        self.persist_in_background();
        tracing::debug!(id = %self.shared.id, "downloader finished");
    }

    /// User cancellation: abandons in-flight I/O, keeps the partial file for a later resume.
    pub fn cancel(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.state.is_terminal() {
                return;
            }
            abandon_worker(&mut inner);
            inner.state = DownloadState::Cancelled;
        }
        tracing::info!(id = %self.shared.id, "download cancelled");
        self.persist_in_background();
    }

    pub fn pause(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.state.is_terminal() || inner.state == DownloadState::Paused {
                return;
            }
            abandon_worker(&mut inner);
            inner.state = DownloadState::Paused;
        }
        tracing::info!(id = %self.shared.id, "download paused");
        self.persist_in_background();
    }

    pub fn resume(&self) {
        let mut inner = self.shared.lock();
        if inner.state == DownloadState::Paused {
            inner.state = if inner.pool.is_empty() {
                DownloadState::WaitingForSources
            } else {
                DownloadState::Queued
            };
        }
    }

    /// Stop an active transfer without penalty so the queue can reschedule it later.
    pub fn park(&self) {
        {
            let mut inner = self.shared.lock();
            if !inner.worker.as_ref().is_some_and(|h| !h.is_finished()) {
                return;
            }
            abandon_worker(&mut inner);
            inner.state = DownloadState::Queued;
        }
        tracing::debug!(id = %self.shared.id, "download parked");
        self.persist_in_background();
    }

    /// Offer a newly discovered source. Rejected when it describes different content.
    pub fn add_source(&self, source: RemoteSource) -> bool {
        if source.content_id != self.shared.content_id {
            return false;
        }
        let mut inner = self.shared.lock();
        if inner.phase == Phase::Finished || inner.state.is_terminal() {
            return false;
        }
        match inner.size {
            Some(size) if size != source.size => return false,
            Some(_) => {}
            None => inner.size = Some(source.size),
        }
        let added = inner
            .pool
            .add(with_default_ttl(source, &self.shared.cfg), Instant::now());
        if added {
            if inner.state == DownloadState::WaitingForSources {
                inner.state = DownloadState::Queued;
            }
            self.shared.sources_changed.notify_one();
        }
        added
    }

    pub fn remove_source(&self, source: &RemoteSource) -> bool {
        self.shared.lock().pool.remove(source.key()).is_some()
    }

    pub fn sources(&self) -> Vec<RemoteSource> {
        self.shared.lock().pool.sources().cloned().collect()
    }

    /// Same content (id and size; an unknown size on either side matches any), or any of
    /// `files` is this download's save or incomplete path.
    pub fn conflicts(&self, content_id: ContentId, size: Option<u64>, files: &[&Path]) -> bool {
        if self.matches_content(content_id, size) {
            return true;
        }
        files
            .iter()
            .any(|f| self.conflicts_save_file(f) || self.conflicts_with_incomplete_file(f))
    }

    pub fn matches_content(&self, content_id: ContentId, size: Option<u64>) -> bool {
        if content_id != self.shared.content_id {
            return false;
        }
        match (size, self.size()) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    pub fn conflicts_with_incomplete_file(&self, incomplete: &Path) -> bool {
        incomplete == self.shared.incomplete_path
    }

    pub fn conflicts_save_file(&self, save_file: &Path) -> bool {
        save_file == self.shared.save_path()
    }

    fn persist_in_background(&self) {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            runtime.spawn(async move { shared.persist().await });
        }
    }
}

fn with_default_ttl(mut source: RemoteSource, cfg: &DownloaderConfig) -> RemoteSource {
    if source.ttl.is_none() {
        source.ttl = cfg.source_ttl;
    }
    source
}

fn abandon_worker(inner: &mut Inner) {
    if let Some(handle) = inner.worker.take() {
        handle.abort();
    }
    inner.generation += 1;
    inner.reserved = RangeSet::new();
    inner.pool.release_all();
    inner.sampler.reset();
}

impl TransferSession for CoreDownloader {
    fn display_name(&self) -> String {
        self.shared.file_name.clone()
    }

    fn size(&self) -> u64 {
        self.shared.lock().size.unwrap_or(0)
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes_acquired()
    }

    fn speed(&self) -> u64 {
        let inner = self.shared.lock();
        if !inner.worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return 0;
        }
        inner
            .sampler
            .rate_at(Instant::now(), self.shared.cfg.speed_stall_after)
    }

    fn state(&self) -> TransferState {
        match self.download_state() {
            DownloadState::Queued => TransferState::Queued,
            DownloadState::WaitingForStart => TransferState::WaitingForStart,
            DownloadState::WaitingForSources => TransferState::WaitingForSources,
            DownloadState::Downloading | DownloadState::Verifying => TransferState::Downloading,
            DownloadState::Paused => TransferState::Paused,
            DownloadState::Complete => TransferState::Complete,
            DownloadState::Cancelled => TransferState::Cancelled,
            DownloadState::Failed => TransferState::Failed,
        }
    }

    fn cancel(&self) {
        CoreDownloader::cancel(self);
    }
}

impl Drop for CoreDownloader {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if let Some(handle) = inner.worker.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{ranges::ByteRange, source::SourceError};
    use futures_util::future::BoxFuture;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("transfer-core-downloader-{tag}-{nanos}"));
        p
    }

    /// Answers the first `serve` requests with zeroes, then never answers again.
    struct StallingFetcher {
        serve: usize,
        calls: AtomicUsize,
    }

    impl StallingFetcher {
        fn new(serve: usize) -> Arc<Self> {
            Arc::new(Self {
                serve,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SourceFetcher for StallingFetcher {
        fn fetch<'a>(
            &'a self,
            _source: &'a RemoteSource,
            range: ByteRange,
        ) -> BoxFuture<'a, std::result::Result<Vec<u8>, SourceError>> {
            Box::pin(async move {
                if self.calls.fetch_add(1, Ordering::SeqCst) < self.serve {
                    return Ok(vec![0u8; range.len() as usize]);
                }
                std::future::pending().await
            })
        }
    }

    struct RefusingFetcher;

    impl SourceFetcher for RefusingFetcher {
        fn fetch<'a>(
            &'a self,
            source: &'a RemoteSource,
            _range: ByteRange,
        ) -> BoxFuture<'a, std::result::Result<Vec<u8>, SourceError>> {
            Box::pin(async move {
                Err(SourceError::Unreachable {
                    addr: source.addr,
                    reason: "connection refused".to_string(),
                })
            })
        }
    }

    const CID: ContentId = ContentId([7; 16]);
    const SIZE: u64 = 1000;

    fn source(last: u8) -> RemoteSource {
        RemoteSource::new(SocketAddr::from(([10, 0, 0, last], 4662)), 0, SIZE, CID)
    }

    fn config(root: &Path) -> DownloaderConfig {
        DownloaderConfig {
            incomplete_dir: root.join("incomplete"),
            block_size: 100,
            max_busy_sources: 1,
            source_timeout: Duration::from_secs(5),
            ..DownloaderConfig::default()
        }
    }

    fn build(
        root: &Path,
        kind: DownloadKind,
        sources: Vec<RemoteSource>,
        cfg: DownloaderConfig,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> CoreDownloader {
        let incomplete_path = store::part_path_for(&cfg.incomplete_dir, CID);
        CoreDownloader::new(
            NewDownloader {
                kind,
                query_guid: None,
                content_id: CID,
                size: Some(SIZE),
                file_name: "file.bin".to_string(),
                save_dir: root.join("done"),
                incomplete_path,
                overwrite: false,
                sources,
                acquired: RangeSet::new(),
                attempts: 0,
                created_unix_secs: 1,
            },
            Arc::new(cfg),
            fetcher,
        )
    }

    async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stored_met(dl: &CoreDownloader) -> PartMet {
        let path = store::met_path_for(dl.incomplete_path());
        let (met, _) = store::load_part_met_with_fallback(&path)
            .await
            .expect("load met");
        met
    }

    #[tokio::test]
    async fn missing_partial_fails_with_disk_error() {
        let root = temp_dir("disk");
        let dl = build(
            &root,
            DownloadKind::Direct,
            vec![source(1)],
            config(&root),
            StallingFetcher::new(usize::MAX),
        );
        dl.initialize().await.expect("initialize");
        tokio::fs::remove_file(dl.incomplete_path())
            .await
            .expect("remove partial");

        dl.start_download().expect("start");
        wait_until("failure", || dl.download_state() == DownloadState::Failed).await;
        assert!(matches!(dl.failure(), Some(FailureReason::Disk(_))));
        assert!(dl.should_be_removed());
        assert!(!dl.is_queuable());
        assert!(!dl.should_be_restarted());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn in_network_download_gives_up_after_max_attempts() {
        let root = temp_dir("attempts");
        let cfg = DownloaderConfig {
            in_network_max_attempts: 2,
            ..config(&root)
        };
        let update = UpdateDescriptor {
            content_id: CID,
            size: SIZE,
            file_name: "update.bin".to_string(),
            sources: Vec::new(),
        };
        let kind = DownloadKind::InNetwork {
            update,
            start_at: std::time::UNIX_EPOCH,
        };
        let dl = build(&root, kind, Vec::new(), cfg, Arc::new(RefusingFetcher));
        dl.initialize().await.expect("initialize");

        for attempt in 1..=2u32 {
            assert!(dl.add_source(source(1)));
            assert!(dl.should_be_restarted());
            dl.start_download().expect("start");
            wait_until("source loss", || {
                !dl.is_alive() && dl.download_state() == DownloadState::WaitingForSources
            })
            .await;
            assert_eq!(dl.attempts(), attempt);
        }

        assert!(dl.add_source(source(2)));
        assert!(!dl.should_be_restarted());
        dl.handle_inactivity();
        assert_eq!(dl.download_state(), DownloadState::Failed);
        assert_eq!(
            dl.failure(),
            Some(FailureReason::AttemptsExhausted { attempts: 2 })
        );
        assert!(dl.should_be_removed());
        assert!(!dl.is_alive());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn paused_download_is_held_back_until_resumed() {
        let root = temp_dir("pause");
        let dl = build(
            &root,
            DownloadKind::Direct,
            vec![source(1)],
            config(&root),
            StallingFetcher::new(0),
        );
        dl.initialize().await.expect("initialize");
        dl.start_download().expect("start");
        assert!(dl.is_alive());

        dl.pause();
        assert!(!dl.is_alive());
        assert_eq!(dl.download_state(), DownloadState::Paused);
        assert!(!dl.is_queuable());
        assert!(!dl.should_be_restarted());
        assert!(!dl.should_be_removed());
        dl.handle_inactivity();
        assert_eq!(dl.download_state(), DownloadState::Paused);

        dl.resume();
        assert_eq!(dl.download_state(), DownloadState::Queued);
        assert!(dl.is_queuable());
        assert!(dl.should_be_restarted());
        assert_eq!(dl.source_count(), 1);

        dl.finish();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn start_while_running_is_a_no_op() {
        let root = temp_dir("restart");
        let dl = build(
            &root,
            DownloadKind::Direct,
            vec![source(1)],
            config(&root),
            StallingFetcher::new(0),
        );
        assert!(matches!(
            dl.start_download(),
            Err(DownloadError::InvalidState(_))
        ));
        dl.initialize().await.expect("initialize");

        dl.start_download().expect("start");
        let generation = dl.shared.lock().generation;
        dl.start_download().expect("second start");
        assert_eq!(dl.attempts(), 1);
        assert_eq!(dl.shared.lock().generation, generation);
        assert!(dl.is_alive());
        assert!(!dl.should_be_restarted());

        dl.finish();
        assert!(!dl.is_alive());
        assert!(matches!(
            dl.start_download(),
            Err(DownloadError::InvalidState(_))
        ));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn inactivity_prunes_expired_sources_without_starting() {
        let root = temp_dir("inactive");
        let short = source(1).with_ttl(Duration::from_millis(1));
        let dl = build(
            &root,
            DownloadKind::Direct,
            vec![short],
            config(&root),
            StallingFetcher::new(0),
        );
        dl.initialize().await.expect("initialize");
        tokio::time::sleep(Duration::from_millis(20)).await;

        dl.handle_inactivity();
        assert_eq!(dl.source_count(), 0);
        assert_eq!(dl.download_state(), DownloadState::WaitingForSources);
        assert!(!dl.is_alive());

        assert!(dl.add_source(source(2)));
        dl.handle_inactivity();
        assert_eq!(dl.source_count(), 1);
        assert_eq!(dl.download_state(), DownloadState::Queued);
        assert!(!dl.is_alive());

        let _ = std::fs::remove_dir_all(root);
    }

    async fn leave_partial(cfg: &DownloaderConfig, state: PartState) -> PathBuf {
        let part = store::part_path_for(&cfg.incomplete_dir, CID);
        store::ensure_dir(&cfg.incomplete_dir).await.expect("mkdir");
        tokio::fs::write(&part, vec![1u8; 300]).await.expect("part");
        let met = PartMet {
            version: PART_MET_VERSION,
            content_id: CID,
            file_name: "file.bin".to_string(),
            file_size: Some(SIZE),
            save_dir: None,
            download_type: DownloadType::Direct,
            state,
            acquired: RangeSet::from_ranges([ByteRange::new(0, 300)]),
            retry_count: 1,
            last_error: None,
            created_unix_secs: 1,
            updated_unix_secs: 1,
        };
        store::save_part_met(&store::met_path_for(&part), &met)
            .await
            .expect("met");
        part
    }

    #[tokio::test]
    async fn leftover_partial_is_adopted_unless_it_failed() {
        let root = temp_dir("adopt");
        let cfg = config(&root);
        leave_partial(&cfg, PartState::Queued).await;
        let dl = build(
            &root,
            DownloadKind::Direct,
            vec![source(1)],
            cfg.clone(),
            StallingFetcher::new(0),
        );
        dl.initialize().await.expect("initialize");
        assert_eq!(dl.bytes_acquired(), 300);
        drop(dl);

        let part = leave_partial(&cfg, PartState::Error).await;
        let dl = build(
            &root,
            DownloadKind::Direct,
            vec![source(1)],
            cfg,
            StallingFetcher::new(0),
        );
        dl.initialize().await.expect("initialize");
        assert_eq!(dl.bytes_acquired(), 0);
        assert_eq!(tokio::fs::metadata(&part).await.expect("part").len(), 0);
        assert_eq!(stored_met(&dl).await.state, PartState::Queued);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn sidecar_is_not_rewritten_per_block() {
        let root = temp_dir("sidecar");
        let dl = build(
            &root,
            DownloadKind::Direct,
            vec![source(1)],
            config(&root),
            StallingFetcher::new(3),
        );
        dl.initialize().await.expect("initialize");
        dl.start_download().expect("start");

        wait_until("three blocks", || dl.bytes_acquired() == 300).await;
        assert_eq!(stored_met(&dl).await.acquired.covered(), 0);
        assert!(dl.shared.lock().dirty);

        dl.pause();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let met = stored_met(&dl).await;
            if met.state == PartState::Paused {
                assert_eq!(met.acquired.covered(), 300);
                break;
            }
            assert!(Instant::now() < deadline, "paused sidecar never written");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!dl.shared.lock().dirty);

        let _ = std::fs::remove_dir_all(root);
    }
}
