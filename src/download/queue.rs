use crate::download::{
    downloader::{CoreDownloader, DownloadState},
    errors::{DownloadError, SaveLocationError},
    source::RemoteSource,
    types::{ContentId, DownloadType, DownloaderId},
};
use crate::logging::lock_recover;
use crate::transfer::TransferSession;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lookup tables for duplicate-acquisition checks, kept in step with the queue's entries.
#[derive(Debug, Default)]
pub struct ConflictIndex {
    by_content: HashMap<ContentId, Vec<DownloaderId>>,
    by_save_path: HashMap<PathBuf, DownloaderId>,
    by_incomplete_path: HashMap<PathBuf, DownloaderId>,
}

impl ConflictIndex {
    fn insert(&mut self, dl: &CoreDownloader) {
        self.by_content
            .entry(dl.content_id())
            .or_default()
            .push(dl.id());
        self.by_save_path.insert(dl.save_path(), dl.id());
        self.by_incomplete_path
            .insert(dl.incomplete_path().to_path_buf(), dl.id());
    }

    fn remove(&mut self, dl: &CoreDownloader) {
        if let Some(ids) = self.by_content.get_mut(&dl.content_id()) {
            ids.retain(|id| *id != dl.id());
            if ids.is_empty() {
                self.by_content.remove(&dl.content_id());
            }
        }
        if self.by_save_path.get(&dl.save_path()) == Some(&dl.id()) {
            self.by_save_path.remove(&dl.save_path());
        }
        if self.by_incomplete_path.get(dl.incomplete_path()) == Some(&dl.id()) {
            self.by_incomplete_path.remove(dl.incomplete_path());
        }
    }

    pub fn content_owners(&self, content_id: ContentId) -> &[DownloaderId] {
        self.by_content
            .get(&content_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn save_path_owner(&self, path: &Path) -> Option<DownloaderId> {
        self.by_save_path.get(path).copied()
    }

    pub fn incomplete_path_owner(&self, path: &Path) -> Option<DownloaderId> {
        self.by_incomplete_path.get(path).copied()
    }
}

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub inactivity_handled: usize,
    pub evicted: usize,
    pub demoted: usize,
    pub activated: usize,
    pub active: usize,
    pub queued: usize,
}

/// Presentation-layer view of one downloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    pub id: DownloaderId,
    pub download_type: DownloadType,
    pub content_urn: String,
    pub file_name: String,
    pub size: Option<u64>,
    pub bytes_acquired: u64,
    pub progress: u8,
    pub speed: u64,
    pub eta_secs: u64,
    pub state: DownloadState,
    pub alive: bool,
    pub sources: usize,
    pub inactive_priority: i32,
    pub failure: Option<String>,
}

impl DownloadSummary {
    fn of(dl: &CoreDownloader) -> Self {
        Self {
            id: dl.id(),
            download_type: dl.download_type(),
            content_urn: dl.content_id().to_urn(),
            file_name: dl.file_name().to_string(),
            size: dl.size(),
            bytes_acquired: dl.bytes_acquired(),
            progress: dl.progress(),
            speed: TransferSession::speed(dl),
            eta_secs: dl.eta_secs(),
            state: dl.download_state(),
            alive: dl.is_alive(),
            sources: dl.source_count(),
            inactive_priority: dl.inactive_priority(),
            failure: dl.failure().map(|f| f.to_string()),
        }
    }
}

struct QueueEntry {
    seq: u64,
    downloader: Arc<CoreDownloader>,
}

struct QueueInner {
    next_seq: u64,
    max_active: usize,
    entries: HashMap<DownloaderId, QueueEntry>,
    index: ConflictIndex,
}

impl QueueInner {
    fn find_conflict(
        &self,
        content_id: ContentId,
        size: Option<u64>,
        files: &[&Path],
    ) -> Option<SaveLocationError> {
        for id in self.index.content_owners(content_id) {
            if let Some(entry) = self.entries.get(id)
                && entry.downloader.matches_content(content_id, size)
            {
                return Some(SaveLocationError::AlreadyDownloading {
                    urn: content_id.to_urn(),
                    size: size.or_else(|| entry.downloader.size()),
                });
            }
        }
        for file in files {
            if self.index.save_path_owner(file).is_some() {
                return Some(SaveLocationError::SavePathInUse {
                    path: file.to_path_buf(),
                });
            }
            if self.index.incomplete_path_owner(file).is_some() {
                return Some(SaveLocationError::IncompleteFileInUse {
                    path: file.to_path_buf(),
                });
            }
        }
        None
    }

    fn remove(&mut self, id: DownloaderId) -> Option<Arc<CoreDownloader>> {
        let entry = self.entries.remove(&id)?;
        self.index.remove(&entry.downloader);
        Some(entry.downloader)
    }

    fn sorted(&self) -> Vec<(u64, Arc<CoreDownloader>)> {
        let mut all: Vec<_> = self
            .entries
            .values()
            .map(|e| (e.seq, e.downloader.clone()))
            .collect();
        all.sort_by_key(|(seq, _)| *seq);
        all
    }
}

/// Every known downloader plus the activation policy over them.
pub struct DownloadQueue {
    inner: Mutex<QueueInner>,
}

impl DownloadQueue {
    pub fn new(max_active: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next_seq: 0,
                max_active: max_active.max(1),
                entries: HashMap::new(),
                index: ConflictIndex::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        lock_recover(&self.inner, "download queue")
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn max_active(&self) -> usize {
        self.lock().max_active
    }

    /// Takes effect on the next pass; excess active downloads are parked then.
    pub fn set_max_active(&self, max_active: usize) {
        self.lock().max_active = max_active.max(1);
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.downloader.is_alive())
            .count()
    }

    pub fn get(&self, id: DownloaderId) -> Option<Arc<CoreDownloader>> {
        self.lock().entries.get(&id).map(|e| e.downloader.clone())
    }

    /// Downloaders in insertion order.
    pub fn downloaders(&self) -> Vec<Arc<CoreDownloader>> {
        self.lock().sorted().into_iter().map(|(_, d)| d).collect()
    }

    pub fn find_conflict(
        &self,
        content_id: ContentId,
        size: Option<u64>,
        files: &[&Path],
    ) -> Option<SaveLocationError> {
        self.lock().find_conflict(content_id, size, files)
    }

    pub fn conflicts(&self, content_id: ContentId, size: Option<u64>, files: &[&Path]) -> bool {
        self.find_conflict(content_id, size, files).is_some()
    }

    /// Conflict check and insertion as one step under the queue lock.
    pub fn try_add(&self, downloader: Arc<CoreDownloader>) -> Result<(), SaveLocationError> {
        let mut inner = self.lock();
        let save_path = downloader.save_path();
        if let Some(err) = inner.find_conflict(
            downloader.content_id(),
            downloader.size(),
            &[save_path.as_path(), downloader.incomplete_path()],
        ) {
            return Err(err);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(&downloader);
        inner.entries.insert(
            downloader.id(),
            QueueEntry {
                seq,
                downloader: downloader.clone(),
            },
        );
        tracing::debug!(id = %downloader.id(), seq, "download queued");
        Ok(())
    }

    /// Register and initialize. A downloader that fails to initialize is removed again.
    pub async fn add(&self, downloader: Arc<CoreDownloader>) -> Result<(), DownloadError> {
        self.try_add(downloader.clone())?;
        if let Err(err) = downloader.initialize().await {
            self.lock().remove(downloader.id());
            downloader.finish();
            return Err(err);
        }
        Ok(())
    }

    /// Evict immediately, releasing the downloader's resources.
    pub fn remove(&self, id: DownloaderId) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(dl) => {
                dl.finish();
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: DownloaderId) -> bool {
        self.with(id, |dl| dl.cancel())
    }

    pub fn pause(&self, id: DownloaderId) -> bool {
        self.with(id, |dl| dl.pause())
    }

    pub fn resume(&self, id: DownloaderId) -> bool {
        self.with(id, |dl| dl.resume())
    }

    pub fn set_inactive_priority(&self, id: DownloaderId, priority: i32) -> bool {
        self.with(id, |dl| dl.set_inactive_priority(priority))
    }

    fn with(&self, id: DownloaderId, f: impl FnOnce(&CoreDownloader)) -> bool {
        match self.get(id) {
            Some(dl) => {
                f(&dl);
                true
            }
            None => false,
        }
    }

    /// Route a discovered source to whichever downloader wants that content.
    pub fn add_source(&self, source: RemoteSource) -> bool {
        let inner = self.lock();
        inner
            .index
            .content_owners(source.content_id)
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .any(|e| e.downloader.add_source(source.clone()))
    }

    /// One scheduling pass. The queue lock is held throughout so structural mutation never
    /// interleaves with it.
    pub fn run_pass(&self) -> PassReport {
        let mut inner = self.lock();
        let mut report = PassReport::default();
        let all = inner.sorted();

        for (_, dl) in &all {
            if !dl.is_alive() && dl.is_queuable() {
                dl.handle_inactivity();
                report.inactivity_handled += 1;
            }
        }

        for (_, dl) in &all {
            if dl.should_be_removed() {
                inner.remove(dl.id());
                dl.finish();
                report.evicted += 1;
                tracing::info!(
                    id = %dl.id(),
                    state = ?dl.download_state(),
                    "download removed from queue"
                );
            }
        }

        let remaining = inner.sorted();
        let mut active: Vec<_> = remaining.iter().filter(|(_, d)| d.is_alive()).collect();
        if active.len() > inner.max_active {
            // Least deserving first: highest priority value, then newest.
            active.sort_by(|(sa, a), (sb, b)| {
                b.inactive_priority()
                    .cmp(&a.inactive_priority())
                    .then(sb.cmp(sa))
            });
            let excess = active.len() - inner.max_active;
            for (_, dl) in active.drain(..excess) {
                dl.park();
                report.demoted += 1;
            }
        }

        let mut active_count = active.len();
        if active_count < inner.max_active {
            let mut candidates: Vec<_> = remaining
                .iter()
                .filter(|(_, d)| d.is_queuable() && d.should_be_restarted())
                .map(|(seq, d)| (d.inactive_priority(), *seq, d.clone()))
                .collect();
            candidates.sort_by_key(|(priority, seq, _)| (*priority, *seq));
            for (_, _, dl) in candidates {
                if active_count >= inner.max_active {
                    break;
                }
                match dl.start_download() {
                    Ok(()) => {
                        active_count += 1;
                        report.activated += 1;
                    }
                    Err(err) => {
                        tracing::warn!(id = %dl.id(), error = %err, "failed to activate download");
                    }
                }
            }
        }

        report.active = active_count;
        report.queued = inner.entries.len();
        report
    }

    pub fn snapshot(&self) -> Vec<DownloadSummary> {
        self.downloaders()
            .iter()
            .map(|d| DownloadSummary::of(d))
            .collect()
    }

    /// Finish and drop every downloader.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        let ids: Vec<_> = inner.entries.keys().copied().collect();
        for id in ids {
            if let Some(dl) = inner.remove(id) {
                dl.finish();
            }
        }
    }
}
