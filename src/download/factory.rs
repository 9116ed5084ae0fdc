use crate::download::{
    downloader::{CoreDownloader, DownloadKind, DownloaderConfig, NewDownloader, UpdateDescriptor},
    errors::{DownloadError, SaveLocationError},
    magnet::MagnetOptions,
    queue::DownloadQueue,
    ranges::RangeSet,
    source::{RemoteSource, SourceFetcher},
    store::{self, LoadedMetSource},
    types::QueryGuid,
};
use std::path::{Path, PathBuf};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::SystemTime;

pub type Result<T> = std::result::Result<T, DownloadError>;

const MAX_FILE_NAME_BYTES: usize = 255;

/// The only place that knows how each kind of download is put together. Every creation
/// validates the destination and registers the result with the queue before returning.
pub struct DownloaderFactory {
    queue: Arc<DownloadQueue>,
    fetcher: Arc<dyn SourceFetcher>,
    cfg: Arc<DownloaderConfig>,
    default_save_dir: PathBuf,
}

impl DownloaderFactory {
    pub fn new(
        queue: Arc<DownloadQueue>,
        fetcher: Arc<dyn SourceFetcher>,
        cfg: DownloaderConfig,
        default_save_dir: PathBuf,
    ) -> Self {
        Self {
            queue,
            fetcher,
            cfg: Arc::new(cfg),
            default_save_dir,
        }
    }

    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    pub fn default_save_dir(&self) -> &Path {
        &self.default_save_dir
    }

    /// Multi-source download for results of a search.
    pub async fn create_direct(
        &self,
        sources: Vec<RemoteSource>,
        query_guid: QueryGuid,
        save_dir: Option<PathBuf>,
        file_name: &str,
        overwrite: bool,
    ) -> Result<Arc<CoreDownloader>> {
        let first = sources.first().ok_or(SaveLocationError::NoSources)?;
        let (content_id, size) = (first.content_id, first.size);
        if let Some(odd) = sources
            .iter()
            .find(|s| s.content_id != content_id || s.size != size)
        {
            return Err(SaveLocationError::MismatchedSources {
                expected_urn: format!("{} ({size} bytes)", content_id.to_urn()),
                found_urn: format!("{} ({} bytes)", odd.content_id.to_urn(), odd.size),
            }
            .into());
        }

        let save_dir = save_dir.unwrap_or_else(|| self.default_save_dir.clone());
        self.validate_destination(&save_dir, file_name, overwrite)
            .await?;
        let incomplete_path = store::part_path_for(&self.cfg.incomplete_dir, content_id);

        self.register(NewDownloader {
            kind: DownloadKind::Direct,
            query_guid: Some(query_guid),
            content_id,
            size: Some(size),
            file_name: file_name.to_string(),
            save_dir,
            incomplete_path,
            overwrite,
            sources,
            acquired: RangeSet::new(),
            attempts: 0,
            created_unix_secs: store::unix_now(),
        })
        .await
    }

    /// Download from magnet metadata. May start without any source.
    pub async fn create_magnet(
        &self,
        magnet: MagnetOptions,
        query_guid: Option<QueryGuid>,
        save_dir: Option<PathBuf>,
        file_name: Option<&str>,
        overwrite: bool,
    ) -> Result<Arc<CoreDownloader>> {
        let file_name = file_name
            .map(str::to_string)
            .or_else(|| magnet.display_name.clone())
            .unwrap_or_else(|| magnet.content_id.to_hex_lower());
        let save_dir = save_dir.unwrap_or_else(|| self.default_save_dir.clone());
        self.validate_destination(&save_dir, &file_name, overwrite)
            .await?;
        let incomplete_path = store::part_path_for(&self.cfg.incomplete_dir, magnet.content_id);

        self.register(NewDownloader {
            query_guid,
            content_id: magnet.content_id,
            size: magnet.size,
            file_name,
            save_dir,
            incomplete_path,
            overwrite,
            sources: magnet.sources(),
            acquired: RangeSet::new(),
            attempts: 0,
            created_unix_secs: store::unix_now(),
            kind: DownloadKind::Magnet { magnet },
        })
        .await
    }

    /// Automatic update download. Not eligible for activation before `start_at`.
    pub async fn create_in_network(
        &self,
        update: UpdateDescriptor,
        save_dir: PathBuf,
        start_at: SystemTime,
    ) -> Result<Arc<CoreDownloader>> {
        if let Some(odd) = update
            .sources
            .iter()
            .find(|s| s.content_id != update.content_id || s.size != update.size)
        {
            return Err(SaveLocationError::MismatchedSources {
                expected_urn: update.content_id.to_urn(),
                found_urn: odd.content_id.to_urn(),
            }
            .into());
        }
        // Update artifacts always replace an older copy.
        self.validate_destination(&save_dir, &update.file_name, true)
            .await?;
        let incomplete_path = store::part_path_for(&self.cfg.incomplete_dir, update.content_id);

        self.register(NewDownloader {
            query_guid: None,
            content_id: update.content_id,
            size: Some(update.size),
            file_name: update.file_name.clone(),
            save_dir,
            incomplete_path,
            overwrite: true,
            sources: update.sources.clone(),
            acquired: RangeSet::new(),
            attempts: 0,
            created_unix_secs: store::unix_now(),
            kind: DownloadKind::InNetwork { update, start_at },
        })
        .await
    }

    /// Rebuild a download from a partial file and its sidecar. The claimed size must agree
    /// with what the sidecar recorded.
    pub async fn create_resume(
        &self,
        partial: &Path,
        file_name: &str,
        size: u64,
    ) -> Result<Arc<CoreDownloader>> {
        let unreadable = |reason: String| SaveLocationError::PartialUnreadable {
            path: partial.to_path_buf(),
            reason,
        };
        let inconsistent = |reason: String| SaveLocationError::PartialInconsistent {
            path: partial.to_path_buf(),
            reason,
        };

        let on_disk = tokio::fs::metadata(partial)
            .await
            .map_err(|e| unreadable(e.to_string()))?;
        if !on_disk.is_file() {
            return Err(unreadable("not a regular file".to_string()).into());
        }
        let (met, loaded_from) = store::load_part_met_with_fallback(&store::met_path_for(partial))
            .await
            .map_err(|e| unreadable(e.to_string()))?;

        if let Some(recorded) = met.file_size
            && recorded != size
        {
            return Err(inconsistent(format!(
                "claimed size {size} but metadata records {recorded}"
            ))
            .into());
        }
        if met.acquired.high_water() > size {
            return Err(inconsistent(format!(
                "acquired ranges end at {} beyond size {size}",
                met.acquired.high_water()
            ))
            .into());
        }
        if met.acquired.high_water() > on_disk.len() {
            return Err(inconsistent(format!(
                "file holds {} bytes but metadata claims data up to {}",
                on_disk.len(),
                met.acquired.high_water()
            ))
            .into());
        }

        let file_name = if file_name.is_empty() {
            met.file_name.clone()
        } else {
            file_name.to_string()
        };
        let save_dir = met
            .save_dir
            .clone()
            .unwrap_or_else(|| self.default_save_dir.clone());
        self.validate_destination(&save_dir, &file_name, false)
            .await?;

        self.register(NewDownloader {
            kind: DownloadKind::Resume {
                loaded_from_backup: loaded_from == LoadedMetSource::Backup,
            },
            query_guid: None,
            content_id: met.content_id,
            size: Some(size),
            file_name,
            save_dir,
            incomplete_path: partial.to_path_buf(),
            overwrite: false,
            sources: Vec::new(),
            acquired: met.acquired,
            attempts: 0,
            created_unix_secs: met.created_unix_secs,
        })
        .await
    }

    async fn register(&self, parts: NewDownloader) -> Result<Arc<CoreDownloader>> {
        let downloader = Arc::new(CoreDownloader::new(
            parts,
            self.cfg.clone(),
            self.fetcher.clone(),
        ));
        self.queue.add(downloader.clone()).await?;
        tracing::info!(
            id = %downloader.id(),
            kind = ?downloader.download_type(),
            content = %downloader.content_id(),
            file = %downloader.file_name(),
            "download created"
        );
        Ok(downloader)
    }

    async fn validate_destination(
        &self,
        save_dir: &Path,
        file_name: &str,
        overwrite: bool,
    ) -> std::result::Result<(), SaveLocationError> {
        validate_file_name(file_name)?;
        validate_directory(save_dir).await?;
        let target = save_dir.join(file_name);
        if !overwrite && tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(SaveLocationError::FileAlreadyExists { path: target });
        }
        Ok(())
    }
}

pub fn validate_file_name(name: &str) -> std::result::Result<(), SaveLocationError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > MAX_FILE_NAME_BYTES
        || name.chars().any(|c| c == '/' || c == '\\' || c == '\0');
    if invalid {
        return Err(SaveLocationError::InvalidFileName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Directory must exist and accept new files.
pub async fn validate_directory(dir: &Path) -> std::result::Result<(), SaveLocationError> {
    let meta = match tokio::fs::metadata(dir).await {
        Ok(m) => m,
        Err(_) => {
            return Err(SaveLocationError::DirectoryMissing {
                path: dir.to_path_buf(),
            });
        }
    };
    if !meta.is_dir() {
        return Err(SaveLocationError::NotADirectory {
            path: dir.to_path_buf(),
        });
    }

    static CHECK_SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = CHECK_SEQ.fetch_add(1, Ordering::Relaxed);
    let marker = dir.join(format!(".write-check-{}-{seq}", std::process::id()));
    let not_writable = |source| SaveLocationError::DirectoryNotWritable {
        path: dir.to_path_buf(),
        source,
    };
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&marker)
        .await
        .map_err(not_writable)?;
    tokio::fs::remove_file(&marker).await.map_err(not_writable)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{
        ranges::ByteRange,
        source::SourceError,
        types::{ContentId, DownloadType},
    };
    use crate::transfer::TransferSession;
    use futures_util::future::BoxFuture;
    use std::net::SocketAddr;

    struct NeverFetcher;

    impl SourceFetcher for NeverFetcher {
        fn fetch<'a>(
            &'a self,
            _source: &'a RemoteSource,
            _range: ByteRange,
        ) -> BoxFuture<'a, std::result::Result<Vec<u8>, SourceError>> {
            Box::pin(std::future::pending())
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("transfer-core-factory-{tag}-{nanos}"));
        p
    }

    async fn factory(root: &Path) -> DownloaderFactory {
        let save = root.join("complete");
        tokio::fs::create_dir_all(&save).await.expect("mkdir");
        DownloaderFactory::new(
            Arc::new(DownloadQueue::new(2)),
            Arc::new(NeverFetcher),
            DownloaderConfig {
                incomplete_dir: root.join("incomplete"),
                ..DownloaderConfig::default()
            },
            save,
        )
    }

    fn source(seed: u8, port: u16, size: u64) -> RemoteSource {
        RemoteSource::new(
            SocketAddr::from(([10, 0, 0, 1], port)),
            0,
            size,
            ContentId([seed; 16]),
        )
    }

    #[test]
    fn file_name_rules() {
        assert!(validate_file_name("movie.mkv").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "nul\0"] {
            assert!(validate_file_name(bad).is_err(), "{bad:?}");
        }
        assert!(validate_file_name(&"x".repeat(256)).is_err());
    }

    #[tokio::test]
    async fn direct_creation_validates_before_constructing() {
        let root = temp_dir("direct");
        let f = factory(&root).await;

        let err = f
            .create_direct(Vec::new(), QueryGuid([0; 16]), None, "a.bin", false)
            .await
            .expect_err("no sources");
        assert!(err.is_save_location());

        let err = f
            .create_direct(
                vec![source(1, 1, 100), source(2, 2, 100)],
                QueryGuid([0; 16]),
                None,
                "a.bin",
                false,
            )
            .await
            .expect_err("mixed content");
        assert!(matches!(
            err,
            DownloadError::SaveLocation(SaveLocationError::MismatchedSources { .. })
        ));

        let err = f
            .create_direct(
                vec![source(1, 1, 100)],
                QueryGuid([0; 16]),
                Some(root.join("missing")),
                "a.bin",
                false,
            )
            .await
            .expect_err("missing dir");
        assert!(matches!(
            err,
            DownloadError::SaveLocation(SaveLocationError::DirectoryMissing { .. })
        ));
        assert!(f.queue().is_empty());

        let dl = f
            .create_direct(
                vec![source(1, 1, 100), source(1, 2, 100)],
                QueryGuid([9; 16]),
                None,
                "a.bin",
                false,
            )
            .await
            .expect("create");
        assert_eq!(dl.download_type(), DownloadType::Direct);
        assert_eq!(dl.query_guid(), Some(QueryGuid([9; 16])));
        assert_eq!(dl.source_count(), 2);
        assert!(dl.incomplete_path().exists());

        f.queue().shutdown();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn existing_target_needs_overwrite() {
        let root = temp_dir("exists");
        let f = factory(&root).await;
        tokio::fs::write(root.join("complete/a.bin"), b"old")
            .await
            .expect("write");

        let err = f
            .create_direct(vec![source(1, 1, 10)], QueryGuid([0; 16]), None, "a.bin", false)
            .await
            .expect_err("exists");
        assert!(matches!(
            err,
            DownloadError::SaveLocation(SaveLocationError::FileAlreadyExists { .. })
        ));

        let dl = f
            .create_direct(vec![source(1, 1, 10)], QueryGuid([0; 16]), None, "a.bin", true)
            .await
            .expect("overwrite allowed");
        assert!(dl.overwrite());

        f.queue().shutdown();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn magnet_without_size_starts_sourceless() {
        let root = temp_dir("magnet");
        let f = factory(&root).await;
        let magnet = MagnetOptions::parse(
            "magnet:?xt=urn:ed2k:01010101010101010101010101010101&dn=thing.iso",
        )
        .expect("parse");
        let dl = f
            .create_magnet(magnet, None, None, None, false)
            .await
            .expect("create");
        assert_eq!(dl.file_name(), "thing.iso");
        assert_eq!(dl.size(), None);
        assert_eq!(dl.source_count(), 0);
        assert!(!dl.should_be_restarted());

        assert!(dl.add_source(source(1, 5, 4096)));
        assert_eq!(dl.size(), Some(4096));
        assert!(!dl.add_source(source(1, 6, 1)));

        f.queue().shutdown();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn in_network_download_is_time_gated() {
        let root = temp_dir("update");
        let f = factory(&root).await;
        let updates = root.join("updates");
        tokio::fs::create_dir_all(&updates).await.expect("mkdir");

        let update = UpdateDescriptor {
            content_id: ContentId([4; 16]),
            size: 50,
            file_name: "update.bin".to_string(),
            sources: vec![source(4, 1, 50)],
        };
        let later = SystemTime::now() + std::time::Duration::from_secs(3600);
        let dl = f
            .create_in_network(update, updates, later)
            .await
            .expect("create");
        assert_eq!(dl.download_type(), DownloadType::InNetwork);
        assert!(!dl.should_be_restarted());
        dl.handle_inactivity();
        assert!(!dl.should_be_restarted());

        f.queue().shutdown();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn resume_rejects_inconsistent_partials() {
        let root = temp_dir("resume");
        let f = factory(&root).await;
        let incomplete = root.join("incomplete");
        store::ensure_dir(&incomplete).await.expect("mkdir");

        let missing = incomplete.join("nothing.part");
        let err = f
            .create_resume(&missing, "x.bin", 10)
            .await
            .expect_err("missing");
        assert!(matches!(
            err,
            DownloadError::SaveLocation(SaveLocationError::PartialUnreadable { .. })
        ));

        let part = store::part_path_for(&incomplete, ContentId([5; 16]));
        tokio::fs::write(&part, vec![0u8; 2000]).await.expect("part");
        let met = store::PartMet {
            version: store::PART_MET_VERSION,
            content_id: ContentId([5; 16]),
            file_name: "x.bin".to_string(),
            file_size: Some(5000),
            save_dir: None,
            download_type: DownloadType::Direct,
            state: store::PartState::Paused,
            acquired: RangeSet::from_ranges([ByteRange::new(0, 2000)]),
            retry_count: 0,
            last_error: None,
            created_unix_secs: 1,
            updated_unix_secs: 1,
        };
        store::save_part_met(&store::met_path_for(&part), &met)
            .await
            .expect("met");

        let err = f
            .create_resume(&part, "x.bin", 4000)
            .await
            .expect_err("size mismatch");
        assert!(matches!(
            err,
            DownloadError::SaveLocation(SaveLocationError::PartialInconsistent { .. })
        ));

        let dl = f.create_resume(&part, "", 5000).await.expect("resume");
        assert_eq!(dl.file_name(), "x.bin");
        assert_eq!(dl.progress(), 40);
        assert_eq!(dl.bytes_acquired(), 2000);

        f.queue().shutdown();
        let _ = std::fs::remove_dir_all(root);
    }
}
