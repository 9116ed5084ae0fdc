use crate::download::{
    downloader::{DownloadState, FailureReason, Shared},
    errors::SaveLocationError,
    hash,
    ranges::{ByteRange, next_free_block},
    source::{RemoteSource, SourceError, SourceFetcher},
    store,
};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval_at};

/// How often the swarm writes acquired ranges to the sidecar while blocks keep arriving.
pub(crate) const SIDECAR_SAVE_INTERVAL: Duration = Duration::from_secs(5);

enum SwarmOutcome {
    Complete,
    OutOfSources,
    Fatal(FailureReason),
    Superseded,
}

enum SourceRun {
    /// Nothing left to reserve; the source was handed back.
    Idle,
    Dropped,
    Fatal(FailureReason),
    Superseded,
}

/// Background body of one download activation. `generation` ties every state change to the
/// activation that spawned it.
pub(crate) async fn run(shared: Arc<Shared>, fetcher: Arc<dyn SourceFetcher>, generation: u64) {
    if let Some(delay) = shared.gate_remaining(SystemTime::now()) {
        tracing::debug!(id = %shared.id, delay_secs = delay.as_secs(), "waiting for start time");
        tokio::time::sleep(delay).await;
        let mut inner = shared.lock();
        if inner.generation != generation {
            return;
        }
        inner.state = DownloadState::Downloading;
    }

    let outcome = match swarm(&shared, &fetcher, generation).await {
        SwarmOutcome::Complete => finalize(&shared, generation).await,
        other => other,
    };
    conclude(&shared, generation, outcome).await;
}

async fn swarm(
    shared: &Arc<Shared>,
    fetcher: &Arc<dyn SourceFetcher>,
    generation: u64,
) -> SwarmOutcome {
    let file = match tokio::fs::OpenOptions::new()
        .write(true)
        .open(&shared.incomplete_path)
        .await
    {
        Ok(f) => Arc::new(AsyncMutex::new(f)),
        Err(err) => {
            return SwarmOutcome::Fatal(FailureReason::Disk(format!(
                "open '{}': {err}",
                shared.incomplete_path.display()
            )));
        }
    };

    let mut tasks: JoinSet<SourceRun> = JoinSet::new();
    let mut save_tick = interval_at(
        tokio::time::Instant::now() + SIDECAR_SAVE_INTERVAL,
        SIDECAR_SAVE_INTERVAL,
    );
    save_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        let batch = {
            let mut inner = shared.lock();
            if inner.generation != generation {
                tasks.abort_all();
                return SwarmOutcome::Superseded;
            }
            if inner.is_complete() {
                break;
            }
            match inner.size {
                Some(size) => {
                    let room = shared
                        .cfg
                        .max_busy_sources
                        .saturating_sub(inner.pool.busy_count());
                    let has_free = next_free_block(
                        &inner.acquired,
                        &inner.reserved,
                        size,
                        shared.cfg.block_size,
                    )
                    .is_some();
                    if has_free && room > 0 {
                        inner.pool.checkout_idle(room)
                    } else {
                        Vec::new()
                    }
                }
                None => Vec::new(),
            }
        };

        for source in batch {
            tasks.spawn(serve_source(
                shared.clone(),
                fetcher.clone(),
                file.clone(),
                source,
                generation,
            ));
        }

        if tasks.is_empty() {
            return SwarmOutcome::OutOfSources;
        }

        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(Ok(SourceRun::Fatal(reason))) => {
                    tasks.abort_all();
                    return SwarmOutcome::Fatal(reason);
                }
                Some(Ok(SourceRun::Superseded)) => {
                    tasks.abort_all();
                    return SwarmOutcome::Superseded;
                }
                Some(Ok(SourceRun::Idle | SourceRun::Dropped)) | None => {}
                Some(Err(err)) => {
                    if err.is_panic() {
                        tracing::warn!(id = %shared.id, error = %err, "source task panicked");
                    }
                }
            },
            _ = shared.sources_changed.notified() => {}
            _ = save_tick.tick() => shared.persist_if_dirty().await,
        }
    }

    // Nothing is reserved once complete, so the rest only have a sidecar write left.
    while tasks.join_next().await.is_some() {}
    let mut f = file.lock().await;
    if let Err(err) = f.sync_all().await {
        return SwarmOutcome::Fatal(FailureReason::Disk(format!(
            "sync '{}': {err}",
            shared.incomplete_path.display()
        )));
    }
    SwarmOutcome::Complete
}

async fn serve_source(
    shared: Arc<Shared>,
    fetcher: Arc<dyn SourceFetcher>,
    file: Arc<AsyncMutex<File>>,
    source: RemoteSource,
    generation: u64,
) -> SourceRun {
    let key = source.key();
    loop {
        let range = {
            let mut inner = shared.lock();
            if inner.generation != generation {
                return SourceRun::Superseded;
            }
            let Some(size) = inner.size else {
                inner.pool.release(key);
                return SourceRun::Idle;
            };
            match next_free_block(
                &inner.acquired,
                &inner.reserved,
                size,
                shared.cfg.block_size,
            ) {
                Some(r) => {
                    inner.reserved.insert(r);
                    r
                }
                None => {
                    inner.pool.release(key);
                    return SourceRun::Idle;
                }
            }
        };

        let fetched = match tokio::time::timeout(
            shared.cfg.source_timeout,
            fetcher.fetch(&source, range),
        )
        .await
        {
            Ok(Ok(data)) if data.len() as u64 == range.len() => Ok(data),
            Ok(Ok(data)) => Err(SourceError::InvalidData {
                addr: source.addr,
                reason: format!("expected {} bytes, got {}", range.len(), data.len()),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SourceError::Timeout { addr: source.addr }),
        };

        let data = match fetched {
            Ok(data) => data,
            Err(err) => {
                let mut inner = shared.lock();
                if inner.generation != generation {
                    return SourceRun::Superseded;
                }
                inner.reserved.remove(range);
                inner.pool.remove(key);
                tracing::debug!(
                    id = %shared.id,
                    source = %key,
                    error = %err,
                    remaining = inner.pool.len(),
                    "dropping failed source"
                );
                return SourceRun::Dropped;
            }
        };

        if let Err(err) = write_block(&file, range, &data).await {
            let mut inner = shared.lock();
            inner.reserved.remove(range);
            inner.pool.release(key);
            return SourceRun::Fatal(FailureReason::Disk(format!(
                "write {}..{} to '{}': {err}",
                range.start,
                range.end,
                shared.incomplete_path.display()
            )));
        }

        {
            let mut inner = shared.lock();
            if inner.generation != generation {
                return SourceRun::Superseded;
            }
            inner.reserved.remove(range);
            inner.acquired.insert(range);
            inner.pool.record_served(key, range.len());
            inner.dirty = true;
            let total = inner.acquired.covered();
            inner.sampler.update(total, Instant::now());
        }
    }
}

async fn write_block(
    file: &AsyncMutex<File>,
    range: ByteRange,
    data: &[u8],
) -> std::io::Result<()> {
    let mut f = file.lock().await;
    f.seek(SeekFrom::Start(range.start)).await?;
    f.write_all(data).await?;
    f.flush().await
}

/// Verify the assembled file and move it into the save directory.
async fn finalize(shared: &Arc<Shared>, generation: u64) -> SwarmOutcome {
    {
        let mut inner = shared.lock();
        if inner.generation != generation {
            return SwarmOutcome::Superseded;
        }
        inner.state = DownloadState::Verifying;
    }

    if shared.cfg.verify_on_complete {
        match hash::hash_file(&shared.incomplete_path).await {
            Ok(actual) if actual == shared.content_id => {}
            Ok(actual) => {
                return SwarmOutcome::Fatal(FailureReason::Corrupt {
                    expected: shared.content_id,
                    actual,
                });
            }
            Err(err) => {
                return SwarmOutcome::Fatal(FailureReason::Disk(format!(
                    "hash '{}': {err}",
                    shared.incomplete_path.display()
                )));
            }
        }
    }

    let overwrite = {
        let inner = shared.lock();
        if inner.generation != generation {
            return SwarmOutcome::Superseded;
        }
        inner.overwrite
    };

    let target = shared.save_path();
    if let Err(err) = place_file(&shared.incomplete_path, &target, overwrite).await {
        return SwarmOutcome::Fatal(FailureReason::SaveLocation(err.to_string()));
    }
    if let Err(err) = store::remove_part_met(&shared.incomplete_path).await {
        tracing::warn!(id = %shared.id, error = %err, "failed to remove part metadata");
    }
    tracing::info!(
        id = %shared.id,
        path = %target.display(),
        "download complete"
    );
    SwarmOutcome::Complete
}

pub(crate) async fn place_file(
    from: &Path,
    to: &Path,
    overwrite: bool,
) -> Result<(), SaveLocationError> {
    let placement = |source| SaveLocationError::Placement {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if tokio::fs::try_exists(to).await.map_err(placement)? {
        if !overwrite {
            return Err(SaveLocationError::FileAlreadyExists {
                path: to.to_path_buf(),
            });
        }
        tokio::fs::remove_file(to).await.map_err(placement)?;
    }

    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Cross-device moves fall back to copy + remove.
    tokio::fs::copy(from, to).await.map_err(placement)?;
    tokio::fs::remove_file(from).await.map_err(placement)?;
    Ok(())
}

async fn conclude(shared: &Arc<Shared>, generation: u64, outcome: SwarmOutcome) {
    let corrupt = {
        let mut inner = shared.lock();
        if inner.generation != generation {
            return;
        }
        inner.pool.release_all();
        inner.reserved = crate::download::ranges::RangeSet::new();
        inner.sampler.reset();
        match outcome {
            SwarmOutcome::Complete => {
                inner.state = DownloadState::Complete;
                return;
            }
            SwarmOutcome::Superseded => return,
            SwarmOutcome::OutOfSources => {
                inner.state = DownloadState::WaitingForSources;
                tracing::info!(
                    id = %shared.id,
                    bytes = inner.acquired.covered(),
                    "download ran out of sources"
                );
                None
            }
            SwarmOutcome::Fatal(reason) => {
                tracing::warn!(id = %shared.id, reason = %reason, "download failed");
                if matches!(reason, FailureReason::Corrupt { .. }) {
                    inner.discarded = true;
                    inner.acquired = crate::download::ranges::RangeSet::new();
                    Some(reason)
                } else {
                    inner.state = DownloadState::Failed;
                    inner.failure = Some(reason);
                    None
                }
            }
        }
    };
    let Some(reason) = corrupt else {
        shared.persist().await;
        return;
    };
    // The failure becomes visible only once the bad bytes are gone.
    shared.discard_partial().await;
    let mut inner = shared.lock();
    if inner.generation == generation {
        inner.state = DownloadState::Failed;
        inner.failure = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("transfer-core-worker-{tag}-{nanos}"));
        p
    }

    #[tokio::test]
    async fn place_file_refuses_existing_target_without_overwrite() {
        let root = temp_dir("place");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let from = root.join("a.part");
        let to = root.join("a.bin");
        tokio::fs::write(&from, b"new").await.expect("from");
        tokio::fs::write(&to, b"old").await.expect("to");

        let err = place_file(&from, &to, false).await.expect_err("must refuse");
        assert!(matches!(err, SaveLocationError::FileAlreadyExists { .. }));
        assert_eq!(tokio::fs::read(&to).await.expect("read"), b"old");

        place_file(&from, &to, true).await.expect("overwrite");
        assert_eq!(tokio::fs::read(&to).await.expect("read"), b"new");
        assert!(!from.exists());

        let _ = std::fs::remove_dir_all(root);
    }
}
