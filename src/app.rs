use crate::{
    config::Config,
    download::{
        DownloadQueue, DownloaderFactory, PartState, SchedulerHandle, SchedulerStatus,
        SourceFetcher, errors::DownloadError, start_scheduler, store,
    },
    single_instance::SingleInstanceLock,
    upload::UploadRegistry,
};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Everything a client needs to run transfers: the download queue and its scheduler, the
/// factory that feeds it, and the upload registry.
pub struct TransferCore {
    config: Config,
    uploads: Arc<UploadRegistry>,
    factory: DownloaderFactory,
    scheduler: SchedulerHandle,
    status: watch::Receiver<SchedulerStatus>,
    join: JoinHandle<Result<(), DownloadError>>,
    recovered: usize,
    _lock: SingleInstanceLock,
}

impl TransferCore {
    /// Lock the data directory, prepare folders, resume partials found on disk and start the
    /// scheduler.
    pub async fn start(config: Config, fetcher: Arc<dyn SourceFetcher>) -> anyhow::Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;
        tracing::info!(
            data_dir = %config.general.data_dir,
            save_dir = %config.save_dir().display(),
            max_active = config.download.max_active,
            "starting transfer core"
        );

        let lock = SingleInstanceLock::acquire(config.lock_path())?;
        for dir in [config.save_dir(), config.incomplete_dir()] {
            store::ensure_dir(&dir)
                .await
                .with_context(|| format!("failed to prepare {}", dir.display()))?;
        }

        let uploads = Arc::new(UploadRegistry::with_stall_after(config.upload_stall_after()));
        let queue = Arc::new(DownloadQueue::new(config.download.max_active));
        let factory = DownloaderFactory::new(
            queue.clone(),
            fetcher,
            config.downloader_config(),
            config.save_dir(),
        );

        let recovered = recover_partials(&factory, &config).await?;
        let (scheduler, status, join) = start_scheduler(queue, config.scheduler_tick());

        Ok(Self {
            config,
            uploads,
            factory,
            scheduler,
            status,
            join,
            recovered,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn factory(&self) -> &DownloaderFactory {
        &self.factory
    }

    pub fn queue(&self) -> &Arc<DownloadQueue> {
        self.factory.queue()
    }

    pub fn uploads(&self) -> &Arc<UploadRegistry> {
        &self.uploads
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    /// Partials resumed from disk at startup.
    pub fn recovered_count(&self) -> usize {
        self.recovered
    }

    /// Stop scheduling, then release every downloader. Partial files stay on disk.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.scheduler.shutdown().await?;
        self.join
            .await
            .context("download scheduler task panicked")??;
        self.factory.queue().shutdown();
        tracing::info!("transfer core stopped");
        Ok(())
    }
}

async fn recover_partials(factory: &DownloaderFactory, config: &Config) -> anyhow::Result<usize> {
    let recovered = store::scan_recoverable_downloads(&config.incomplete_dir())
        .await
        .context("failed to scan incomplete directory")?;

    let mut resumed = 0usize;
    for entry in recovered {
        match entry.met.state {
            PartState::Cancelled => {
                tracing::debug!(path = %entry.part_path.display(), "skipping cancelled partial");
                continue;
            }
            PartState::Error => {
                tracing::debug!(path = %entry.part_path.display(), "skipping failed partial");
                continue;
            }
            PartState::Queued | PartState::Downloading | PartState::Paused => {}
        }
        let Some(size) = entry.met.file_size else {
            tracing::debug!(
                path = %entry.part_path.display(),
                "skipping partial with unknown size"
            );
            continue;
        };
        match factory
            .create_resume(&entry.part_path, &entry.met.file_name, size)
            .await
        {
            Ok(dl) => {
                resumed += 1;
                if entry.met.state == PartState::Paused {
                    dl.pause();
                }
                tracing::info!(
                    id = %dl.id(),
                    file = %dl.file_name(),
                    bytes = dl.bytes_acquired(),
                    "resumed partial download"
                );
            }
            Err(err) => {
                tracing::warn!(
                    path = %entry.part_path.display(),
                    error = %err,
                    "could not resume partial download"
                );
            }
        }
    }
    Ok(resumed)
}
