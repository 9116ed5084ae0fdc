pub mod downloader;
pub mod errors;
pub mod factory;
pub mod hash;
pub mod magnet;
pub mod queue;
pub mod ranges;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod types;
mod worker;

pub use downloader::{
    CoreDownloader, DownloadKind, DownloadState, DownloaderConfig, FailureReason,
    UpdateDescriptor,
};
pub use errors::{DownloadError, DownloadStoreError, SaveLocationError};
pub use factory::DownloaderFactory;
pub use magnet::{MagnetError, MagnetOptions};
pub use queue::{ConflictIndex, DownloadQueue, DownloadSummary, PassReport};
pub use ranges::{ByteRange, RangeSet};
pub use scheduler::{SchedulerCommand, SchedulerHandle, SchedulerStatus, start_scheduler};
pub use source::{RemoteSource, SourceError, SourceFetcher, SourceKey, SourcePool};
pub use store::{LoadedMetSource, PART_MET_VERSION, PartMet, PartState, RecoveredDownload};
pub use types::{ContentId, DownloadType, DownloaderId, QueryGuid};
