use std::path::PathBuf;

/// Save-location failures: raised by the factory before a downloader exists, and recorded as a
/// terminal failure when final placement of a finished file is refused.
#[derive(Debug)]
pub enum SaveLocationError {
    DirectoryMissing {
        path: PathBuf,
    },
    NotADirectory {
        path: PathBuf,
    },
    DirectoryNotWritable {
        path: PathBuf,
        source: std::io::Error,
    },
    InvalidFileName {
        name: String,
    },
    FileAlreadyExists {
        path: PathBuf,
    },
    AlreadyDownloading {
        urn: String,
        size: Option<u64>,
    },
    SavePathInUse {
        path: PathBuf,
    },
    IncompleteFileInUse {
        path: PathBuf,
    },
    NoSources,
    MismatchedSources {
        expected_urn: String,
        found_urn: String,
    },
    PartialUnreadable {
        path: PathBuf,
        reason: String,
    },
    PartialInconsistent {
        path: PathBuf,
        reason: String,
    },
    Placement {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SaveLocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectoryMissing { path } => {
                write!(f, "save directory '{}' does not exist", path.display())
            }
            Self::NotADirectory { path } => {
                write!(f, "save location '{}' is not a directory", path.display())
            }
            Self::DirectoryNotWritable { path, source } => {
                write!(
                    f,
                    "save directory '{}' is not writable: {source}",
                    path.display()
                )
            }
            Self::InvalidFileName { name } => write!(f, "illegal file name '{name}'"),
            Self::FileAlreadyExists { path } => {
                write!(f, "file '{}' already exists", path.display())
            }
            Self::AlreadyDownloading { urn, size } => match size {
                Some(size) => write!(f, "{urn} ({size} bytes) is already being downloaded"),
                None => write!(f, "{urn} is already being downloaded"),
            },
            Self::SavePathInUse { path } => write!(
                f,
                "another download is already saving to '{}'",
                path.display()
            ),
            Self::IncompleteFileInUse { path } => write!(
                f,
                "incomplete file '{}' belongs to another download",
                path.display()
            ),
            Self::NoSources => write!(f, "no remote sources given"),
            Self::MismatchedSources {
                expected_urn,
                found_urn,
            } => write!(
                f,
                "remote sources disagree on content: expected {expected_urn}, found {found_urn}"
            ),
            Self::PartialUnreadable { path, reason } => {
                write!(
                    f,
                    "partial file '{}' is unreadable: {reason}",
                    path.display()
                )
            }
            Self::PartialInconsistent { path, reason } => {
                write!(
                    f,
                    "partial file '{}' is inconsistent: {reason}",
                    path.display()
                )
            }
            Self::Placement { from, to, source } => write!(
                f,
                "failed to move '{}' to '{}': {source}",
                from.display(),
                to.display()
            ),
        }
    }
}

impl std::error::Error for SaveLocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DirectoryNotWritable { source, .. } => Some(source),
            Self::Placement { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum DownloadStoreError {
    EnsureDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    RemoveFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    ParseMet {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for DownloadStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureDir { path, source } => {
                write!(
                    f,
                    "failed to ensure directory '{}': {source}",
                    path.display()
                )
            }
            Self::ReadDir { path, source } => {
                write!(f, "failed to list '{}': {source}", path.display())
            }
            Self::ReadFile { path, source } => {
                write!(f, "failed to read '{}': {source}", path.display())
            }
            Self::WriteFile { path, source } => {
                write!(f, "failed to write '{}': {source}", path.display())
            }
            Self::RemoveFile { path, source } => {
                write!(f, "failed to remove '{}': {source}", path.display())
            }
            Self::Copy { from, to, source } => write!(
                f,
                "failed to copy '{}' to '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::Rename { from, to, source } => write!(
                f,
                "failed to rename '{}' to '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::Serialize { source } => write!(f, "failed to serialize part metadata: {source}"),
            Self::ParseMet { path, source } => {
                write!(
                    f,
                    "invalid part metadata in '{}': {source}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for DownloadStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EnsureDir { source, .. }
            | Self::ReadDir { source, .. }
            | Self::ReadFile { source, .. }
            | Self::WriteFile { source, .. }
            | Self::RemoveFile { source, .. }
            | Self::Copy { source, .. }
            | Self::Rename { source, .. } => Some(source),
            Self::Serialize { source } | Self::ParseMet { source, .. } => Some(source),
        }
    }
}

#[derive(Debug)]
pub enum DownloadError {
    SaveLocation(SaveLocationError),
    Store(DownloadStoreError),
    Disk {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Contract misuse such as initializing twice or starting before initialization.
    InvalidState(String),
    ChannelClosed,
    SchedulerJoin(tokio::task::JoinError),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SaveLocation(source) => write!(f, "{source}"),
            Self::Store(source) => write!(f, "{source}"),
            Self::Disk { path, source } => {
                write!(f, "disk error on '{}': {source}", path.display())
            }
            Self::InvalidState(msg) => write!(f, "{msg}"),
            Self::ChannelClosed => write!(f, "download scheduler channel closed"),
            Self::SchedulerJoin(source) => write!(f, "download scheduler join error: {source}"),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SaveLocation(source) => Some(source),
            Self::Store(source) => Some(source),
            Self::Disk { source, .. } => Some(source),
            Self::SchedulerJoin(source) => Some(source),
            Self::InvalidState(_) | Self::ChannelClosed => None,
        }
    }
}

impl From<SaveLocationError> for DownloadError {
    fn from(value: SaveLocationError) -> Self {
        Self::SaveLocation(value)
    }
}

impl From<DownloadStoreError> for DownloadError {
    fn from(value: DownloadStoreError) -> Self {
        Self::Store(value)
    }
}

impl From<tokio::task::JoinError> for DownloadError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::SchedulerJoin(value)
    }
}

impl DownloadError {
    pub fn is_save_location(&self) -> bool {
        matches!(self, Self::SaveLocation(_))
    }
}
