pub mod registry;
pub mod session;

pub use registry::UploadRegistry;
pub use session::{PeerUploadSession, UploadStatus};

use crate::download::types::ContentId;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Result<T> = std::result::Result<T, UploadError>;

/// The file being served to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub content_id: ContentId,
    pub size: u64,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadId(pub u64);

impl UploadId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "up-{}", self.0)
    }
}

#[derive(Debug)]
pub enum UploadError {
    NotUploading { id: UploadId, status: UploadStatus },
    Overrun { id: UploadId, size: u64, attempted: u64 },
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotUploading { id, status } => {
                write!(f, "upload {id} is {status:?}; no more bytes can be sent")
            }
            Self::Overrun {
                id,
                size,
                attempted,
            } => write!(
                f,
                "upload {id} would reach {attempted} bytes of a {size} byte file"
            ),
        }
    }
}

impl std::error::Error for UploadError {}
