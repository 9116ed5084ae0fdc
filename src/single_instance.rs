use anyhow::Context as _;
use fs2::FileExt as _;
use std::{fs::OpenOptions, path::Path};

/// Exclusive claim on a data directory, so two processes never write the same partial files.
/// Released when dropped or when the process dies.
#[derive(Debug)]
pub struct SingleInstanceLock {
    _file: std::fs::File,
    path: std::path::PathBuf,
}

impl SingleInstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(anyhow::anyhow!(
                "transfer data directory is in use by another process (lock held at {})",
                path.display()
            )),
            Err(e) => Err(anyhow::anyhow!(e))
                .with_context(|| format!("failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_first_is_dropped() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("transfer-core-lock-{nanos}"));
        let path = dir.join("transfers.lock");

        let first = SingleInstanceLock::acquire(&path).expect("first");
        assert_eq!(first.path(), path.as_path());
        assert!(SingleInstanceLock::acquire(&path).is_err());
        drop(first);
        SingleInstanceLock::acquire(&path).expect("after release");

        let _ = std::fs::remove_dir_all(dir);
    }
}
