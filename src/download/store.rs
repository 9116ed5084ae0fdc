use crate::download::{
    errors::DownloadStoreError,
    ranges::RangeSet,
    types::{ContentId, DownloadType},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, DownloadStoreError>;

// Same marker byte eMule writes at the head of part.met; our body is JSON.
pub const PART_MET_VERSION: u8 = 0xE0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartState {
    Queued,
    Downloading,
    Paused,
    Cancelled,
    Error,
}

/// Sidecar describing a partial file well enough to resume it without origin data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMet {
    pub version: u8,
    pub content_id: ContentId,
    pub file_name: String,
    pub file_size: Option<u64>,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    pub download_type: DownloadType,
    pub state: PartState,
    #[serde(default)]
    pub acquired: RangeSet,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_unix_secs: u64,
    pub updated_unix_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedMetSource {
    Primary,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredDownload {
    pub met_path: PathBuf,
    pub part_path: PathBuf,
    pub met: PartMet,
    pub source: LoadedMetSource,
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `<incomplete_dir>/<content hex>.part`
pub fn part_path_for(incomplete_dir: &Path, content_id: ContentId) -> PathBuf {
    incomplete_dir.join(format!("{}.part", content_id.to_hex_lower()))
}

/// `<partial>.met` next to any partial file.
pub fn met_path_for(part_path: &Path) -> PathBuf {
    append_ext(part_path, ".met")
}

pub async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| DownloadStoreError::EnsureDir {
            path: path.to_path_buf(),
            source,
        })
}

pub async fn save_part_met(path: &Path, met: &PartMet) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(met)
        .map_err(|source| DownloadStoreError::Serialize { source })?;

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let bak = backup_path(path);
        tokio::fs::copy(path, &bak)
            .await
            .map_err(|source| DownloadStoreError::Copy {
                from: path.to_path_buf(),
                to: bak,
                source,
            })?;
    }

    let tmp = append_ext(path, ".tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|source| DownloadStoreError::WriteFile {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| DownloadStoreError::Rename {
            from: tmp,
            to: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

pub async fn load_part_met_with_fallback(path: &Path) -> Result<(PartMet, LoadedMetSource)> {
    let primary_err = match load_part_met(path).await {
        Ok(met) => return Ok((met, LoadedMetSource::Primary)),
        Err(err) => err,
    };
    let bak = backup_path(path);
    if !tokio::fs::try_exists(&bak).await.unwrap_or(false) {
        return Err(primary_err);
    }
    match load_part_met(&bak).await {
        Ok(met) => {
            tracing::warn!(
                path = %path.display(),
                error = %primary_err,
                "primary part metadata unusable; recovered from backup"
            );
            Ok((met, LoadedMetSource::Backup))
        }
        Err(_) => Err(primary_err),
    }
}

/// Drop the sidecar and its backup. Missing files are fine.
pub async fn remove_part_met(part_path: &Path) -> Result<()> {
    let met = met_path_for(part_path);
    for path in [backup_path(&met), met] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(DownloadStoreError::RemoveFile { path, source }),
        }
    }
    Ok(())
}

/// List every partial in `dir` that has a loadable sidecar, sorted by file name.
pub async fn scan_recoverable_downloads(dir: &Path) -> Result<Vec<RecoveredDownload>> {
    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(dir)
        .await
        .map_err(|source| DownloadStoreError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

    while let Some(entry) = rd
        .next_entry()
        .await
        .map_err(|source| DownloadStoreError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?
    {
        let path = entry.path();
        let Some(part_path) = part_path_from_met_path(&path) else {
            continue;
        };

        match load_part_met_with_fallback(&path).await {
            Ok((met, source)) => out.push(RecoveredDownload {
                part_path,
                met_path: path,
                met,
                source,
            }),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unrecoverable part metadata");
            }
        }
    }
    out.sort_by(|a, b| a.part_path.cmp(&b.part_path));
    Ok(out)
}

fn part_path_from_met_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".met")?;
    if !stem.ends_with(".part") {
        return None;
    }
    let mut p = path.to_path_buf();
    p.set_file_name(stem);
    Some(p)
}

fn backup_path(path: &Path) -> PathBuf {
    append_ext(path, ".bak")
}

fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(ext);
    PathBuf::from(s)
}

async fn load_part_met(path: &Path) -> Result<PartMet> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| DownloadStoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|source| DownloadStoreError::ParseMet {
        path: path.to_path_buf(),
        source,
    })
}
