use crate::download::DownloaderConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_save_dir() -> String {
    "complete".to_string()
}
fn default_incomplete_dir() -> String {
    "incomplete".to_string()
}
fn default_max_active() -> usize {
    3
}
fn default_scheduler_tick_secs() -> u64 {
    1
}
fn default_block_size() -> u64 {
    // eMule's request block size.
    184_320
}
fn default_max_busy_sources() -> usize {
    4
}
fn default_source_timeout_secs() -> u64 {
    60
}
fn default_source_ttl_secs() -> u64 {
    // 0 = sources never expire.
    3600
}
fn default_in_network_max_attempts() -> u32 {
    5
}
fn default_verify_on_complete() -> bool {
    true
}
fn default_stall_after_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Relative paths resolve against `general.data_dir`.
    pub save_dir: String,
    pub incomplete_dir: String,
    /// Downloads allowed to run at once.
    pub max_active: usize,
    pub scheduler_tick_secs: u64,
    pub block_size: u64,
    pub max_busy_sources: usize,
    pub source_timeout_secs: u64,
    pub source_ttl_secs: u64,
    pub in_network_max_attempts: u32,
    /// Hash finished files against their content id before moving them into place.
    pub verify_on_complete: bool,
    pub stall_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Speed reads as 0 once the last sample is older than this.
    pub stall_after_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            incomplete_dir: default_incomplete_dir(),
            max_active: default_max_active(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            block_size: default_block_size(),
            max_busy_sources: default_max_busy_sources(),
            source_timeout_secs: default_source_timeout_secs(),
            source_ttl_secs: default_source_ttl_secs(),
            in_network_max_attempts: default_in_network_max_attempts(),
            verify_on_complete: default_verify_on_complete(),
            stall_after_secs: default_stall_after_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            stall_after_secs: default_stall_after_secs(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        let d = &self.download;
        if d.max_active == 0 {
            return Err("download.max_active must be at least 1".to_string());
        }
        if d.block_size == 0 {
            return Err("download.block_size must be at least 1".to_string());
        }
        if d.max_busy_sources == 0 {
            return Err("download.max_busy_sources must be at least 1".to_string());
        }
        if d.scheduler_tick_secs == 0 {
            return Err("download.scheduler_tick_secs must be at least 1".to_string());
        }
        if d.source_timeout_secs == 0 {
            return Err("download.source_timeout_secs must be at least 1".to_string());
        }
        if d.in_network_max_attempts == 0 {
            return Err("download.in_network_max_attempts must be at least 1".to_string());
        }
        if self.general.data_dir.trim().is_empty() {
            return Err("general.data_dir must not be empty".to_string());
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.data_dir)
    }

    pub fn save_dir(&self) -> PathBuf {
        self.data_dir().join(&self.download.save_dir)
    }

    pub fn incomplete_dir(&self) -> PathBuf {
        self.data_dir().join(&self.download.incomplete_dir)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir().join("transfers.lock")
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.download.scheduler_tick_secs.max(1))
    }

    pub fn upload_stall_after(&self) -> Duration {
        Duration::from_secs(self.upload.stall_after_secs)
    }

    pub fn downloader_config(&self) -> DownloaderConfig {
        let d = &self.download;
        DownloaderConfig {
            incomplete_dir: self.incomplete_dir(),
            block_size: d.block_size.max(1),
            max_busy_sources: d.max_busy_sources.max(1),
            source_timeout: Duration::from_secs(d.source_timeout_secs.max(1)),
            source_ttl: (d.source_ttl_secs > 0).then(|| Duration::from_secs(d.source_ttl_secs)),
            verify_on_complete: d.verify_on_complete,
            in_network_max_attempts: d.in_network_max_attempts.max(1),
            speed_stall_after: Duration::from_secs(d.stall_after_secs),
        }
    }
}

pub fn init_tracing(config: &Config) {
    // RUST_LOG wins over the configured level, e.g. RUST_LOG=info,transfer_core=debug
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| Some(config.general.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_resolve_under_data_dir() {
        let cfg = Config::default();
        cfg.validate().expect("valid");
        assert_eq!(cfg.save_dir(), PathBuf::from("data/complete"));
        assert_eq!(cfg.incomplete_dir(), PathBuf::from("data/incomplete"));
        let dl = cfg.downloader_config();
        assert_eq!(dl.source_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(dl.block_size, 184_320);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [download]
            max_active = 7
            source_ttl_secs = 0
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.download.max_active, 7);
        assert_eq!(cfg.download.block_size, 184_320);
        assert_eq!(cfg.downloader_config().source_ttl, None);
        assert_eq!(cfg.general.data_dir, "data");
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut cfg = Config::default();
        cfg.download.max_active = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.download.block_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.download.in_network_max_attempts = 0;
        let err = cfg.validate().expect_err("zero attempts");
        assert!(err.contains("in_network_max_attempts"));
    }

    #[test]
    fn absolute_save_dir_is_kept() {
        let mut cfg = Config::default();
        cfg.download.save_dir = "/srv/files".to_string();
        assert_eq!(cfg.save_dir(), PathBuf::from("/srv/files"));
    }
}
