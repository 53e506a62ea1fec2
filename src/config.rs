//! 下载设置：默认保存目录、并发上限、外部程序路径

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::common::models::VideoQuality;

pub const DOWNLOAD_DIR_ENV: &str = "MEDIADL_DOWNLOAD_DIR";
pub const YTDLP_PATH_ENV: &str = "YTDLP_PATH";
pub const ARIA2C_PATH_ENV: &str = "ARIA2C_PATH";

const MAX_CONCURRENT_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("配置文件格式错误: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("无效的配置: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    // 空字符串表示未设置
    pub download_path: String,
    pub max_concurrent_downloads: Option<usize>,
    pub default_quality: Option<VideoQuality>,
    pub yt_dlp_path: PathBuf,
    pub aria2c_path: PathBuf,
    pub begin_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: String::new(),
            max_concurrent_downloads: None,
            default_quality: None,
            yt_dlp_path: PathBuf::from("yt-dlp"),
            aria2c_path: PathBuf::from("aria2c"),
            begin_timeout_secs: 15,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(max) = self.max_concurrent_downloads {
            if !(1..=MAX_CONCURRENT_LIMIT).contains(&max) {
                return Err(ConfigError::Invalid(format!(
                    "maxConcurrentDownloads 必须在 1..={} 之间，当前为 {}",
                    MAX_CONCURRENT_LIMIT, max
                )));
            }
        }
        if self.begin_timeout_secs == 0 {
            return Err(ConfigError::Invalid("beginTimeoutSecs 必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 环境变量中的可执行文件路径优先于配置文件
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(path) = env_path(YTDLP_PATH_ENV) {
            debug!("使用环境变量 {} 指定的 yt-dlp: {:?}", YTDLP_PATH_ENV, path);
            self.yt_dlp_path = path;
        }
        if let Some(path) = env_path(ARIA2C_PATH_ENV) {
            debug!("使用环境变量 {} 指定的 aria2c: {:?}", ARIA2C_PATH_ENV, path);
            self.aria2c_path = path;
        }
        self
    }

    pub fn begin_timeout(&self) -> Duration {
        Duration::from_secs(self.begin_timeout_secs)
    }

    /// 默认保存目录：downloadPath -> MEDIADL_DOWNLOAD_DIR -> 系统下载目录 -> ./downloads
    pub fn resolve_download_dir(&self) -> PathBuf {
        let configured = self.download_path.trim();
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }
        env_path(DOWNLOAD_DIR_ENV)
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("./downloads"))
    }
}

/// 默认配置文件位置：<系统配置目录>/mediadl/settings.json
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("mediadl").join("settings.json"))
        .unwrap_or_else(|| PathBuf::from("settings.json"))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// 设置来源。调度器在没有目录覆盖时，每次 `start` 读取一次默认目录。
pub trait SettingsStore: Send + Sync {
    fn settings(&self) -> Settings;

    fn default_destination_directory(&self) -> PathBuf {
        self.settings().resolve_download_dir()
    }
}

/// 固定不变的设置，用于命令行单次下载和测试
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub Settings);

impl SettingsStore for StaticSettings {
    fn settings(&self) -> Settings {
        self.0.clone()
    }
}

/// JSON 文件中的设置，可以在运行时重新加载
pub struct JsonSettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl JsonSettingsStore {
    /// 文件不存在时使用默认设置
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let settings = read_settings(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 重新读取文件；失败时保留原来的设置
    pub fn reload(&self) -> Result<Settings, ConfigError> {
        let settings = read_settings(&self.path)?;
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = settings.clone();
        info!("已重新加载配置: {}", self.path.display());
        Ok(settings)
    }
}

impl SettingsStore for JsonSettingsStore {
    fn settings(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn read_settings(path: &Path) -> Result<Settings, ConfigError> {
    let settings = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str::<Settings>(&content)?
    } else {
        debug!("配置文件不存在，使用默认配置: {}", path.display());
        Settings::default()
    };
    let settings = settings.with_env_overrides();
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::load(dir.path().join("settings.json")).unwrap();
        let settings = store.settings();
        assert_eq!(settings.download_path, "");
        assert_eq!(settings.max_concurrent_downloads, None);
        assert_eq!(settings.begin_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_load_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"downloadPath": "/data/media", "maxConcurrentDownloads": 3, "defaultQuality": "1080p"}"#,
        )
        .unwrap();

        let store = JsonSettingsStore::load(&path).unwrap();
        assert_eq!(
            store.default_destination_directory(),
            PathBuf::from("/data/media")
        );
        assert_eq!(store.settings().max_concurrent_downloads, Some(3));
        assert_eq!(store.settings().default_quality, Some(VideoQuality::Q1080P));

        std::fs::write(&path, r#"{"downloadPath": "/data/other"}"#).unwrap();
        store.reload().unwrap();
        assert_eq!(
            store.default_destination_directory(),
            PathBuf::from("/data/other")
        );
        assert_eq!(store.settings().max_concurrent_downloads, None);
    }

    #[test]
    fn test_invalid_concurrency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        for bad in ["0", "11"] {
            std::fs::write(&path, format!(r#"{{"maxConcurrentDownloads": {}}}"#, bad)).unwrap();
            assert!(matches!(
                JsonSettingsStore::load(&path),
                Err(ConfigError::Invalid(_))
            ));
        }
    }

    #[test]
    fn test_failed_reload_keeps_previous_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"downloadPath": "/data/media"}"#).unwrap();
        let store = JsonSettingsStore::load(&path).unwrap();

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(store.reload(), Err(ConfigError::Parse(_))));
        assert_eq!(store.settings().download_path, "/data/media");
    }

    #[test]
    fn test_blank_download_path_is_unset() {
        let settings = Settings {
            download_path: "   ".to_string(),
            ..Settings::default()
        };
        assert_ne!(settings.resolve_download_dir(), PathBuf::from("   "));
    }
}
