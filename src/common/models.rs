use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::downloader::error::DownloadError;

// -----------------------------------------------------------------------------------------------

/// 传输类型，每种类型对应一个传输适配器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Swarm,      // 磁力链接 / 种子
    Extraction, // 单 URL 媒体提取
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Swarm => "swarm",
            Self::Extraction => "extraction",
        }
    }

    /// 根据源猜测类型，仅供命令行使用；控制接口要求显式给出 kind
    pub fn detect(source: &str) -> Self {
        let source = source.trim();
        if source.starts_with("magnet:") || source.to_ascii_lowercase().ends_with(".torrent") {
            Self::Swarm
        } else {
            Self::Extraction
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "swarm" | "torrent" | "magnet" => Ok(Self::Swarm),
            "extraction" | "youtube" => Ok(Self::Extraction),
            other => Err(DownloadError::InvalidRequest(format!(
                "不支持的下载类型: {}",
                other
            ))),
        }
    }
}

// -----------------------------------------------------------------------------------------------

// 视频清晰度选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VideoQuality {
    #[serde(rename = "360p")]
    Q360P,
    #[serde(rename = "480p")]
    Q480P,
    #[default]
    #[serde(rename = "720p")]
    Q720P,
    #[serde(rename = "1080p")]
    Q1080P,
    #[serde(rename = "1440p")]
    Q1440P,
    #[serde(rename = "4k", alias = "2160p")]
    Q4K,
}

impl VideoQuality {
    /// (宽, 高) 上限
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Q360P => (640, 360),
            Self::Q480P => (854, 480),
            Self::Q720P => (1280, 720),
            Self::Q1080P => (1920, 1080),
            Self::Q1440P => (2560, 1440),
            Self::Q4K => (3840, 2160),
        }
    }
}

impl FromStr for VideoQuality {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_ascii_lowercase()))
            .map_err(|_| DownloadError::InvalidRequest(format!("无效的清晰度: {}", s)))
    }
}

/// 清晰度提示：预设档位，或显式的宽高上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QualityHint {
    Preset(VideoQuality),
    Dimensions { width: u32, height: u32 },
}

impl QualityHint {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Preset(quality) => quality.dimensions(),
            Self::Dimensions { width, height } => (*width, *height),
        }
    }
}

impl From<VideoQuality> for QualityHint {
    fn from(quality: VideoQuality) -> Self {
        Self::Preset(quality)
    }
}

// -----------------------------------------------------------------------------------------------

/// 调用方提交的下载请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    // 调用方指定的任务ID（原 contentId），为空时自动生成
    #[serde(default, alias = "contentId")]
    pub id: Option<String>,
    pub kind: TaskKind,
    // 磁力链接 / 种子路径 / 媒体页面 URL
    #[serde(default, alias = "magnet", alias = "url")]
    pub source_descriptor: Option<String>,
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub destination_directory_override: Option<PathBuf>,
    #[serde(default, alias = "quality")]
    pub quality_hint: Option<QualityHint>,
    #[serde(default)]
    pub audio_only: bool,
}

impl DownloadRequest {
    pub fn new(kind: TaskKind, source: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            source_descriptor: Some(source.into()),
            display_name: None,
            destination_directory_override: None,
            quality_hint: None,
            audio_only: false,
        }
    }

    pub fn swarm(source: impl Into<String>) -> Self {
        Self::new(TaskKind::Swarm, source)
    }

    pub fn extraction(source: impl Into<String>) -> Self {
        Self::new(TaskKind::Extraction, source)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_destination(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination_directory_override = Some(dir.into());
        self
    }

    pub fn with_quality(mut self, quality: impl Into<QualityHint>) -> Self {
        self.quality_hint = Some(quality.into());
        self
    }

    pub fn audio_only(mut self, audio_only: bool) -> Self {
        self.audio_only = audio_only;
        self
    }

    /// 去掉首尾空白后的源；空字符串视为缺失
    pub fn source(&self) -> Option<&str> {
        self.source_descriptor
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
