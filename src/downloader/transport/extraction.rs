use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::process::{self, OutputInterpreter, WorkerCommand};
use super::{
    EventSink, TransferHandle, TransferRequest, Transport, TransportCapabilities, TransportEvent,
};
use crate::common::models::{QualityHint, TaskKind};
use crate::downloader::error::{DownloadError, Result};
use crate::downloader::progress::{
    EtaSample, ProgressSample, RateSample, RawProgress, SpeedCalculator, parse_duration,
    parse_size,
};

const OUTPUT_TEMPLATE: &str = "%(title)s-%(id)s.%(ext)s";
const AUDIO_ONLY_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio";
const DEFAULT_FORMAT: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";

// 状态流里没有百分比时，按这个间隔检查文件大小
const SIZE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// 基于 yt-dlp 的单 URL 媒体下载。暂停 / 恢复通过挂起进程实现，属于尽力而为。
pub struct ExtractionTransport {
    executable: PathBuf,
    capabilities: TransportCapabilities,
}

impl ExtractionTransport {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            capabilities: TransportCapabilities::best_effort_pause_resume(),
        }
    }

    fn build_command(&self, request: &TransferRequest, selector: &str) -> WorkerCommand {
        let mut output = OsString::from(request.destination.as_os_str());
        output.push(std::path::MAIN_SEPARATOR_STR);
        output.push(OUTPUT_TEMPLATE);

        WorkerCommand::new(&self.executable)
            .arg("-f")
            .arg(selector)
            .arg("-o")
            .arg(output)
            .arg("--newline")
            .arg("--no-warnings")
            .arg("--no-check-certificates")
            .arg(&request.source)
            .current_dir(&request.destination)
    }
}

impl Default for ExtractionTransport {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

/// 选择器首选项里要下载的流数量，例如 "bestvideo+bestaudio/best" 为 2
pub fn expected_streams(selector: &str) -> usize {
    selector
        .split('/')
        .next()
        .map(|preferred| preferred.split('+').count())
        .unwrap_or(1)
}

/// yt-dlp 的 `-f` 参数
pub fn format_selector(quality: Option<QualityHint>, audio_only: bool) -> String {
    if audio_only {
        return AUDIO_ONLY_FORMAT.to_string();
    }
    match quality {
        Some(hint) => {
            let (w, h) = hint.dimensions();
            format!(
                "bestvideo[width<={w}][height<={h}][ext=mp4]+bestaudio[ext=m4a]/best[width<={w}][height<={h}][ext=mp4]/best"
            )
        }
        None => DEFAULT_FORMAT.to_string(),
    }
}

/// 只接受 http / https 页面地址
pub fn validate_source(source: &str) -> Result<Url> {
    let url = Url::parse(source).map_err(|e| {
        DownloadError::TransportUnavailable(format!("无效的媒体地址 {}: {}", source, e))
    })?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        scheme => Err(DownloadError::TransportUnavailable(format!(
            "不支持的协议 {}: {}",
            scheme, source
        ))),
    }
}

#[async_trait]
impl Transport for ExtractionTransport {
    fn kind(&self) -> TaskKind {
        TaskKind::Extraction
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    async fn begin(&self, request: &TransferRequest, sink: EventSink) -> Result<TransferHandle> {
        validate_source(&request.source)?;
        tokio::fs::create_dir_all(&request.destination)
            .await
            .map_err(|e| {
                DownloadError::TransportUnavailable(format!(
                    "无法创建保存目录 {}: {}",
                    request.destination.display(),
                    e
                ))
            })?;

        debug!("开始 extraction 传输: {} -> {:?}", request.task_id, request.destination);
        let selector = format_selector(request.quality, request.audio_only);
        process::launch(
            &request.task_id,
            TaskKind::Extraction,
            &self.build_command(request, &selector),
            YtDlpOutput::for_selector(&selector),
            sink,
        )
    }

    async fn pause(&self, handle: &TransferHandle) -> Result<()> {
        if handle.is_cancelled() {
            return Err(DownloadError::InvalidState(format!(
                "任务 {} 已取消",
                handle.task_id
            )));
        }
        warn!("⏸️ 挂起工作进程 (任务: {})，暂停为尽力而为", handle.task_id);
        process::suspend(handle)
    }

    async fn resume(&self, handle: &TransferHandle) -> Result<()> {
        if handle.is_cancelled() {
            return Err(DownloadError::InvalidState(format!(
                "任务 {} 已取消",
                handle.task_id
            )));
        }
        debug!("继续工作进程 (任务: {})", handle.task_id);
        process::resume(handle)
    }
}

lazy_static! {
    // [download]  45.3% of ~ 10.52MiB at  1.23MiB/s ETA 00:07 (frag 3/10)
    // [download] 100% of 10.52MiB in 00:00:08 at 1.23MiB/s
    static ref PROGRESS_LINE: Regex = Regex::new(
        r"^\[download\]\s+(?P<pct>[\d.]+)%\s+of\s+~?\s*(?P<total>\S+)(?:\s+in\s+\S+)?(?:\s+at\s+(?P<rate>Unknown B/s|Unknown speed|\S+))?(?:\s+ETA\s+(?P<eta>\S+))?"
    ).unwrap();
    static ref DESTINATION_LINE: Regex =
        Regex::new(r"^\[download\] Destination: (?P<path>.+)$").unwrap();
    // [info] dQw4w9WgXcQ: Downloading 1 format(s): 137+140
    static ref FORMATS_LINE: Regex =
        Regex::new(r"^\[info\] .*Downloading \d+ format\(s\): (?P<ids>\S+)").unwrap();
}

/// yt-dlp 输出解析。
///
/// 音视频分开下载时每个流都从 0% 走到 100%，这里按流的序号换算成整体进度，
/// 否则第一个流结束后整体进度就停在上限。
#[derive(Default)]
pub struct YtDlpOutput {
    destination_file: Option<PathBuf>,
    total_bytes: Option<u64>,
    // 预计的流数量，0 表示未知（按单流处理）
    stream_count: usize,
    // 已出现的 Destination 行数
    streams_started: usize,
    // 上次兜底检查之后是否收到过百分比
    saw_percent: bool,
    speed: SpeedCalculator,
}

impl YtDlpOutput {
    pub fn for_selector(selector: &str) -> Self {
        Self {
            stream_count: expected_streams(selector),
            ..Self::default()
        }
    }

    /// 当前流的百分比 -> 整体百分比
    fn overall_percent(&self, stream_percent: f64) -> f64 {
        let streams = self.stream_count.max(self.streams_started).max(1);
        let finished = self.streams_started.saturating_sub(1).min(streams - 1);
        (finished as f64 * 100.0 + stream_percent.clamp(0.0, 100.0)) / streams as f64
    }

    fn progress_line(&mut self, line: &str) -> Option<ProgressSample> {
        let caps = PROGRESS_LINE.captures(line)?;
        let percent: f64 = caps["pct"].parse().ok()?;
        if let Some(total) = parse_size(&caps["total"]) {
            self.total_bytes = Some(total);
        }

        let rate = caps.name("rate").map(|m| match parse_size(m.as_str()) {
            Some(bps) => RateSample::BytesPerSecond(bps as f64),
            None => RateSample::Text(m.as_str().to_string()),
        });
        let eta = caps.name("eta").map(|m| match parse_duration(m.as_str()) {
            Some(eta) => EtaSample::Seconds(eta.as_secs()),
            None => EtaSample::Text(m.as_str().to_string()),
        });

        self.saw_percent = true;
        Some(ProgressSample {
            progress: RawProgress::Percent(self.overall_percent(percent)),
            rate,
            eta,
        })
    }

    async fn observed_size(path: &Path) -> Option<u64> {
        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        for candidate in [PathBuf::from(partial), path.to_path_buf()] {
            if let Ok(meta) = tokio::fs::metadata(&candidate).await {
                return Some(meta.len());
            }
        }
        None
    }
}

#[async_trait]
impl OutputInterpreter for YtDlpOutput {
    fn interpret(&mut self, line: &str) -> Vec<TransportEvent> {
        if let Some(caps) = FORMATS_LINE.captures(line) {
            self.stream_count = caps["ids"].split('+').count();
            return Vec::new();
        }
        if let Some(caps) = DESTINATION_LINE.captures(line) {
            // 新的流开始，重新计速
            self.destination_file = Some(PathBuf::from(caps["path"].trim()));
            self.streams_started += 1;
            self.total_bytes = None;
            self.speed = SpeedCalculator::default();
            return Vec::new();
        }
        self.progress_line(line)
            .map(|sample| vec![TransportEvent::Progress(sample)])
            .unwrap_or_default()
    }

    fn error_detail(&self, line: &str) -> Option<String> {
        line.strip_prefix("ERROR: ")
            .map(|detail| detail.trim().to_string())
            .filter(|detail| !detail.is_empty())
    }

    fn idle_interval(&self) -> Option<Duration> {
        Some(SIZE_POLL_INTERVAL)
    }

    async fn on_idle(&mut self) -> Option<TransportEvent> {
        if std::mem::take(&mut self.saw_percent) {
            return None;
        }
        let path = self.destination_file.clone()?;
        let downloaded = Self::observed_size(&path).await?;
        self.speed.record(downloaded);

        let rate = self.speed.bytes_per_sec().map(RateSample::BytesPerSecond);
        let eta = self
            .total_bytes
            .and_then(|total| self.speed.eta_secs(total.saturating_sub(downloaded)))
            .map(EtaSample::Seconds);
        let progress = match self.total_bytes {
            Some(total) if total > 0 => RawProgress::Percent(
                self.overall_percent(downloaded as f64 / total as f64 * 100.0),
            ),
            _ => RawProgress::Bytes {
                downloaded,
                total: None,
            },
        };
        Some(TransportEvent::Progress(ProgressSample {
            progress,
            rate,
            eta,
        }))
    }
}
