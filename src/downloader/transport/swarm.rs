use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::process::{self, OutputInterpreter, WorkerCommand};
use super::{
    EventSink, TransferHandle, TransferRequest, Transport, TransportCapabilities, TransportEvent,
};
use crate::common::models::TaskKind;
use crate::downloader::error::{DownloadError, Result};
use crate::downloader::progress::{
    EtaSample, ProgressSample, RateSample, RawProgress, parse_duration, parse_size,
};

/// 基于 aria2c 的磁力链接 / 种子下载。
///
/// 引擎本身不提供暂停，`pause` / `resume` 使用 trait 的默认实现返回
/// `CapabilityUnsupported`。
pub struct SwarmTransport {
    executable: PathBuf,
    capabilities: TransportCapabilities,
}

impl SwarmTransport {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            capabilities: TransportCapabilities::begin_cancel_only(),
        }
    }

    fn build_command(&self, source: &str, destination: &Path) -> WorkerCommand {
        WorkerCommand::new(&self.executable)
            .arg(format!("--dir={}", destination.display()))
            // 下载完成后立即退出，不做种
            .arg("--seed-time=0")
            .arg("--summary-interval=1")
            .arg("--console-log-level=notice")
            .arg("--enable-color=false")
            .arg("--follow-torrent=mem")
            .arg("--bt-save-metadata=false")
            .arg(source)
            .current_dir(destination)
    }
}

impl Default for SwarmTransport {
    fn default() -> Self {
        Self::new("aria2c")
    }
}

/// 校验磁力链接 / 种子源
pub fn validate_source(source: &str) -> Result<()> {
    let lower = source.to_ascii_lowercase();
    if lower.starts_with("magnet:?") {
        if lower.contains("xt=urn:btih:") || lower.contains("xt=urn:btmh:") {
            return Ok(());
        }
        return Err(DownloadError::TransportUnavailable(format!(
            "磁力链接缺少 info hash: {}",
            source
        )));
    }
    if lower.ends_with(".torrent") {
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(());
        }
        if Path::new(source).is_file() {
            return Ok(());
        }
        return Err(DownloadError::TransportUnavailable(format!(
            "种子文件不存在: {}",
            source
        )));
    }
    Err(DownloadError::TransportUnavailable(format!(
        "无法识别的磁力链接或种子: {}",
        source
    )))
}

#[async_trait]
impl Transport for SwarmTransport {
    fn kind(&self) -> TaskKind {
        TaskKind::Swarm
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

        debug!("开始 swarm 传输: {} -> {:?}", request.task_id, request.destination);
        let command = self.build_command(&request.source, &request.destination);
        process::launch(
            &request.task_id,
            TaskKind::Swarm,
            &command,
            Aria2Output::new(request.destination.clone()),
            sink,
        )
    }
}

lazy_static! {
    // [#2089b0 400KiB/33MiB(1%) CN:1 SD:3 DL:115KiB ETA:4m51s]
    static ref READOUT: Regex = Regex::new(
        r"\[#(?P<gid>[0-9a-fA-F]+)\s+(?P<done>[\d.]+[KMGT]?i?B)(?:/(?P<total>[\d.]+[KMGT]?i?B))?(?:\((?P<pct>\d+)%\))?(?P<rest>[^\]]*)\]"
    ).unwrap();
    static ref DL_RATE: Regex = Regex::new(r"DL:(?P<rate>[\d.]+[KMGT]?i?B)").unwrap();
    static ref ETA: Regex = Regex::new(r"ETA:(?P<eta>[\dwdhms]+)").unwrap();
    static ref METADATA_DONE: Regex =
        Regex::new(r"Download complete: \[MEMORY\]\[METADATA\](?P<name>.+)$").unwrap();
    static ref FILE_LINE: Regex = Regex::new(r"^FILE: (?P<path>.+)$").unwrap();
}

/// aria2c 控制台输出解析
pub struct Aria2Output {
    destination: PathBuf,
    name_resolved: bool,
}

impl Aria2Output {
    pub fn new(destination: PathBuf) -> Self {
        Self {
            destination,
            name_resolved: false,
        }
    }

    fn resolve_name(&mut self, name: &str) -> Option<TransportEvent> {
        let name = name.trim();
        if self.name_resolved || name.is_empty() {
            return None;
        }
        self.name_resolved = true;
        Some(TransportEvent::MetadataResolved(name.to_string()))
    }

    // FILE: /downloads/ubuntu/disk1.iso -> "ubuntu"
    fn name_from_file(&self, path: &str) -> Option<String> {
        if path.starts_with("[METADATA]") || path.starts_with("[MEMORY]") {
            return None;
        }
        let path = Path::new(path);
        let relative = path.strip_prefix(&self.destination).unwrap_or(path);
        relative.components().find_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
    }

    fn readout(line: &str) -> Option<ProgressSample> {
        // 非终端输出时多条 readout 可能被 '\r' 拼在一行，取最后一条
        let caps = READOUT.captures_iter(line).last()?;
        let done = caps.name("done").and_then(|m| parse_size(m.as_str()));
        let total = caps.name("total").and_then(|m| parse_size(m.as_str()));

        let progress = match (done, total) {
            (Some(done), Some(total)) if total > 0 => RawProgress::Ratio(done as f64 / total as f64),
            _ => match caps.name("pct").and_then(|m| m.as_str().parse::<f64>().ok()) {
                Some(pct) if total.unwrap_or(0) > 0 => RawProgress::Ratio(pct / 100.0),
                _ => RawProgress::Unknown,
            },
        };

        let rest = caps.name("rest").map(|m| m.as_str()).unwrap_or("");
        let rate = DL_RATE
            .captures(rest)
            .and_then(|c| parse_size(&c["rate"]))
            .map(|bps| RateSample::BytesPerSecond(bps as f64));
        let eta = ETA
            .captures(rest)
            .and_then(|c| parse_duration(&c["eta"]))
            .map(|eta| EtaSample::Seconds(eta.as_secs()));

        Some(ProgressSample {
            progress,
            rate,
            eta,
        })
    }
}

impl OutputInterpreter for Aria2Output {
    fn interpret(&mut self, line: &str) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if let Some(caps) = METADATA_DONE.captures(line) {
            events.extend(self.resolve_name(&caps["name"]));
        } else if let Some(caps) = FILE_LINE.captures(line.trim()) {
            if let Some(name) = self.name_from_file(&caps["path"]) {
                events.extend(self.resolve_name(&name));
            }
        }

        if let Some(sample) = Self::readout(line) {
            events.push(TransportEvent::Progress(sample));
        }
        events
    }

    fn error_detail(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if let Some(idx) = line.find("[ERROR]") {
            return Some(line[idx + "[ERROR]".len()..].trim().to_string());
        }
        line.strip_prefix("Exception:")
            .or_else(|| line.strip_prefix("-> "))
            .map(|detail| detail.trim().to_string())
            .filter(|detail| !detail.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_source() {
        assert!(validate_source("magnet:?xt=urn:btih:0123456789abcdef&dn=ubuntu").is_ok());
        assert!(validate_source("https://example.com/ubuntu.torrent").is_ok());
        assert_eq!(
            validate_source("magnet:?dn=nohash").unwrap_err().code(),
            "TransportUnavailable"
        );
        assert_eq!(
            validate_source("/nonexistent/file.torrent").unwrap_err().code(),
            "TransportUnavailable"
        );
        assert!(validate_source("https://example.com/video").is_err());
    }

    #[test]
    fn test_readout_progress() {
        let mut output = Aria2Output::new(PathBuf::from("/downloads"));
        let events =
            output.interpret("[#2089b0 1.0MiB/4.0MiB(25%) CN:1 SD:3 DL:512KiB ETA:6s]");
        assert_eq!(
            events,
            vec![TransportEvent::Progress(ProgressSample {
                progress: RawProgress::Ratio(0.25),
                rate: Some(RateSample::BytesPerSecond(524288.0)),
                eta: Some(EtaSample::Seconds(6)),
            })]
        );
    }

    #[test]
    fn test_metadata_phase_has_no_ratio() {
        let mut output = Aria2Output::new(PathBuf::from("/downloads"));
        let events = output.interpret("[#a1b2c3 0B CN:1 SD:0 DL:0B]");
        assert_eq!(
            events,
            vec![TransportEvent::Progress(ProgressSample {
                progress: RawProgress::Unknown,
                rate: Some(RateSample::BytesPerSecond(0.0)),
                eta: None,
            })]
        );
    }

    #[test]
    fn test_concatenated_readouts_use_last() {
        let mut output = Aria2Output::new(PathBuf::from("/downloads"));
        let events = output.interpret(
            "\r[#abc 1MiB/10MiB(10%) CN:1 DL:1MiB ETA:9s]\r[#abc 2MiB/10MiB(20%) CN:1 DL:1MiB ETA:8s]",
        );
        match &events[..] {
            [TransportEvent::Progress(sample)] => {
                assert_eq!(sample.progress, RawProgress::Ratio(0.2));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_metadata_name_resolved_once() {
        let mut output = Aria2Output::new(PathBuf::from("/downloads"));
        let events = output.interpret(
            "10/19 12:00:01 [NOTICE] Download complete: [MEMORY][METADATA]ubuntu-24.04-desktop-amd64.iso",
        );
        assert_eq!(
            events,
            vec![TransportEvent::MetadataResolved(
                "ubuntu-24.04-desktop-amd64.iso".to_string()
            )]
        );
        assert!(output.interpret("FILE: /downloads/other/file.bin").is_empty());
    }

    #[test]
    fn test_name_from_file_line() {
        let mut output = Aria2Output::new(PathBuf::from("/downloads"));
        assert!(output.interpret("FILE: [METADATA]abcdef").is_empty());
        assert_eq!(
            output.interpret("FILE: /downloads/Big Buck Bunny/bbb.mp4"),
            vec![TransportEvent::MetadataResolved("Big Buck Bunny".to_string())]
        );
    }

    #[test]
    fn test_error_detail() {
        let output = Aria2Output::new(PathBuf::from("/downloads"));
        assert_eq!(
            output.error_detail("10/19 12:00:01 [ERROR] CUID#7 - Download aborted."),
            Some("CUID#7 - Download aborted.".to_string())
        );
        assert_eq!(
            output.error_detail("Exception: [AbstractCommand.cc:351] errorCode=1 Timeout"),
            Some("[AbstractCommand.cc:351] errorCode=1 Timeout".to_string())
        );
        assert_eq!(output.error_detail("[NOTICE] all good"), None);
    }
}
