//! 进度归一化：把不同传输上报的原始信号转换成统一的 {百分比, 速率, 剩余时间}

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::task::{Task, UNKNOWN_LABEL};

// 未收到完成事件前进度最多到这里，保证 100% 只出现在 completed 状态
pub const MAX_PERCENT_BEFORE_COMPLETION: f64 = 99.9;

/// 传输上报的原始进度
#[derive(Debug, Clone, PartialEq)]
pub enum RawProgress {
    // 0.0 - 1.0 的连续比例（swarm）
    Ratio(f64),
    // 进程状态流里解析出的文本百分比（extraction）
    Percent(f64),
    // 已下载字节数，可能不知道总大小
    Bytes { downloaded: u64, total: Option<u64> },
    // 这一条状态里没有可用的进度
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateSample {
    BytesPerSecond(f64),
    // 传输自己给出的文本，例如 "1.23MiB/s"
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EtaSample {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub progress: RawProgress,
    pub rate: Option<RateSample>,
    pub eta: Option<EtaSample>,
}

impl ProgressSample {
    pub fn ratio(ratio: f64) -> Self {
        Self {
            progress: RawProgress::Ratio(ratio),
            rate: None,
            eta: None,
        }
    }

    pub fn percent(percent: f64) -> Self {
        Self {
            progress: RawProgress::Percent(percent),
            rate: None,
            eta: None,
        }
    }

    pub fn with_rate(mut self, rate: RateSample) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn with_eta(mut self, eta: EtaSample) -> Self {
        self.eta = Some(eta);
        self
    }
}

impl RawProgress {
    /// 转换为百分比；无法得到可信数值时返回 None
    pub fn to_percent(&self) -> Option<f64> {
        let percent = match self {
            Self::Ratio(ratio) => ratio * 100.0,
            Self::Percent(percent) => *percent,
            Self::Bytes {
                downloaded,
                total: Some(total),
            } if *total > 0 => *downloaded as f64 / *total as f64 * 100.0,
            _ => return None,
        };
        if percent.is_finite() {
            Some(percent.clamp(0.0, 100.0))
        } else {
            None
        }
    }
}

/// 把一条进度样本合并进任务记录。
///
/// 百分比只增不减；解析不出进度时保留原值，不会归零也不会让任务失败。
pub fn apply_sample(task: &mut Task, sample: &ProgressSample) {
    if let Some(percent) = sample.progress.to_percent() {
        let capped = percent.min(MAX_PERCENT_BEFORE_COMPLETION);
        if capped > task.progress_percent {
            task.progress_percent = capped;
        }
    }
    task.rate_label = sample
        .rate
        .as_ref()
        .and_then(render_rate)
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
    task.eta_label = sample
        .eta
        .as_ref()
        .and_then(render_eta)
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
}

fn render_rate(rate: &RateSample) -> Option<String> {
    match rate {
        RateSample::BytesPerSecond(bps) if bps.is_finite() && *bps >= 0.0 => Some(format_rate(*bps)),
        RateSample::BytesPerSecond(_) => None,
        RateSample::Text(text) => clean_label(text),
    }
}

fn render_eta(eta: &EtaSample) -> Option<String> {
    match eta {
        EtaSample::Seconds(secs) => Some(format_eta(Duration::from_secs(*secs))),
        EtaSample::Text(text) => clean_label(text),
    }
}

// "~1.2MiB/s" -> "1.2MiB/s"；"Unknown"、"N/A" 之类视为缺失
fn clean_label(text: &str) -> Option<String> {
    let text = text.trim().trim_start_matches('~').trim();
    if text.is_empty() {
        return None;
    }
    let lower = text.to_ascii_lowercase();
    if lower.starts_with("unknown") || lower.starts_with("n/a") || lower == "--" {
        return None;
    }
    Some(text.to_string())
}

/// 1024 进制的速率，保留两位小数，例如 "1.50 MB/s"
pub fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 5] = ["B/s", "KB/s", "MB/s", "GB/s", "TB/s"];
    if bytes_per_sec < 1.0 {
        return "0 B/s".to_string();
    }
    let mut value = bytes_per_sec;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// HH:MM:SS
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// 解析 "12.5MiB"、"400KiB"、"1.2GB"、"512B" 这样的大小
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim().trim_start_matches('~').trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim().trim_end_matches("/s") {
        "" | "B" => 1.0,
        "KiB" | "K" => 1024.0,
        "MiB" | "M" => 1024.0 * 1024.0,
        "GiB" | "G" => 1024.0 * 1024.0 * 1024.0,
        "TiB" | "T" => 1024.0_f64.powi(4),
        "KB" | "kB" => 1000.0,
        "MB" => 1000.0 * 1000.0,
        "GB" => 1000.0_f64.powi(3),
        "TB" => 1000.0_f64.powi(4),
        _ => return None,
    };
    Some((number * multiplier) as u64)
}

/// 解析 "4m51s" / "1h2m" / "00:07" / "1:02:03" 形式的时长
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if text.contains(':') {
        let mut secs = 0u64;
        for part in text.split(':') {
            secs = secs.checked_mul(60)?.checked_add(part.parse::<u64>().ok()?)?;
        }
        return Some(Duration::from_secs(secs));
    }

    let mut secs = 0u64;
    let mut number = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value: u64 = number.parse().ok()?;
        number.clear();
        let unit = match c {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        // 输出里的数字不可信，溢出时视为无法解析
        secs = secs.checked_add(value.checked_mul(unit)?)?;
    }
    if !number.is_empty() {
        return None;
    }
    Some(Duration::from_secs(secs))
}

/// 滑动窗口测速，用于只能观察到文件大小时估算速率
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(32),
            window,
            max_samples: 32,
        }
    }

    pub fn record(&mut self, downloaded_bytes: u64) {
        self.record_at(Instant::now(), downloaded_bytes);
    }

    pub fn record_at(&mut self, at: Instant, downloaded_bytes: u64) {
        while let Some((time, _)) = self.samples.front() {
            if at.duration_since(*time) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((at, downloaded_bytes));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// 窗口内的平均速率；样本不足两个时返回 None
    pub fn bytes_per_sec(&self) -> Option<f64> {
        let (first_time, first_bytes) = self.samples.front()?;
        let (last_time, last_bytes) = self.samples.back()?;
        let elapsed = last_time.duration_since(*first_time).as_secs_f64();
        if self.samples.len() < 2 || elapsed <= 0.0 {
            return None;
        }
        Some(last_bytes.saturating_sub(*first_bytes) as f64 / elapsed)
    }

    /// 根据当前速率估算剩余秒数
    pub fn eta_secs(&self, remaining_bytes: u64) -> Option<u64> {
        let bps = self.bytes_per_sec()?;
        if bps < 1.0 {
            return None;
        }
        Some((remaining_bytes as f64 / bps).ceil() as u64)
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
