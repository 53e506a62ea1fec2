use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::models::TaskKind;

pub type TaskId = String;

// 未知速率 / 剩余时间的统一表示
pub const UNKNOWN_LABEL: &str = "Unknown";

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

/// 由 (kind, source, 创建时间) 派生任务ID。
/// 末尾的进程内序号保证同一毫秒内对同一个源的重复请求也不会冲突。
pub fn derive_task_id(kind: TaskKind, source: &str, created_at: DateTime<Utc>) -> TaskId {
    let digest = Sha256::digest(source.as_bytes());
    let short: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}-{}", kind, short, created_at.timestamp_millis(), seq)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Canceled)
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Queued, Error)
                | (Queued, Canceled)
                | (Downloading, Downloading)
                | (Downloading, Completed)
                | (Downloading, Error)
                | (Downloading, Paused)
                | (Downloading, Canceled)
                | (Paused, Downloading)
                | (Paused, Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub display_name: String,
    pub kind: TaskKind,
    pub progress_percent: f64,
    pub rate_label: String,
    pub eta_label: String,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub save_path: PathBuf,
    pub source: String,
    pub created_at: DateTime<Utc>,
    // 展示名只允许被元数据覆盖一次
    #[serde(skip)]
    pub(crate) name_resolved: bool,
}

impl Task {
    pub fn new(
        id: TaskId,
        kind: TaskKind,
        source: impl Into<String>,
        display_name: Option<String>,
        save_path: PathBuf,
        created_at: DateTime<Utc>,
    ) -> Self {
        let display_name = display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        Self {
            id,
            display_name,
            kind,
            progress_percent: 0.0,
            rate_label: UNKNOWN_LABEL.to_string(),
            eta_label: UNKNOWN_LABEL.to_string(),
            state: TaskState::Queued,
            error_detail: None,
            save_path,
            source: source.into(),
            created_at,
            name_resolved: false,
        }
    }

    /// 迁移到新状态；不合法的迁移返回 false 且不修改记录
    pub fn transition(&mut self, next: TaskState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        match next {
            TaskState::Completed => {
                self.progress_percent = 100.0;
                self.eta_label = UNKNOWN_LABEL.to_string();
            }
            TaskState::Paused | TaskState::Error | TaskState::Canceled => {
                self.rate_label = UNKNOWN_LABEL.to_string();
                self.eta_label = UNKNOWN_LABEL.to_string();
            }
            _ => {}
        }
        true
    }

    pub fn fail(&mut self, detail: impl Into<String>) -> bool {
        if !self.transition(TaskState::Error) {
            return false;
        }
        self.error_detail = Some(detail.into());
        true
    }

    /// 用元数据中的真实名字替换展示名，只生效一次
    pub fn resolve_name(&mut self, name: &str) -> bool {
        let name = name.trim();
        if self.name_resolved || name.is_empty() {
            return false;
        }
        self.display_name = name.to_string();
        self.name_resolved = true;
        true
    }
}
