//! 传输适配器
//!
//! 两种传输的能力并不对称：两者都支持 `begin` / `cancel`，只有 extraction
//! 能通过挂起/继续外部进程实现尽力而为的暂停与恢复。调度器只依赖
//! [`Transport`] 与 [`TransferHandle`]，不关心具体实现。

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{DownloadError, Result};
use super::progress::ProgressSample;
use super::task::TaskId;
use crate::common::models::{QualityHint, TaskKind};

pub mod extraction;
pub mod process;
pub mod swarm;

pub use extraction::ExtractionTransport;
pub use swarm::SwarmTransport;

/// 传输层原始事件。`Completed` / `Failed` 之后不会再有事件。
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Progress(ProgressSample),
    // 仅 swarm：握手后拿到真实名字
    MetadataResolved(String),
    Completed,
    Failed(String),
}

/// 每个任务一个生产者，消费者是调度器
pub type EventSink = mpsc::Sender<TransportEvent>;

/// 传输能力声明，初始化时确定，之后不变
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransportCapabilities {
    pub supports_pause: bool,
    pub supports_resume: bool,
    // 暂停只是近似：进程网络栈中已缓冲的数据仍可能落盘，恢复也不保证在所有系统上可靠
    pub best_effort_pause: bool,
}

impl TransportCapabilities {
    pub fn begin_cancel_only() -> Self {
        Self {
            supports_pause: false,
            supports_resume: false,
            best_effort_pause: false,
        }
    }

    pub fn best_effort_pause_resume() -> Self {
        Self {
            supports_pause: true,
            supports_resume: true,
            best_effort_pause: true,
        }
    }
}

/// 启动一次传输所需的全部信息
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub task_id: TaskId,
    pub source: String,
    pub destination: PathBuf,
    pub quality: Option<QualityHint>,
    pub audio_only: bool,
}

/// 一次进行中的传输。由调度器独占持有，不在任务间共享。
#[derive(Debug, Clone)]
pub struct TransferHandle {
    pub task_id: TaskId,
    pub kind: TaskKind,
    // 外部工作进程的 pid（如果有）
    pub pid: Option<u32>,
    cancel: CancellationToken,
}

impl TransferHandle {
    pub fn new(task_id: TaskId, kind: TaskKind, pid: Option<u32>) -> Self {
        Self {
            task_id,
            kind,
            pid,
            cancel: CancellationToken::new(),
        }
    }

    /// 传输工作单元监听这个令牌，被取消时释放自身资源
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TaskKind;

    fn capabilities(&self) -> &TransportCapabilities;

    /// 启动传输。只做短暂的同步准备，真正的传输交给独立调度的工作单元，
    /// 通过 `sink` 推送事件。
    async fn begin(&self, request: &TransferRequest, sink: EventSink) -> Result<TransferHandle>;

    /// 终止传输并释放资源；重复调用是空操作
    async fn cancel(&self, handle: &TransferHandle) -> Result<()> {
        handle.cancel.cancel();
        Ok(())
    }

    async fn pause(&self, _handle: &TransferHandle) -> Result<()> {
        Err(DownloadError::unsupported(self.kind(), "pause"))
    }

    async fn resume(&self, _handle: &TransferHandle) -> Result<()> {
        Err(DownloadError::unsupported(self.kind(), "resume"))
    }
}
