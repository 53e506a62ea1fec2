use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use super::task::{Task, TaskId};

/// 归一化后的、与传输无关的事件
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DownloadEvent {
    // 每次进度更新和每次状态迁移都会发出
    Progress { task: Task },
    // 任务因取消被移除时发出一次
    Canceled { task_id: TaskId },
    // 每次失败发出一次
    Error { task_id: TaskId, detail: String },
}

impl DownloadEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Progress { task } => &task.id,
            Self::Canceled { task_id } | Self::Error { task_id, .. } => task_id,
        }
    }

    /// 原桌面程序中的事件通道名
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "download:progress",
            Self::Canceled { .. } => "download:cancel",
            Self::Error { .. } => "download:error",
        }
    }
}

pub type SubscriberId = u64;

/// 订阅者句柄；丢弃后广播器会在下一次发送时自动清理
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::UnboundedReceiver<DownloadEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<DownloadEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DownloadEvent> {
        self.receiver.try_recv().ok()
    }
}

/// 把事件分发给所有当前订阅者。只观察和转发，从不修改任务状态。
///
/// `publish` 不会阻塞，调度器在持有任务锁时调用它，以保证同一个任务的事件
/// 顺序与状态修改顺序一致。
#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: DashMap<SubscriberId, mpsc::UnboundedSender<DownloadEvent>>,
    next_id: AtomicU64,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.insert(id, sender);
        debug!("新增事件订阅者: {}", id);
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn publish(&self, event: DownloadEvent) {
        self.subscribers.retain(|id, sender| {
            let alive = sender.send(event.clone()).is_ok();
            if !alive {
                debug!("订阅者已关闭，移除: {}", id);
            }
            alive
        });
    }
}
