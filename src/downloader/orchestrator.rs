//! 下载调度器：创建任务、驱动传输、归一化进度、发布事件
//!
//! 所有事件都在持有任务记录锁（[`TaskRegistry::update`]）时发布，
//! 因此 `cancel` 删除记录之后，迟到的传输事件不会再产生任何可观察的输出。

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{DownloadError, Result};
use super::events::{DownloadEvent, EventBroadcaster, SubscriberId, Subscription};
use super::progress::apply_sample;
use super::registry::TaskRegistry;
use super::task::{Task, TaskId, TaskState, derive_task_id};
use super::transport::{
    ExtractionTransport, SwarmTransport, TransferHandle, TransferRequest, Transport,
    TransportCapabilities, TransportEvent,
};
use crate::common::models::{DownloadRequest, TaskKind};
use crate::config::{SettingsStore, StaticSettings};

// 每个任务的传输事件缓冲
const EVENT_BUFFER: usize = 64;
const DEFAULT_BEGIN_TIMEOUT: Duration = Duration::from_secs(15);

/// 控制调用的结果。警告只是提示，不是失败。
#[derive(Debug)]
pub enum ControlAck {
    Done,
    Warning(DownloadError),
}

impl ControlAck {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn warning(&self) -> Option<&DownloadError> {
        match self {
            Self::Done => None,
            Self::Warning(err) => Some(err),
        }
    }
}

// 调度器独占的传输句柄。begin 完成前 handle 为空，只能通过 token 取消。
// 同一个 ID 取消后可以被重新使用，generation 区分新旧两次传输。
struct ActiveTransfer {
    generation: u64,
    token: CancellationToken,
    handle: Option<TransferHandle>,
    transport: Arc<dyn Transport>,
}

struct Inner {
    registry: TaskRegistry,
    broadcaster: EventBroadcaster,
    transports: HashMap<TaskKind, Arc<dyn Transport>>,
    active: DashMap<TaskId, ActiveTransfer>,
    next_generation: AtomicU64,
    settings: Arc<dyn SettingsStore>,
    limiter: Option<Arc<Semaphore>>,
    begin_timeout: Duration,
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

pub struct OrchestratorBuilder {
    transports: HashMap<TaskKind, Arc<dyn Transport>>,
    settings: Option<Arc<dyn SettingsStore>>,
    max_concurrent: Option<usize>,
    begin_timeout: Option<Duration>,
}

impl OrchestratorBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// 同时传输的任务上限；超出的任务保持 queued 直到有空位
    pub fn max_concurrent(mut self, max: Option<usize>) -> Self {
        self.max_concurrent = max.filter(|max| *max > 0);
        self
    }

    pub fn begin_timeout(mut self, timeout: Duration) -> Self {
        self.begin_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> DownloadOrchestrator {
        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(StaticSettings::default()));
        DownloadOrchestrator {
            inner: Arc::new(Inner {
                registry: TaskRegistry::new(),
                broadcaster: EventBroadcaster::new(),
                transports: self.transports,
                active: DashMap::new(),
                next_generation: AtomicU64::new(1),
                settings,
                limiter: self.max_concurrent.map(|max| Arc::new(Semaphore::new(max))),
                begin_timeout: self.begin_timeout.unwrap_or(DEFAULT_BEGIN_TIMEOUT),
            }),
        }
    }
}

impl DownloadOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder {
            transports: HashMap::new(),
            settings: None,
            max_concurrent: None,
            begin_timeout: None,
        }
    }

    /// 使用设置中的可执行文件路径创建 aria2c / yt-dlp 两种传输
    pub fn from_settings(settings: Arc<dyn SettingsStore>) -> Self {
        let current = settings.settings();
        Self::builder()
            .transport(Arc::new(SwarmTransport::new(&current.aria2c_path)))
            .transport(Arc::new(ExtractionTransport::new(&current.yt_dlp_path)))
            .max_concurrent(current.max_concurrent_downloads)
            .begin_timeout(current.begin_timeout())
            .settings(settings)
            .build()
    }

    /// 创建 queued 任务并异步启动传输，立即返回任务ID。
    ///
    /// 只有同步校验失败（缺少源、kind 没有对应传输、ID 重复）会在这里返回错误，
    /// 传输本身的失败通过事件流报告。
    pub fn start(&self, request: DownloadRequest) -> Result<TaskId> {
        let kind = request.kind;
        let source = request
            .source()
            .ok_or_else(|| DownloadError::InvalidRequest("缺少下载源 (sourceDescriptor)".to_string()))?
            .to_string();
        let transport = self.inner.transports.get(&kind).cloned().ok_or_else(|| {
            DownloadError::InvalidRequest(format!("没有可用的 {} 传输", kind))
        })?;

        let created_at = Utc::now();
        let id = request
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| derive_task_id(kind, &source, created_at));

        let save_path = request
            .destination_directory_override
            .clone()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| self.inner.settings.default_destination_directory());
        let quality = match (request.quality_hint, kind) {
            (Some(hint), _) => Some(hint),
            (None, TaskKind::Extraction) => {
                self.inner.settings.settings().default_quality.map(Into::into)
            }
            (None, TaskKind::Swarm) => None,
        };

        let task = Task::new(
            id.clone(),
            kind,
            source.clone(),
            request.display_name.clone(),
            save_path.clone(),
            created_at,
        );
        self.inner.registry.create(task)?;
        info!("创建下载任务: {} ({}) -> {}", id, kind, save_path.display());
        self.inner.publish_snapshot(&id);

        let token = CancellationToken::new();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.active.insert(
            id.clone(),
            ActiveTransfer {
                generation,
                token: token.clone(),
                handle: None,
                transport: transport.clone(),
            },
        );

        let transfer = TransferRequest {
            task_id: id.clone(),
            source,
            destination: save_path,
            quality,
            audio_only: request.audio_only,
        };
        tokio::spawn(drive(
            self.inner.clone(),
            transport,
            transfer,
            Driver { generation, token },
        ));
        Ok(id)
    }

    /// 暂停。传输不支持时返回 `CapabilityUnsupported` 警告，任务状态不变。
    pub async fn pause(&self, id: &str) -> ControlAck {
        self.suspend_or_resume(id, Toggle::Pause).await
    }

    pub async fn resume(&self, id: &str) -> ControlAck {
        self.suspend_or_resume(id, Toggle::Resume).await
    }

    async fn suspend_or_resume(&self, id: &str, toggle: Toggle) -> ControlAck {
        let Some(task) = self.inner.registry.get(id) else {
            warn!("{}: 任务不存在 {}", toggle.name(), id);
            return ControlAck::Warning(DownloadError::UnknownTask(id.to_string()));
        };
        let Some(transport) = self.inner.transports.get(&task.kind).cloned() else {
            return ControlAck::Warning(DownloadError::unsupported(task.kind, toggle.name()));
        };

        let capabilities = transport.capabilities();
        let supported = match toggle {
            Toggle::Pause => capabilities.supports_pause,
            Toggle::Resume => capabilities.supports_resume,
        };
        if !supported {
            warn!("⚠️ {} 传输不支持 {}: {}", task.kind, toggle.name(), id);
            return ControlAck::Warning(DownloadError::unsupported(task.kind, toggle.name()));
        }

        if task.state != toggle.required_state() {
            warn!("{}: 任务 {} 当前状态为 {}", toggle.name(), id, task.state.as_str());
            return ControlAck::Warning(DownloadError::InvalidState(format!(
                "任务 {} 当前状态为 {}，无法 {}",
                id,
                task.state.as_str(),
                toggle.name()
            )));
        }

        // 先克隆句柄，不在 await 期间持有 DashMap 引用
        let handle = self
            .inner
            .active
            .get(id)
            .and_then(|active| active.handle.clone());
        let Some(handle) = handle else {
            return ControlAck::Warning(DownloadError::InvalidState(format!(
                "任务 {} 的传输尚未启动",
                id
            )));
        };

        let outcome = match toggle {
            Toggle::Pause => transport.pause(&handle).await,
            Toggle::Resume => transport.resume(&handle).await,
        };
        if let Err(e) = outcome {
            warn!("{} 失败 {}: {}", toggle.name(), id, e);
            return ControlAck::Warning(e);
        }

        let target = toggle.target_state();
        let moved = self.inner.update_and_publish(id, |task| task.transition(target));
        match moved {
            Some(true) => {
                info!("任务 {} -> {}", id, target.as_str());
                if capabilities.best_effort_pause {
                    debug!("{} 的暂停/恢复为尽力而为", task.kind);
                }
                ControlAck::Done
            }
            Some(false) => ControlAck::Warning(DownloadError::InvalidState(format!(
                "任务 {} 状态已改变，无法 {}",
                id,
                toggle.name()
            ))),
            None => ControlAck::Warning(DownloadError::UnknownTask(id.to_string())),
        }
    }

    /// 取消并移除任务。对已结束的任务同样有效，`canceled` 事件只发一次。
    pub async fn cancel(&self, id: &str) -> ControlAck {
        let active = self.inner.active.remove(id).map(|(_, active)| active);
        // 先取消 token 再删除记录：同一 ID 的新任务创建时，旧的驱动已经不会再写入
        if let Some(active) = &active {
            active.token.cancel();
        }
        let removed = self.inner.registry.remove(id);

        if let Some(active) = active {
            if let Some(handle) = active.handle {
                if let Err(e) = active.transport.cancel(&handle).await {
                    warn!("终止传输失败 {}: {}", id, e);
                }
            }
        }

        match removed {
            Some(task) => {
                info!("🛑 已取消任务: {} ({})", id, task.display_name);
                self.inner.broadcaster.publish(DownloadEvent::Canceled {
                    task_id: id.to_string(),
                });
                ControlAck::Done
            }
            None => {
                debug!("取消未知任务: {}", id);
                ControlAck::Warning(DownloadError::UnknownTask(id.to_string()))
            }
        }
    }

    /// 按创建顺序返回所有任务的快照
    pub fn list(&self) -> Vec<Task> {
        self.inner.registry.list()
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.registry.get(id)
    }

    /// 移除已完成和出错的任务，返回被移除的ID
    pub fn clear_finished(&self) -> Vec<TaskId> {
        let removed = self
            .inner
            .registry
            .remove_where(|task| matches!(task.state, TaskState::Completed | TaskState::Error));
        if !removed.is_empty() {
            info!("清理了 {} 个已结束的任务", removed.len());
        }
        removed
    }

    /// 终止所有进行中的传输。记录保留，未结束的任务标记为 canceled。
    pub async fn shutdown(&self) {
        let ids: Vec<TaskId> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let teardowns = ids
            .into_iter()
            .filter_map(|id| self.inner.active.remove(&id))
            .map(|(id, active)| async move {
                active.token.cancel();
                // 传输已不存在，记录不能再停留在 downloading / paused
                self.inner
                    .update_and_publish(&id, |task| task.transition(TaskState::Canceled));
                if let Some(handle) = active.handle {
                    if let Err(e) = active.transport.cancel(&handle).await {
                        warn!("关闭时终止传输失败 {}: {}", id, e);
                    }
                }
            });
        join_all(teardowns).await;
        info!("下载调度器已关闭");
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.broadcaster.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.broadcaster.unsubscribe(id)
    }

    pub fn capabilities(&self, kind: TaskKind) -> Option<TransportCapabilities> {
        self.inner
            .transports
            .get(&kind)
            .map(|transport| *transport.capabilities())
    }

    /// 正在传输或排队中的任务数
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    pub fn default_destination_directory(&self) -> PathBuf {
        self.inner.settings.default_destination_directory()
    }
}

#[derive(Clone, Copy)]
enum Toggle {
    Pause,
    Resume,
}

impl Toggle {
    fn name(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }

    fn required_state(&self) -> TaskState {
        match self {
            Self::Pause => TaskState::Downloading,
            Self::Resume => TaskState::Paused,
        }
    }

    fn target_state(&self) -> TaskState {
        match self {
            Self::Pause => TaskState::Paused,
            Self::Resume => TaskState::Downloading,
        }
    }
}

impl Inner {
    fn publish_snapshot(&self, id: &str) {
        self.registry.update(id, |task| {
            self.broadcaster.publish(DownloadEvent::Progress { task: task.clone() });
        });
    }

    /// 在任务锁内修改记录；修改生效时发布快照
    fn update_and_publish(&self, id: &str, mutator: impl FnOnce(&mut Task) -> bool) -> Option<bool> {
        self.registry.update(id, |task| {
            let changed = mutator(task);
            if changed {
                self.broadcaster.publish(DownloadEvent::Progress { task: task.clone() });
            }
            changed
        })
    }

    /// 从活动表中移除这一次传输；同一 ID 的新传输不受影响
    fn release(&self, id: &str, generation: u64) {
        self.active
            .remove_if(id, |_, active| active.generation == generation);
    }
}

// 单个任务驱动持有的身份。token 在记录被删除之前取消，
// 所以在任务锁内检查 token 就能保证不会写到同一 ID 的新记录上。
struct Driver {
    generation: u64,
    token: CancellationToken,
}

impl Driver {
    fn update_and_publish(
        &self,
        inner: &Inner,
        id: &str,
        mutator: impl FnOnce(&mut Task) -> bool,
    ) -> Option<bool> {
        inner.registry.update(id, |task| {
            if self.token.is_cancelled() {
                return false;
            }
            let changed = mutator(task);
            if changed {
                inner.broadcaster.publish(DownloadEvent::Progress { task: task.clone() });
            }
            changed
        })
    }

    fn fail_task(&self, inner: &Inner, id: &str, detail: String) {
        inner.registry.update(id, |task| {
            if self.token.is_cancelled() {
                return;
            }
            if task.fail(detail.clone()) {
                error!("❌ 任务失败 {}: {}", id, detail);
                inner.broadcaster.publish(DownloadEvent::Progress { task: task.clone() });
                inner.broadcaster.publish(DownloadEvent::Error {
                    task_id: id.to_string(),
                    detail,
                });
            }
        });
    }

    /// 合并一条传输事件，返回 true 表示这个任务不会再有事件
    fn apply(&self, inner: &Inner, id: &str, event: TransportEvent) -> bool {
        let finished = inner.registry.update(id, |task| {
            if self.token.is_cancelled() || task.state.is_terminal() {
                return true;
            }
            match event {
                TransportEvent::Progress(sample) => {
                    // 暂停期间进程缓冲区里残留的输出不改变状态
                    if task.state == TaskState::Downloading {
                        apply_sample(task, &sample);
                        inner.broadcaster.publish(DownloadEvent::Progress { task: task.clone() });
                    }
                    false
                }
                TransportEvent::MetadataResolved(name) => {
                    if task.resolve_name(&name) {
                        info!("任务 {} 解析到名称: {}", id, task.display_name);
                        inner.broadcaster.publish(DownloadEvent::Progress { task: task.clone() });
                    }
                    false
                }
                TransportEvent::Completed => {
                    if task.state == TaskState::Paused {
                        task.transition(TaskState::Downloading);
                    }
                    if task.transition(TaskState::Completed) {
                        info!("✅ 下载完成: {} ({})", id, task.display_name);
                        inner.broadcaster.publish(DownloadEvent::Progress { task: task.clone() });
                    }
                    true
                }
                TransportEvent::Failed(detail) => {
                    if task.state == TaskState::Paused {
                        task.transition(TaskState::Downloading);
                    }
                    if task.fail(detail.clone()) {
                        error!("❌ 任务失败 {}: {}", id, detail);
                        inner.broadcaster.publish(DownloadEvent::Progress { task: task.clone() });
                        inner.broadcaster.publish(DownloadEvent::Error {
                            task_id: id.to_string(),
                            detail,
                        });
                    }
                    true
                }
            }
        });
        // 记录已被移除（取消）
        finished.unwrap_or(true)
    }
}

/// 单个任务的驱动：等待并发名额，启动传输，然后按顺序消费传输事件
async fn drive(
    inner: Arc<Inner>,
    transport: Arc<dyn Transport>,
    request: TransferRequest,
    driver: Driver,
) {
    let id = request.task_id.clone();
    let token = driver.token.clone();

    let _permit = match &inner.limiter {
        Some(limiter) => {
            let acquired = tokio::select! {
                _ = token.cancelled() => return,
                permit = limiter.clone().acquire_owned() => permit,
            };
            match acquired {
                Ok(permit) => Some(permit),
                Err(_) => {
                    driver.fail_task(&inner, &id, "并发控制已关闭".to_string());
                    inner.release(&id, driver.generation);
                    return;
                }
            }
        }
        None => None,
    };

    let (sink, mut events) = mpsc::channel(EVENT_BUFFER);
    let begun = tokio::select! {
        // 已经启动的传输交给下面的取消检查处理
        biased;
        result = tokio::time::timeout(inner.begin_timeout, transport.begin(&request, sink)) => result,
        _ = token.cancelled() => return,
    };
    let handle = match begun {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            driver.fail_task(&inner, &id, e.to_string());
            inner.release(&id, driver.generation);
            return;
        }
        Err(_) => {
            let e = DownloadError::TransportUnavailable(format!(
                "传输启动超时 ({}s)",
                inner.begin_timeout.as_secs()
            ));
            driver.fail_task(&inner, &id, e.to_string());
            inner.release(&id, driver.generation);
            return;
        }
    };
    debug!("传输已启动: {} (pid: {:?})", id, handle.pid);

    let stored = match inner.active.get_mut(&id) {
        Some(mut active) if active.generation == driver.generation => {
            active.handle = Some(handle.clone());
            true
        }
        _ => false,
    };
    if !stored || token.is_cancelled() {
        // begin 期间任务已被取消
        let _ = transport.cancel(&handle).await;
        return;
    }

    let started = driver
        .update_and_publish(&inner, &id, |task| task.transition(TaskState::Downloading))
        .unwrap_or(false);
    if !started {
        let _ = transport.cancel(&handle).await;
        inner.release(&id, driver.generation);
        return;
    }
    info!("⬇️ 开始下载: {}", id);

    loop {
        let event = tokio::select! {
            // 取消后传输关闭通道，不能把它当成意外结束
            biased;
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(event) => {
                if driver.apply(&inner, &id, event) {
                    break;
                }
            }
            None => {
                driver.fail_task(&inner, &id, "传输意外结束".to_string());
                break;
            }
        }
    }

    inner.release(&id, driver.generation);
}
