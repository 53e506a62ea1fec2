#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use media_downloader::common::models::TaskKind;
use media_downloader::config::{Settings, StaticSettings};
use media_downloader::downloader::error::{DownloadError, Result};
use media_downloader::downloader::transport::EventSink;
use media_downloader::downloader::{
    DownloadEvent, DownloadOrchestrator, Subscription, Task, TaskState, TransferHandle,
    TransferRequest, Transport, TransportCapabilities, TransportEvent,
};

pub const TEST_DOWNLOAD_DIR: &str = "/tmp/mediadl-tests";
const WAIT: Duration = Duration::from_secs(5);

/// 由测试手动推送事件的内存传输
pub struct ScriptedTransport {
    kind: TaskKind,
    capabilities: TransportCapabilities,
    fail_begin: Option<String>,
    begin_delay: Option<Duration>,
    sinks: DashMap<String, EventSink>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn swarm() -> Self {
        Self::new(TaskKind::Swarm, TransportCapabilities::begin_cancel_only())
    }

    pub fn extraction() -> Self {
        Self::new(
            TaskKind::Extraction,
            TransportCapabilities::best_effort_pause_resume(),
        )
    }

    fn new(kind: TaskKind, capabilities: TransportCapabilities) -> Self {
        Self {
            kind,
            capabilities,
            fail_begin: None,
            begin_delay: None,
            sinks: DashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_begin(mut self, detail: &str) -> Self {
        self.fail_begin = Some(detail.to_string());
        self
    }

    pub fn with_begin_delay(mut self, delay: Duration) -> Self {
        self.begin_delay = Some(delay);
        self
    }

    /// 向任务推送一条传输事件；调度器已不再接收时返回 false
    pub async fn emit(&self, id: &str, event: TransportEvent) -> bool {
        let sink = self.sinks.get(id).map(|sink| sink.clone());
        match sink {
            Some(sink) => sink.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn progress(&self, id: &str, ratio: f64) -> bool {
        self.emit(
            id,
            TransportEvent::Progress(media_downloader::downloader::progress::ProgressSample::ratio(
                ratio,
            )),
        )
        .await
    }

    /// 丢弃事件通道，模拟传输意外结束
    pub fn close(&self, id: &str) {
        self.sinks.remove(id);
    }

    pub fn has_begun(&self, id: &str) -> bool {
        self.sinks.contains_key(id)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    async fn begin(&self, request: &TransferRequest, sink: EventSink) -> Result<TransferHandle> {
        if let Some(delay) = self.begin_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(format!("begin:{}", request.task_id));
        if let Some(detail) = &self.fail_begin {
            return Err(DownloadError::TransportUnavailable(detail.clone()));
        }
        self.sinks.insert(request.task_id.clone(), sink);
        Ok(TransferHandle::new(request.task_id.clone(), self.kind, None))
    }

    async fn cancel(&self, handle: &TransferHandle) -> Result<()> {
        handle.cancellation().cancel();
        self.sinks.remove(&handle.task_id);
        self.record(format!("cancel:{}", handle.task_id));
        Ok(())
    }

    async fn pause(&self, handle: &TransferHandle) -> Result<()> {
        if !self.capabilities.supports_pause {
            return Err(DownloadError::unsupported(self.kind, "pause"));
        }
        self.record(format!("pause:{}", handle.task_id));
        Ok(())
    }

    async fn resume(&self, handle: &TransferHandle) -> Result<()> {
        if !self.capabilities.supports_resume {
            return Err(DownloadError::unsupported(self.kind, "resume"));
        }
        self.record(format!("resume:{}", handle.task_id));
        Ok(())
    }
}

pub fn test_settings() -> Arc<StaticSettings> {
    Arc::new(StaticSettings(Settings {
        download_path: TEST_DOWNLOAD_DIR.to_string(),
        ..Settings::default()
    }))
}

pub fn orchestrator(
    swarm: &Arc<ScriptedTransport>,
    extraction: &Arc<ScriptedTransport>,
) -> DownloadOrchestrator {
    DownloadOrchestrator::builder()
        .transport(swarm.clone())
        .transport(extraction.clone())
        .settings(test_settings())
        .build()
}

pub async fn next_event(subscription: &mut Subscription) -> DownloadEvent {
    tokio::time::timeout(WAIT, subscription.recv())
        .await
        .expect("等待事件超时")
        .expect("事件流已关闭")
}

/// 等待某个任务进入指定状态，返回该快照
pub async fn wait_for_state(subscription: &mut Subscription, id: &str, state: TaskState) -> Task {
    loop {
        if let DownloadEvent::Progress { task } = next_event(subscription).await {
            if task.id == id && task.state == state {
                return task;
            }
        }
    }
}

/// 短暂等待后取出所有已到达的事件
pub async fn drain(subscription: &mut Subscription) -> Vec<DownloadEvent> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

pub fn progress_of(events: &[DownloadEvent], id: &str) -> Vec<Task> {
    events
        .iter()
        .filter_map(|event| match event {
            DownloadEvent::Progress { task } if task.id == id => Some(task.clone()),
            _ => None,
        })
        .collect()
}
