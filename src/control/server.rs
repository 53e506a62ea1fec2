//! 基于 JSON 行的控制服务：每行一个请求，每行一个响应，事件主动推送

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::handlers::ControlHandler;
use crate::downloader::{DownloadEvent, DownloadOrchestrator, Subscription};

#[derive(Debug, Deserialize)]
struct ControlRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

pub struct ControlServer {
    handler: ControlHandler,
}

impl ControlServer {
    pub fn new(orchestrator: DownloadOrchestrator) -> Self {
        Self {
            handler: ControlHandler::new(orchestrator),
        }
    }

    /// 在标准输入输出上运行，直到输入结束
    pub async fn run_stdio(&self) -> anyhow::Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.run(stdin, tokio::io::stdout()).await
    }

    /// 读取请求直到 EOF，然后终止所有进行中的传输
    pub async fn run<R, W>(&self, reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
        let writer_task = tokio::spawn(write_lines(writer, out_rx));
        let forwarder = tokio::spawn(forward_events(
            self.handler.orchestrator().subscribe(),
            out_tx.clone(),
        ));
        info!("🚀 控制服务已启动");

        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = self.dispatch(line).await;
            if out_tx.send(response).is_err() {
                warn!("输出已关闭，停止控制服务");
                break;
            }
        }

        info!("控制输入已结束，正在关闭");
        forwarder.abort();
        self.handler.orchestrator().shutdown().await;
        drop(out_tx);
        writer_task.await??;
        Ok(())
    }

    async fn dispatch(&self, line: &str) -> Value {
        let request: ControlRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("无法解析控制请求: {}", e);
                return json!({
                    "id": Value::Null,
                    "error": { "message": format!("无法解析请求: {}", e) }
                });
            }
        };

        match self.handler.handle(&request.method, request.params).await {
            Ok(result) => json!({ "id": request.id, "result": result }),
            Err(e) => {
                error!("控制请求失败 {}: {}", request.method, e);
                json!({ "id": request.id, "error": { "message": e.to_string() } })
            }
        }
    }
}

/// 推送给调用方的事件格式
pub fn event_message(event: &DownloadEvent) -> Value {
    let payload = match event {
        DownloadEvent::Progress { task } => json!(task),
        DownloadEvent::Canceled { task_id } => json!({ "taskId": task_id }),
        DownloadEvent::Error { task_id, detail } => json!({ "taskId": task_id, "detail": detail }),
    };
    json!({ "event": event.channel(), "payload": payload })
}

async fn forward_events(mut subscription: Subscription, out: mpsc::UnboundedSender<Value>) {
    while let Some(event) = subscription.recv().await {
        if out.send(event_message(&event)).is_err() {
            break;
        }
    }
    debug!("事件转发结束");
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Value>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}
