use serde_json::{Value, json};
use tracing::debug;

use super::methods;
use crate::common::models::{DownloadRequest, TaskKind};
use crate::downloader::{ControlAck, DownloadError, DownloadOrchestrator};

/// 控制请求处理器：方法名 + 参数 -> JSON 结果
#[derive(Clone)]
pub struct ControlHandler {
    orchestrator: DownloadOrchestrator,
}

impl ControlHandler {
    pub fn new(orchestrator: DownloadOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &DownloadOrchestrator {
        &self.orchestrator
    }

    pub async fn handle(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        debug!("控制请求: {} {}", method, params);
        match method {
            methods::START => Ok(self.start(params)),
            methods::PAUSE => Ok(ack_json(self.orchestrator.pause(&task_id_param(&params)?).await)),
            methods::RESUME => Ok(ack_json(self.orchestrator.resume(&task_id_param(&params)?).await)),
            methods::CANCEL => Ok(ack_json(self.orchestrator.cancel(&task_id_param(&params)?).await)),
            methods::GET_ALL => Ok(serde_json::to_value(self.orchestrator.list())?),
            methods::CLEAR => Ok(json!({ "removed": self.orchestrator.clear_finished() })),
            methods::DESCRIBE => Ok(self.describe()),
            _ => Err(anyhow::anyhow!("未知的方法: {}", method)),
        }
    }

    // 请求格式错误和同步校验失败都以 {success:false} 返回，而不是协议错误
    fn start(&self, params: Value) -> Value {
        let request: DownloadRequest = match serde_json::from_value(params) {
            Ok(request) => request,
            Err(e) => return failure(&DownloadError::InvalidRequest(e.to_string())),
        };
        match self.orchestrator.start(request) {
            Ok(task_id) => json!({ "success": true, "taskId": task_id }),
            Err(e) => failure(&e),
        }
    }

    fn describe(&self) -> Value {
        let capabilities: serde_json::Map<String, Value> = [TaskKind::Swarm, TaskKind::Extraction]
            .into_iter()
            .filter_map(|kind| {
                self.orchestrator
                    .capabilities(kind)
                    .map(|caps| (kind.to_string(), json!(caps)))
            })
            .collect();
        json!({
            "methods": methods::get_method_definitions(),
            "capabilities": capabilities,
            "defaultDestination": self.orchestrator.default_destination_directory(),
        })
    }
}

fn failure(err: &DownloadError) -> Value {
    json!({
        "success": false,
        "error": err.code(),
        "message": err.to_string(),
    })
}

fn ack_json(ack: ControlAck) -> Value {
    match ack {
        ControlAck::Done => json!({ "success": true }),
        ControlAck::Warning(err) => json!({
            "success": false,
            "warning": err.code(),
            "message": err.to_string(),
        }),
    }
}

// 兼容 "id" 直接作为参数，以及 {"taskId": ...} / {"id": ...}
fn task_id_param(params: &Value) -> anyhow::Result<String> {
    let id = match params {
        Value::String(id) => Some(id.as_str()),
        Value::Object(map) => map
            .get("taskId")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str),
        _ => None,
    };
    id.map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("缺少 taskId 参数"))
}
