use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    // 请求缺少必填字段或 kind 不受支持，任务不会被创建
    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    // 传输层无法初始化（源格式错误、可执行文件缺失、启动超时）
    #[error("传输不可用: {0}")]
    TransportUnavailable(String),

    // 传输过程中失败（网络错误、进程异常退出）
    #[error("传输失败: {0}")]
    TransferFailed(String),

    #[error("当前传输不支持该操作: {operation} ({kind})")]
    CapabilityUnsupported { kind: String, operation: String },

    #[error("任务未找到: {0}")]
    UnknownTask(String),

    #[error("任务已存在: {0}")]
    DuplicateId(String),

    #[error("无效的状态: {0}")]
    InvalidState(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    pub fn unsupported(kind: impl ToString, operation: impl Into<String>) -> Self {
        Self::CapabilityUnsupported {
            kind: kind.to_string(),
            operation: operation.into(),
        }
    }

    /// 控制接口上使用的稳定错误名
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::TransportUnavailable(_) => "TransportUnavailable",
            Self::TransferFailed(_) => "TransferFailed",
            Self::CapabilityUnsupported { .. } => "CapabilityUnsupported",
            Self::UnknownTask(_) => "UnknownTask",
            Self::DuplicateId(_) => "DuplicateId",
            Self::InvalidState(_) => "InvalidState",
            Self::Io(_) => "Io",
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
