//! 外部工作进程的公共驱动：启动、逐行读取状态输出、取消时结束进程、
//! 通过 SIGSTOP / SIGCONT 挂起和继续。

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EventSink, TransferHandle, TransportEvent};
use crate::common::models::TaskKind;
use crate::downloader::error::{DownloadError, Result};

/// 把进程输出翻译成传输事件，每种传输一个实现
#[async_trait]
pub trait OutputInterpreter: Send + 'static {
    /// 解析一行输出（stdout 和 stderr 都会送进来）
    fn interpret(&mut self, line: &str) -> Vec<TransportEvent>;

    /// 如果这一行描述了错误，返回给用户看的错误信息
    fn error_detail(&self, _line: &str) -> Option<String> {
        None
    }

    /// 周期性回调，用于状态流里没有进度时的兜底估算
    fn idle_interval(&self) -> Option<Duration> {
        None
    }

    async fn on_idle(&mut self) -> Option<TransportEvent> {
        None
    }
}

/// 待启动的外部命令
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn spawn(&self) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command.spawn().map_err(|e| {
            error!("❌ 无法启动 {}: {}", self.program.display(), e);
            DownloadError::TransportUnavailable(format!(
                "无法启动 {}: {}",
                self.program.display(),
                e
            ))
        })
    }
}

/// 启动工作进程并把驱动循环交给独立的 tokio 任务，立即返回句柄
pub fn launch<I: OutputInterpreter>(
    task_id: &str,
    kind: TaskKind,
    command: &WorkerCommand,
    interpreter: I,
    sink: EventSink,
) -> Result<TransferHandle> {
    let child = command.spawn()?;
    let handle = TransferHandle::new(task_id.to_string(), kind, child.id());
    info!(
        "已启动工作进程: {} (任务: {}, pid: {:?})",
        command.program.display(),
        task_id,
        handle.pid
    );

    let label = program_label(&command.program);
    let token = handle.cancellation();
    let task_id = task_id.to_string();
    tokio::spawn(async move {
        drive(child, interpreter, sink, token, &task_id, &label).await;
    });
    Ok(handle)
}

async fn drive<I: OutputInterpreter>(
    mut child: Child,
    mut interpreter: I,
    sink: EventSink,
    token: CancellationToken,
    task_id: &str,
    label: &str,
) {
    let mut stdout = child.stdout.take().map(BufReader::new);
    let mut stderr = child.stderr.take().map(BufReader::new);
    let mut last_error: Option<String> = None;

    let has_idle = interpreter.idle_interval().is_some();
    let mut ticker =
        tokio::time::interval(interpreter.idle_interval().unwrap_or(Duration::from_secs(3600)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while stdout.is_some() || stderr.is_some() {
        let events = tokio::select! {
            _ = token.cancelled() => {
                terminate(&mut child, task_id).await;
                return;
            }
            line = next_line(&mut stdout), if stdout.is_some() => match line {
                Some(line) => handle_line(&mut interpreter, &line, &mut last_error),
                None => {
                    stdout = None;
                    Vec::new()
                }
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line {
                Some(line) => {
                    debug!("[{}] {}", label, line);
                    handle_line(&mut interpreter, &line, &mut last_error)
                }
                None => {
                    stderr = None;
                    Vec::new()
                }
            },
            _ = ticker.tick(), if has_idle => {
                interpreter.on_idle().await.into_iter().collect()
            }
        };

        for event in events {
            if sink.send(event).await.is_err() {
                // 调度器已不再关心这个任务
                terminate(&mut child, task_id).await;
                return;
            }
        }
    }

    let status = tokio::select! {
        _ = token.cancelled() => {
            terminate(&mut child, task_id).await;
            return;
        }
        status = child.wait() => status,
    };

    let event = match status {
        Ok(status) if status.success() => {
            info!("✅ 工作进程正常退出: {} (任务: {})", label, task_id);
            TransportEvent::Completed
        }
        Ok(status) => {
            let detail = last_error.unwrap_or_else(|| describe_exit(label, status));
            warn!("❌ 工作进程失败: {} (任务: {}): {}", label, task_id, detail);
            TransportEvent::Failed(detail)
        }
        Err(e) => TransportEvent::Failed(format!("等待 {} 退出失败: {}", label, e)),
    };
    let _ = sink.send(event).await;
}

// 按字节读取一行。输出不一定是 UTF-8（标题、本地化错误信息），无效字节按替换字符处理；
// 只有 EOF 或读取错误才返回 None
async fn next_line<R>(reader: &mut Option<BufReader<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let reader = reader.as_mut()?;
    let mut buf = Vec::new();
    match reader.read_until(b'\n', &mut buf).await {
        Ok(0) => None,
        Ok(_) => {
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
        Err(e) => {
            debug!("读取工作进程输出失败: {}", e);
            None
        }
    }
}

fn handle_line<I: OutputInterpreter>(
    interpreter: &mut I,
    line: &str,
    last_error: &mut Option<String>,
) -> Vec<TransportEvent> {
    let line = line.trim_end_matches('\r');
    if let Some(detail) = interpreter.error_detail(line) {
        *last_error = Some(detail);
    }
    interpreter.interpret(line)
}

async fn terminate(child: &mut Child, task_id: &str) {
    // 已暂停 (SIGSTOP) 的进程同样会被 SIGKILL 结束
    match child.kill().await {
        Ok(()) => info!("已终止工作进程 (任务: {})", task_id),
        Err(e) => debug!("终止工作进程时出错 (任务: {}): {}", task_id, e),
    }
}

fn describe_exit(label: &str, status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("{} 退出码 {}", label, code),
        None => format!("{} 被信号终止", label),
    }
}

fn program_label(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// 检查可执行文件是否可用（`<program> <arg>` 能正常退出）
pub async fn probe_executable(program: &Path, arg: &str) -> bool {
    let status = Command::new(program)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    matches!(
        tokio::time::timeout(Duration::from_secs(5), status).await,
        Ok(Ok(status)) if status.success()
    )
}

#[cfg(unix)]
fn send_signal(handle: &TransferHandle, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let pid = handle.pid.ok_or_else(|| {
        DownloadError::InvalidState(format!("任务 {} 没有可控制的工作进程", handle.task_id))
    })?;
    kill(Pid::from_raw(pid as i32), signal).map_err(|e| {
        DownloadError::InvalidState(format!("向进程 {} 发送 {} 失败: {}", pid, signal, e))
    })
}

/// 挂起工作进程。尽力而为：已缓冲的数据仍可能写入磁盘。
#[cfg(unix)]
pub fn suspend(handle: &TransferHandle) -> Result<()> {
    send_signal(handle, nix::sys::signal::Signal::SIGSTOP)
}

#[cfg(unix)]
pub fn resume(handle: &TransferHandle) -> Result<()> {
    send_signal(handle, nix::sys::signal::Signal::SIGCONT)
}

#[cfg(not(unix))]
pub fn suspend(handle: &TransferHandle) -> Result<()> {
    Err(DownloadError::unsupported(handle.kind, "pause"))
}

#[cfg(not(unix))]
pub fn resume(handle: &TransferHandle) -> Result<()> {
    Err(DownloadError::unsupported(handle.kind, "resume"))
}
