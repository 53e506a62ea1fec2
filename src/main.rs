use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, info, warn};

use media_downloader::common::logger::PrettyLogger;
use media_downloader::common::models::{DownloadRequest, TaskKind};
use media_downloader::common::progress_view::ProgressView;
use media_downloader::config::{JsonSettingsStore, Settings, SettingsStore, default_settings_path};
use media_downloader::control::ControlServer;
use media_downloader::downloader::transport::process::probe_executable;
use media_downloader::downloader::{DownloadEvent, DownloadOrchestrator, TaskState};

mod cli;

/// 检查外部程序是否可用，缺失时只警告
async fn check_tools(settings: &Settings) {
    for (label, path) in [
        ("yt-dlp", &settings.yt_dlp_path),
        ("aria2c", &settings.aria2c_path),
    ] {
        if probe_executable(path, "--version").await {
            debug!("{} 可用: {}", label, path.display());
        } else {
            warn!("未找到 {} ({})，对应类型的下载将会失败", label, path.display());
        }
    }
}

fn build_request(args: &cli::Cli, url: String) -> DownloadRequest {
    let kind = args.kind.unwrap_or_else(|| TaskKind::detect(&url));
    let mut request = DownloadRequest::new(kind, url).audio_only(args.audio_only);
    if let Some(name) = &args.name {
        request = request.with_name(name.clone());
    }
    if let Some(dir) = &args.output_dir {
        request = request.with_destination(dir.clone());
    }
    if let Some(quality) = args.quality {
        request = request.with_quality(quality);
    }
    request
}

/// 单次下载：显示进度，Ctrl-C 取消
async fn download_once(orchestrator: &DownloadOrchestrator, request: DownloadRequest) -> anyhow::Result<()> {
    // 先订阅，保证能收到 queued 事件
    let mut subscription = orchestrator.subscribe();
    let source = request.source().unwrap_or_default().to_string();
    let id = orchestrator.start(request).map_err(|e| {
        PrettyLogger::start_rejected(&e);
        e
    })?;
    PrettyLogger::task_created(&id, &source);

    let mut view = ProgressView::new();
    let mut interrupted = false;
    loop {
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                PrettyLogger::interrupted();
                orchestrator.cancel(&id).await;
            }
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if event.task_id() != id {
                    continue;
                }
                view.render(&event);
                match &event {
                    DownloadEvent::Canceled { .. } => break,
                    DownloadEvent::Progress { task } if task.state.is_terminal() => break,
                    _ => {}
                }
            }
        }
    }

    let result = match orchestrator.get(&id) {
        Some(task) => {
            PrettyLogger::task_finished(&task);
            match task.state {
                TaskState::Completed => Ok(()),
                _ => Err(anyhow::anyhow!(
                    "下载失败: {}",
                    task.error_detail.unwrap_or_else(|| task.state.as_str().to_string())
                )),
            }
        }
        None => {
            PrettyLogger::canceled(&id);
            Ok(())
        }
    };

    orchestrator.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 解析命令行参数
    let args = cli::Cli::parse();

    // 初始化日志，标准输出留给进度条和控制协议
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let store = JsonSettingsStore::load(&settings_path)
        .with_context(|| format!("加载配置失败: {}", settings_path.display()))?;
    info!("配置文件: {}", settings_path.display());
    check_tools(&store.settings()).await;

    let orchestrator = DownloadOrchestrator::from_settings(Arc::new(store));

    if args.serve {
        return ControlServer::new(orchestrator).run_stdio().await;
    }

    let url = args
        .url
        .clone()
        .context("需要 --url 或 --serve")?;
    let request = build_request(&args, url);
    download_once(&orchestrator, request).await
}
