use clap::Parser;
use std::path::PathBuf;

use media_downloader::common::models::{TaskKind, VideoQuality};

/// 磁力链接 / 在线视频下载器
#[derive(Parser, Debug)]
#[command(name = "mediadl")]
#[command(version = "1.0")]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "一个简单的磁力链接和在线视频下载工具", long_about = None)]
pub struct Cli {
    /// 下载源 (磁力链接、种子文件或视频页面链接)
    #[arg(long, value_name = "URL")]
    #[arg(required_unless_present = "serve")]
    #[arg(value_hint = clap::ValueHint::Url)]
    pub url: Option<String>,

    /// 下载类型 (省略时根据链接判断)
    #[arg(long, value_name = "KIND")]
    #[arg(help = "下载类型: swarm (磁力/种子), extraction (视频页面)")]
    pub kind: Option<TaskKind>,

    /// 任务名称
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// 保存目录 (默认使用配置中的下载目录)
    #[arg(long, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,

    /// 视频质量 (仅视频页面)
    #[arg(long, value_name = "QUALITY")]
    #[arg(help = "视频质量: 360p, 480p, 720p, 1080p, 1440p, 4k")]
    pub quality: Option<VideoQuality>,

    /// 只下载音频 (仅视频页面)
    #[arg(long)]
    pub audio_only: bool,

    /// 配置文件
    #[arg(long, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub settings: Option<PathBuf>,

    /// 在标准输入输出上以 JSON 行提供控制接口
    #[arg(long)]
    #[arg(conflicts_with = "url")]
    pub serve: bool,

    /// 输出调试日志
    #[arg(long, short)]
    pub verbose: bool,
}
