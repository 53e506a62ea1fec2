//! 命令行进度条：把事件流渲染成 indicatif 进度条

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

use crate::downloader::{DownloadEvent, Task, TaskId, TaskState};

// 进度条按千分比推进，保留一位小数
const BAR_SCALE: f64 = 10.0;

pub struct ProgressView {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
}

impl ProgressView {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {prefix} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
    }

    fn bar(&mut self, id: &str) -> &ProgressBar {
        self.bars.entry(id.to_string()).or_insert_with(|| {
            let pb = self.multi.add(ProgressBar::new((100.0 * BAR_SCALE) as u64));
            pb.set_style(Self::style());
            pb
        })
    }

    /// 渲染一条事件
    pub fn render(&mut self, event: &DownloadEvent) {
        match event {
            DownloadEvent::Progress { task } => self.render_task(task),
            DownloadEvent::Canceled { task_id } => {
                if let Some(pb) = self.bars.remove(task_id) {
                    pb.abandon_with_message("已取消");
                }
            }
            // 失败信息已包含在对应的 progress 快照中
            DownloadEvent::Error { .. } => {}
        }
    }

    fn render_task(&mut self, task: &Task) {
        let pb = self.bar(&task.id).clone();
        pb.set_prefix(task.display_name.clone());
        pb.set_position((task.progress_percent * BAR_SCALE) as u64);
        match task.state {
            TaskState::Queued => pb.set_message("等待中..."),
            TaskState::Downloading => pb.set_message(format!(
                "{:.1}% {} 剩余 {}",
                task.progress_percent, task.rate_label, task.eta_label
            )),
            TaskState::Paused => pb.set_message(format!("{:.1}% 已暂停", task.progress_percent)),
            TaskState::Completed => pb.finish_with_message("下载完成"),
            TaskState::Error => pb.abandon_with_message(format!(
                "失败: {}",
                task.error_detail.as_deref().unwrap_or("未知错误")
            )),
            TaskState::Canceled => pb.abandon_with_message("已取消"),
        }
    }
}

impl Default for ProgressView {
    fn default() -> Self {
        Self::new()
    }
}
