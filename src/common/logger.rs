use colored::*;

use crate::downloader::{DownloadError, Task, TaskState};

const RULE_WIDTH: usize = 48;

/// 命令行单次下载的彩色输出，和 tracing 日志分开（日志写 stderr）
pub struct PrettyLogger;

impl PrettyLogger {
    /// 任务创建后的标题行
    pub fn task_created(id: &str, source: &str) {
        Self::rule("mediadl");
        println!("{} {}", "⬇".blue().bold(), id.bold());
        println!("  来源: {}", source.bright_black());
    }

    pub fn start_rejected(err: &DownloadError) {
        println!("{} 无法开始下载 [{}]: {}", "✗".red().bold(), err.code(), err);
    }

    pub fn interrupted() {
        println!("{} 收到中断信号，正在取消下载...", "⚠".yellow().bold());
    }

    /// 记录已经被取消删除
    pub fn canceled(id: &str) {
        println!("{} 下载已取消: {}", "⚠".yellow().bold(), id);
    }

    /// 任务结束时的总结
    pub fn task_finished(task: &Task) {
        println!("{}", "─".repeat(RULE_WIDTH + 2).bright_black());
        let state = match task.state {
            TaskState::Completed => task.state.as_str().green().bold(),
            TaskState::Error | TaskState::Canceled => task.state.as_str().red().bold(),
            _ => task.state.as_str().yellow().bold(),
        };
        println!("{} {} [{}]", "🎬".magenta().bold(), task.display_name.bold(), state);
        println!("  ID: {}", task.id.bright_black());
        println!("  类型: {}", task.kind.to_string().cyan());
        println!("  📁 保存位置: {}", task.save_path.display());
        match &task.error_detail {
            Some(detail) => println!("  {} {}", "错误:".red().bold(), detail.red()),
            None if task.state == TaskState::Completed => {
                println!("{} 下载完成！", "✓".green().bold())
            }
            None => {}
        }
    }

    fn rule(text: &str) {
        let width = text.chars().count();
        let padding = RULE_WIDTH.saturating_sub(width) / 2;
        let rest = RULE_WIDTH.saturating_sub(width + padding);
        println!(
            "{} {} {}",
            "─".repeat(padding).bright_black(),
            text.bold(),
            "─".repeat(rest).bright_black()
        );
    }
}
