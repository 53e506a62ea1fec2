use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{DownloadError, Result};
use super::task::{Task, TaskId};

struct Record {
    seq: u64, // 插入顺序
    task: Task,
}

/// 任务记录的唯一持有者。
///
/// 同一个 id 上的修改通过 DashMap 分片锁串行化，`update` 是一次完整的
/// 读-改-写；不同 id 之间不存在全局锁。
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Record>,
    next_seq: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, task: Task) -> Result<TaskId> {
        match self.tasks.entry(task.id.clone()) {
            Entry::Occupied(entry) => Err(DownloadError::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => {
                let id = entry.key().clone();
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                entry.insert(Record { seq, task });
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).map(|record| record.task.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// 按插入顺序返回所有任务的快照
    pub fn list(&self) -> Vec<Task> {
        let mut records: Vec<(u64, Task)> = self
            .tasks
            .iter()
            .map(|record| (record.seq, record.task.clone()))
            .collect();
        records.sort_by_key(|(seq, _)| *seq);
        records.into_iter().map(|(_, task)| task).collect()
    }

    /// 在持有该 id 锁的情况下执行 `mutator`；id 不存在时静默忽略并返回 None。
    ///
    /// 传输事件可能与取消并发到达，因此未知 id 不视为错误。
    pub fn update<R>(&self, id: &str, mutator: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.tasks
            .get_mut(id)
            .map(|mut record| mutator(&mut record.task))
    }

    pub fn remove(&self, id: &str) -> Option<Task> {
        self.tasks.remove(id).map(|(_, record)| record.task)
    }

    /// 删除所有满足条件的记录，返回被删除的 id（按插入顺序）
    pub fn remove_where(&self, predicate: impl Fn(&Task) -> bool) -> Vec<TaskId> {
        let mut removed = Vec::new();
        self.tasks.retain(|id, record| {
            if predicate(&record.task) {
                removed.push((record.seq, id.clone()));
                false
            } else {
                true
            }
        });
        removed.sort_by_key(|(seq, _)| *seq);
        removed.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
