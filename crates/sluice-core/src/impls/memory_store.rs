//! インメモリのタスク / 統計ストア
//!
//! テスト用、および DB なしで Foreman と producer を 1 プロセス内で動かす用

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{NewTask, StatRecord, StatSummary, TaskId, TaskRecord};
use crate::error::StoreError;
use crate::ports::{Clock, StatStore, SystemClock, TaskStore};

struct TaskState {
    next_id: u64,
    /// 挿入順、id は増加する
    tasks: VecDeque<TaskRecord>,
}

pub struct InMemoryTaskStore {
    state: Mutex<TaskState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(TaskState {
                next_id: 1,
                tasks: VecDeque::new(),
            }),
            clock,
        }
    }

    /// キュー上の task name のスナップショット（古い順）
    pub async fn queued_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.tasks.iter().map(|t| t.task_name.clone()).collect()
    }

    /// 引数エンコードを通さずレコードをそのまま挿入（テストで壊れた行を仕込む用）
    pub async fn push_raw(&self, task_name: &str, args: &str, kwargs: &str) -> TaskId {
        let mut state = self.state.lock().await;
        let id = TaskId::new(state.next_id);
        state.next_id += 1;
        state.tasks.push_back(TaskRecord {
            id,
            task_name: task_name.to_string(),
            args: args.to_string(),
            kwargs: kwargs.to_string(),
            created_at: self.clock.now(),
        });
        id
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn push(&self, task: NewTask) -> Result<TaskId, StoreError> {
        Ok(self
            .push_raw(&task.task_name, &task.args.args_json(), &task.args.kwargs_json())
            .await)
    }

    async fn peek(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.iter().take(limit).cloned().collect())
    }

    async fn remove(&self, id: TaskId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.tasks.iter().position(|t| t.id == id) {
            Some(pos) => {
                state.tasks.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.tasks.len() as u64)
    }

    async fn count_by_name(&self, _budget: Duration) -> Result<HashMap<String, u64>, StoreError> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for task in &state.tasks {
            *counts.entry(task.task_name.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[derive(Default)]
pub struct InMemoryStatStore {
    records: Mutex<Vec<StatRecord>>,
}

impl InMemoryStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<StatRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl StatStore for InMemoryStatStore {
    async fn write(&self, records: Vec<StatRecord>) -> Result<(), StoreError> {
        self.records.lock().await.extend(records);
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn summary(&self, since: DateTime<Utc>) -> Result<Vec<StatSummary>, StoreError> {
        let records = self.records.lock().await;
        let mut by_name: BTreeMap<&str, StatSummary> = BTreeMap::new();
        for record in records.iter().filter(|r| r.timestamp >= since) {
            by_name
                .entry(record.task_name.as_str())
                .or_insert_with(|| StatSummary {
                    task_name: record.task_name.clone(),
                    ..StatSummary::default()
                })
                .absorb(record);
        }
        Ok(by_name.into_values().collect())
    }
}
