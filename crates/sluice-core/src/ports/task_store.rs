//! TaskStore port - 保留タスクの永続 FIFO
//!
//! 何がキューにあるかの唯一の情報源はストア
//! Foreman は `peek` でまとめて読み、実行前に `remove` で 1 件ずつ確保する
//! そのため `remove` はアトミックであること：同じ id を 2 者が remove したら `true` は片方だけ

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{NewTask, TaskId, TaskRecord};
use crate::error::StoreError;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// タスクを追加（id は挿入順に増加）
    async fn push(&self, task: NewTask) -> Result<TaskId, StoreError>;

    /// 古い順に最大 `limit` 件、何も削除しない
    async fn peek(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError>;

    /// 1 件削除、既に無ければ `false`
    async fn remove(&self, id: TaskId) -> Result<bool, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// task name ごとのバックログ件数
    /// DB 実装は `budget` を超えたらクエリを中断し `StoreError::QueryTimeout` を返す
    async fn count_by_name(&self, budget: Duration) -> Result<HashMap<String, u64>, StoreError>;
}
