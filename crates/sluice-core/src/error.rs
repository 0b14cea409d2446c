//! クレート共通のエラー型
//!
//! 呼び出し側が扱えるものだけで match できるよう、関心ごとに enum を分ける
//! - `RegistryError`: task name を handler に解決できない
//! - `TaskError`: タスク本体が報告するもの（エラーも panic も）
//! - `StoreError`: 永続化の失敗（クエリのランタイムガードを含む）
//! - `StatsError`: 統計の集計・flush の失敗（`Stats` の外には出ない）
//! - `RetentionError`: 削除の失敗（quota を満たせない致命的ケースを含む）
//! - `ForemanError` / `EnqueueError`: キューの両端

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::ProjectId;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler for task '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("task name \"{0}\" is not in the format \"module[s].function\"")]
    MalformedName(String),

    #[error("task '{0}' not found in registry")]
    TaskNotFound(String),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    /// レコードが解決できない task name を持っていた
    #[error(transparent)]
    Unresolvable(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// 文がランタイムの予算を超えて中断された
    #[error("query interrupted after exceeding its {0:?} runtime budget")]
    QueryTimeout(Duration),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::QueryTimeout(_))
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("writing stats failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RetentionError {
    /// 閾値探索の余地が尽きた：残りは削除できないので quota は満たせない
    #[error(
        "quota of {max_size} events for {project} is unsatisfiable: {remaining} events remain \
         after evicting everything evictable"
    )]
    QuotaInconsistency {
        project: ProjectId,
        max_size: u64,
        remaining: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 削除の失敗は、それを実行したタスクの失敗
impl From<RetentionError> for TaskError {
    fn from(e: RetentionError) -> Self {
        match e {
            RetentionError::Store(e) => TaskError::Store(e),
            other => TaskError::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("the foreman cannot run while task_always_eager is set; tasks already run inline")]
    EagerMode,

    #[error("another foreman is already running with pid {pid} (pid file {})", path.display())]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("pid file {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("wakeup channel: {0}")]
    Notifier(#[source] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("task arguments must be JSON-serializable: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// eager モードのみ：タスクを解決できなかった
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// eager モードのみ：タスク本体が呼び出し側で失敗した
    #[error(transparent)]
    Task(#[from] TaskError),
}
