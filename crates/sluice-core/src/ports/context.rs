//! TaskContext port - enqueue と実行のフック
//!
//! - `add_task_kwargs`: enqueue 側で呼ばれ、結果は全タスクの kwargs にマージ（同名キーは上書き）
//! - `wrap`: ワーカー内で呼ばれ、kwargs が運んだもの（テナント、リクエスト ID など）を
//!   タスクの future の周りで復元できる

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use crate::domain::TaskArgs;
use crate::error::TaskError;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

pub trait TaskContext: Send + Sync {
    fn add_task_kwargs(&self) -> Map<String, Value> {
        Map::new()
    }

    fn wrap(&self, _task_name: &str, _args: &TaskArgs, task: TaskFuture) -> TaskFuture {
        task
    }
}

/// フックなし
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContext;

impl TaskContext for NoContext {}
