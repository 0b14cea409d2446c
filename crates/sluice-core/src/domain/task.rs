//! キュー上のタスクレコードと引数

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::TaskId;
use crate::error::TaskError;

/// タスクの位置引数とキーワード引数
///
/// どちらも JSON シリアライズ可能であること（ストアが永続化するのはそれ）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn keyword(kwargs: Map<String, Value>) -> Self {
        Self {
            args: Vec::new(),
            kwargs,
        }
    }

    /// ストアが持つ `args` / `kwargs` の JSON テキストをパース
    pub fn parse(args: &str, kwargs: &str) -> Result<Self, TaskError> {
        let args: Vec<Value> = serde_json::from_str(args)
            .map_err(|e| TaskError::InvalidArguments(format!("args: {e}")))?;
        let kwargs: Map<String, Value> = serde_json::from_str(kwargs)
            .map_err(|e| TaskError::InvalidArguments(format!("kwargs: {e}")))?;
        Ok(Self { args, kwargs })
    }

    /// 型付きペイロードへデコード
    ///
    /// - キーワード引数は構造体のフィールドへ
    /// - 位置引数は宣言順のフィールドへ
    /// - 両方あるときは位置引数がペイロードで、kwargs はそれを足した `TaskContext` のもの
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        let value = if self.args.is_empty() {
            Value::Object(self.kwargs.clone())
        } else {
            Value::Array(self.args.clone())
        };
        serde_json::from_value(value).map_err(|e| TaskError::InvalidArguments(e.to_string()))
    }

    pub fn args_json(&self) -> String {
        Value::Array(self.args.clone()).to_string()
    }

    pub fn kwargs_json(&self) -> String {
        Value::Object(self.kwargs.clone()).to_string()
    }
}

/// enqueue 側がストアに渡すタスク
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_name: String,
    pub args: TaskArgs,
}

impl NewTask {
    pub fn new(task_name: impl Into<String>, args: TaskArgs) -> Self {
        Self {
            task_name: task_name.into(),
            args,
        }
    }
}

/// ストア上のタスク
///
/// `args` / `kwargs` はディスパッチまで生の JSON テキストのまま
/// パースはディスパッチの一部なので、壊れたレコードはバッチ読み込み時ではなく
/// そこで検出（してスキップ）される
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_name: String,
    pub args: String,
    pub kwargs: String,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn parse_args(&self) -> Result<TaskArgs, TaskError> {
        TaskArgs::parse(&self.args, &self.kwargs)
    }
}
