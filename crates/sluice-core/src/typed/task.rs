//! Task trait - 型付き Task の定義
//!
//! 型付きタスクは task name に結びついた serde ペイロード
//! 保存形式は他のタスクと同じ args / kwargs
//! - 構造体 → キーワード引数
//! - タプル構造体・シーケンス → 位置引数

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::TaskArgs;

/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct VacuumTagValues {
///     project: u64,
/// }
///
/// impl Task for VacuumTagValues {
///     const TYPE: &'static str = "tags.vacuum_tag_values";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task name（`module[s].function`）
    const TYPE: &'static str;

    fn to_args(&self) -> Result<TaskArgs, serde_json::Error> {
        Ok(match serde_json::to_value(self)? {
            Value::Object(kwargs) => TaskArgs::keyword(kwargs),
            Value::Array(args) => TaskArgs::positional(args),
            Value::Null => TaskArgs::default(),
            scalar => TaskArgs::positional(vec![scalar]),
        })
    }

    fn from_args(args: &TaskArgs) -> Result<Self, crate::error::TaskError> {
        args.decode()
    }
}
