//! ErrorReporter port - 失敗したタスクと壊れたレコードの報告先
//!
//! ログは常に呼び出し側が出す
//! reporter はそれを運用者が見る場所（エラートラッカーなど）へ転送する

use crate::error::TaskError;

pub trait ErrorReporter: Send + Sync {
    fn capture(&self, task_name: &str, error: &TaskError);
}

/// ログに出すだけの reporter
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn capture(&self, task_name: &str, error: &TaskError) {
        tracing::error!(task = task_name, error = %error, "captured task failure");
    }
}
