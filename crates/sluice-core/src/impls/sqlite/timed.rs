//! TimedConnection - 文ごとのランタイム上限つき SQLite 接続
//!
//! - ガード付きの呼び出しの間だけ progress handler を入れ、予算を使い切ったら文を中断する
//! - SQLite は `SQLITE_INTERRUPT` で文を失敗させ、それが `StoreError::QueryTimeout` になる
//! - 暴走クエリを止めるためのもので、キャンセル機構ではない

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rusqlite::{Connection, ErrorCode};

use crate::error::StoreError;

/// 時計を確認する間隔（VM 命令数）
const PROGRESS_OPS: i32 = 10_000;

pub struct TimedConnection {
    conn: Mutex<Connection>,
    limit: Option<Duration>,
}

impl TimedConnection {
    pub fn open(path: impl AsRef<Path>, limit: Option<Duration>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self::wrap(conn, limit))
    }

    pub fn open_in_memory(limit: Option<Duration>) -> Result<Self, StoreError> {
        Ok(Self::wrap(Connection::open_in_memory()?, limit))
    }

    fn wrap(conn: Connection, limit: Option<Duration>) -> Self {
        Self {
            conn: Mutex::new(conn),
            limit,
        }
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    /// スキーマ変更はランタイムガードなしで実行
    pub fn migrate(&self, sql: &str) -> Result<(), StoreError> {
        self.with_limit(None, |conn| conn.execute_batch(sql))
    }

    /// 接続のデフォルト上限で `f` を実行
    pub fn run<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        self.with_limit(self.limit, f)
    }

    pub fn with_limit<T>(
        &self,
        limit: Option<Duration>,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(budget) = limit else {
            return Ok(f(&mut conn)?);
        };

        let started = Instant::now();
        conn.progress_handler(PROGRESS_OPS, Some(move || started.elapsed() > budget));
        let result = f(&mut conn);
        conn.progress_handler(0, None::<fn() -> bool>);

        result.map_err(|e| {
            if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
                StoreError::QueryTimeout(budget)
            } else {
                StoreError::Sqlite(e)
            }
        })
    }
}

/// blocking プールで接続に対してクロージャを実行
pub(crate) async fn blocking<T, F>(conn: &Arc<TimedConnection>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&TimedConnection) -> Result<T, StoreError> + Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || f(&conn))
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite worker: {e}")))?
}
