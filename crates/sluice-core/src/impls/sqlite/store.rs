//! SQLite バックエンドのタスク / 統計ストア

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::timed::{blocking, TimedConnection};
use crate::domain::{NewTask, StatBucket, StatRecord, StatSummary, TaskId, TaskRecord};
use crate::error::StoreError;
use crate::ports::{Clock, StatStore, SystemClock, TaskStore};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_name TEXT NOT NULL,
        args TEXT NOT NULL,
        kwargs TEXT NOT NULL,
        created_at INTEGER NOT NULL          -- unix millis
    );

    CREATE TABLE IF NOT EXISTS stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,          -- unix seconds, start of the minute
        task_name TEXT NOT NULL,
        task_count INTEGER,                  -- NULL: backlog count was interrupted
        done INTEGER NOT NULL,
        errors INTEGER NOT NULL,
        wall_time REAL NOT NULL,
        wait_time REAL NOT NULL,
        write_time REAL NOT NULL,
        max_wall_time REAL NOT NULL,
        max_wait_time REAL NOT NULL,
        max_write_time REAL NOT NULL
    );

    CREATE INDEX IF NOT EXISTS stats_timestamp ON stats (timestamp);
";

/// タスクキューと統計テーブルを持つ 1 つの DB
pub struct SqliteStore {
    conn: Arc<TimedConnection>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, query_timeout: Option<Duration>) -> Result<Self, StoreError> {
        Self::from_connection(TimedConnection::open(path, query_timeout)?)
    }

    pub fn open_in_memory(query_timeout: Option<Duration>) -> Result<Self, StoreError> {
        Self::from_connection(TimedConnection::open_in_memory(query_timeout)?)
    }

    fn from_connection(conn: TimedConnection) -> Result<Self, StoreError> {
        conn.migrate(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(conn),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn connection(&self) -> &Arc<TimedConnection> {
        &self.conn
    }
}

fn millis_to_datetime(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(4, ms))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: TaskId::new(row.get::<_, i64>(0)? as u64),
        task_name: row.get(1)?,
        args: row.get(2)?,
        kwargs: row.get(3)?,
        created_at: millis_to_datetime(row.get(4)?)?,
    })
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn push(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let created_at = self.clock.now().timestamp_millis();
        blocking(&self.conn, move |conn| {
            conn.run(|c| {
                c.execute(
                    "INSERT INTO tasks (task_name, args, kwargs, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        task.task_name,
                        task.args.args_json(),
                        task.args.kwargs_json(),
                        created_at
                    ],
                )?;
                Ok(TaskId::new(c.last_insert_rowid() as u64))
            })
        })
        .await
    }

    async fn peek(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        blocking(&self.conn, move |conn| {
            conn.run(|c| {
                let mut stmt = c.prepare_cached(
                    "SELECT id, task_name, args, kwargs, created_at FROM tasks ORDER BY id LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], task_from_row)?;
                rows.collect()
            })
        })
        .await
    }

    async fn remove(&self, id: TaskId) -> Result<bool, StoreError> {
        blocking(&self.conn, move |conn| {
            conn.run(|c| {
                let n = c.execute("DELETE FROM tasks WHERE id = ?1", [id.get() as i64])?;
                Ok(n == 1)
            })
        })
        .await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        blocking(&self.conn, |conn| {
            conn.run(|c| c.query_row("SELECT count(*) FROM tasks", [], |row| row.get::<_, i64>(0)))
                .map(|n| n as u64)
        })
        .await
    }

    async fn count_by_name(&self, budget: Duration) -> Result<HashMap<String, u64>, StoreError> {
        blocking(&self.conn, move |conn| {
            conn.with_limit(Some(budget), |c| {
                let mut stmt =
                    c.prepare_cached("SELECT task_name, count(*) FROM tasks GROUP BY task_name")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?;
                rows.collect()
            })
        })
        .await
    }
}

#[async_trait]
impl StatStore for SqliteStore {
    async fn write(&self, records: Vec<StatRecord>) -> Result<(), StoreError> {
        blocking(&self.conn, move |conn| {
            conn.run(|c| {
                let tx = c.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO stats (timestamp, task_name, task_count, done, errors,
                             wall_time, wait_time, write_time,
                             max_wall_time, max_wait_time, max_write_time)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    )?;
                    for r in &records {
                        let b = &r.bucket;
                        stmt.execute(params![
                            r.timestamp.timestamp(),
                            r.task_name,
                            r.task_count.map(|n| n as i64),
                            b.done as i64,
                            b.errors as i64,
                            b.wall_time,
                            b.wait_time,
                            b.write_time,
                            b.max_wall_time,
                            b.max_wait_time,
                            b.max_write_time,
                        ])?;
                    }
                }
                tx.commit()
            })
        })
        .await
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        blocking(&self.conn, move |conn| {
            conn.run(|c| c.execute("DELETE FROM stats WHERE timestamp < ?1", [cutoff.timestamp()]))
                .map(|n| n as u64)
        })
        .await
    }

    async fn summary(&self, since: DateTime<Utc>) -> Result<Vec<StatSummary>, StoreError> {
        blocking(&self.conn, move |conn| {
            conn.run(|c| {
                let mut stmt = c.prepare_cached(
                    "SELECT task_name, sum(done), sum(errors),
                            sum(wall_time), sum(wait_time), sum(write_time),
                            max(max_wall_time), max(max_wait_time), max(max_write_time),
                            max(task_count)
                     FROM stats WHERE timestamp >= ?1
                     GROUP BY task_name ORDER BY task_name",
                )?;
                let rows = stmt.query_map([since.timestamp()], |row| {
                    Ok(StatSummary {
                        task_name: row.get(0)?,
                        done: row.get::<_, i64>(1)? as u64,
                        errors: row.get::<_, i64>(2)? as u64,
                        wall_time: row.get(3)?,
                        wait_time: row.get(4)?,
                        write_time: row.get(5)?,
                        max_wall_time: row.get(6)?,
                        max_wait_time: row.get(7)?,
                        max_write_time: row.get(8)?,
                        max_task_count: row.get::<_, Option<i64>>(9)?.map(|n| n as u64),
                    })
                })?;
                rows.collect()
            })
        })
        .await
    }
}

impl SqliteStore {
    /// 保存済みの全バケット（古い順）、調査・テスト用
    pub async fn stat_records(&self) -> Result<Vec<StatRecord>, StoreError> {
        blocking(&self.conn, |conn| {
            conn.run(|c| {
                let mut stmt = c.prepare_cached(
                    "SELECT timestamp, task_name, task_count, done, errors,
                            wall_time, wait_time, write_time,
                            max_wall_time, max_wait_time, max_write_time
                     FROM stats ORDER BY timestamp, id",
                )?;
                let rows = stmt.query_map([], |row| {
                    let ts: i64 = row.get(0)?;
                    Ok(StatRecord {
                        timestamp: millis_to_datetime(ts.saturating_mul(1000))?,
                        task_name: row.get(1)?,
                        task_count: row.get::<_, Option<i64>>(2)?.map(|n| n as u64),
                        bucket: StatBucket {
                            done: row.get::<_, i64>(3)? as u64,
                            errors: row.get::<_, i64>(4)? as u64,
                            wall_time: row.get(5)?,
                            wait_time: row.get(6)?,
                            write_time: row.get(7)?,
                            max_wall_time: row.get(8)?,
                            max_wait_time: row.get(9)?,
                            max_write_time: row.get(10)?,
                        },
                    })
                })?;
                rows.collect()
            })
        })
        .await
    }

    /// キュー上で最も古いレコード
    pub async fn first(&self) -> Result<Option<TaskRecord>, StoreError> {
        blocking(&self.conn, |conn| {
            conn.run(|c| {
                c.query_row(
                    "SELECT id, task_name, args, kwargs, created_at FROM tasks ORDER BY id LIMIT 1",
                    [],
                    task_from_row,
                )
                .optional()
            })
        })
        .await
    }
}
