//! SqliteEventStore - SQLite のイベントストア
//!
//! - 削除の探索は `events` テーブルへのグループ化集計クエリ
//! - 削除は `id IN (SELECT ... LIMIT n)` 経由、1 文で 1 バッチより多くは消さない

use std::path::Path;
use std::time::Duration;

use rusqlite::params;

use super::store::EventStore;
use crate::domain::{EventId, ProjectId};
use crate::error::StoreError;
use crate::impls::TimedConnection;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL,
        epoch INTEGER NOT NULL,
        irrelevance INTEGER NOT NULL,
        never_evict INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS events_retention
        ON events (project_id, never_evict, irrelevance, epoch);
";

pub struct SqliteEventStore {
    conn: TimedConnection,
}

fn project_key(project: ProjectId) -> i64 {
    project.get() as i64
}

fn count_to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

impl SqliteEventStore {
    pub fn open(path: impl AsRef<Path>, query_timeout: Option<Duration>) -> Result<Self, StoreError> {
        Self::from_connection(TimedConnection::open(path, query_timeout)?)
    }

    pub fn open_in_memory(query_timeout: Option<Duration>) -> Result<Self, StoreError> {
        Self::from_connection(TimedConnection::open_in_memory(query_timeout)?)
    }

    fn from_connection(conn: TimedConnection) -> Result<Self, StoreError> {
        conn.migrate(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn insert(
        &self,
        project: ProjectId,
        epoch: i64,
        irrelevance: u32,
        never_evict: bool,
    ) -> Result<EventId, StoreError> {
        self.conn.run(|c| {
            c.execute(
                "INSERT INTO events (project_id, epoch, irrelevance, never_evict) VALUES (?1, ?2, ?3, ?4)",
                params![project_key(project), epoch, irrelevance, never_evict],
            )?;
            Ok(EventId::new(c.last_insert_rowid() as u64))
        })
    }

    /// 同じイベントを `count` 件、1 トランザクションで挿入
    pub fn insert_many(
        &self,
        project: ProjectId,
        epoch: i64,
        irrelevance: u32,
        count: u64,
        never_evict: bool,
    ) -> Result<(), StoreError> {
        self.conn.run(|c| {
            let tx = c.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO events (project_id, epoch, irrelevance, never_evict) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for _ in 0..count {
                    stmt.execute(params![project_key(project), epoch, irrelevance, never_evict])?;
                }
            }
            tx.commit()
        })
    }

    pub fn exists(&self, event: EventId) -> Result<bool, StoreError> {
        self.conn.run(|c| {
            c.query_row(
                "SELECT EXISTS (SELECT 1 FROM events WHERE id = ?1)",
                [event.get() as i64],
                |row| row.get(0),
            )
        })
    }
}

impl EventStore for SqliteEventStore {
    fn stored_event_count(&self, project: ProjectId) -> Result<u64, StoreError> {
        let n: i64 = self.conn.run(|c| {
            c.query_row(
                "SELECT COUNT(*) FROM events WHERE project_id = ?1",
                [project_key(project)],
                |row| row.get(0),
            )
        })?;
        Ok(count_to_u64(n))
    }

    fn max_irrelevance_per_epoch(&self, project: ProjectId) -> Result<Vec<(i64, u32)>, StoreError> {
        self.conn.run(|c| {
            let mut stmt = c.prepare_cached(
                "SELECT epoch, MAX(irrelevance) FROM events \
                 WHERE project_id = ?1 AND never_evict = 0 \
                 GROUP BY epoch ORDER BY epoch",
            )?;
            let rows = stmt.query_map([project_key(project)], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }

    fn count_events_at_or_before(
        &self,
        project: ProjectId,
        epoch: i64,
        max_item_irrelevance: u32,
    ) -> Result<u64, StoreError> {
        let n: i64 = self.conn.run(|c| {
            c.query_row(
                "SELECT COUNT(*) FROM events \
                 WHERE project_id = ?1 AND never_evict = 0 AND epoch <= ?2 AND irrelevance > ?3",
                params![project_key(project), epoch, max_item_irrelevance],
                |row| row.get(0),
            )
        })?;
        Ok(count_to_u64(n))
    }

    fn delete_events_at_or_before(
        &self,
        project: ProjectId,
        epoch: i64,
        max_item_irrelevance: u32,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let deleted = self.conn.run(|c| {
            c.execute(
                "DELETE FROM events WHERE id IN ( \
                     SELECT id FROM events \
                     WHERE project_id = ?1 AND never_evict = 0 AND epoch <= ?2 AND irrelevance > ?3 \
                     ORDER BY id LIMIT ?4)",
                params![project_key(project), epoch, max_item_irrelevance, limit],
            )
        })?;
        Ok(deleted as u64)
    }
}
