//! Stats - タスク別カウンタ、1 分ごとに flush
//!
//! - 完了はロックの下でメモリに溜める
//! - 新しい分に入って最初の完了が前のバケットを閉じる
//! - 閉じたバケットは覆う分の開始時刻とタスク別バックログを付けて `StatStore` に書く
//! - 統計は参考情報、ここでは呼び出し側を決して失敗させない

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::domain::{StatBucket, StatRecord};
use crate::error::{StatsError, StoreError};
use crate::ports::{Clock, StatStore, TaskStore};

/// flush 時のバックログ件数取得のランタイム予算
pub const TASK_COUNT_BUDGET: Duration = Duration::from_millis(100);

struct StatsState {
    /// メモリ上のバケットが属する分の開始時刻
    last_write_at: DateTime<Utc>,
    buckets: HashMap<String, StatBucket>,
}

pub struct Stats {
    store: Arc<dyn StatStore>,
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    retention_minutes: u64,
    state: Mutex<StatsState>,
}

fn minute_of(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(TimeDelta::minutes(1)).unwrap_or(t)
}

impl Stats {
    pub fn new(
        store: Arc<dyn StatStore>,
        tasks: Arc<dyn TaskStore>,
        retention_minutes: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let last_write_at = minute_of(clock.now() - TimeDelta::minutes(1));
        Self {
            store,
            tasks,
            clock,
            retention_minutes,
            state: Mutex::new(StatsState {
                last_write_at,
                buckets: HashMap::new(),
            }),
        }
    }

    /// 完了したタスクを 1 件記録、新しい分に入っていれば前の分を flush
    /// 失敗しない、flush の問題はログに出して捨てる
    pub async fn record_completion(
        &self,
        task_name: &str,
        wall_time: Duration,
        wait_time: Duration,
        write_time: Duration,
        errored: bool,
    ) {
        let closed = {
            let mut state = self.lock();
            // バケットの分が逆行しないよう、時計はロックの下で読む
            let minute = minute_of(self.clock.now());
            let closed = if minute > state.last_write_at {
                let at = mem::replace(&mut state.last_write_at, minute);
                Some((at, minute, mem::take(&mut state.buckets)))
            } else {
                None
            };
            state
                .buckets
                .entry(task_name.to_string())
                .or_default()
                .record(wall_time, wait_time, write_time, errored);
            closed
        };

        if let Some((at, now, buckets)) = closed {
            if let Err(e) = self.flush(at, now, buckets).await {
                warn!(error = %e, "failed to write task stats");
            }
        }
    }

    /// 分 `at` のバケットを書き、分 `now` から見て保持期間を外れたものを削除
    async fn flush(
        &self,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        buckets: HashMap<String, StatBucket>,
    ) -> Result<(), StatsError> {
        if self.retention_minutes == 0 || buckets.is_empty() {
            return Ok(());
        }
        let started = Instant::now();

        let counts = match self.tasks.count_by_name(TASK_COUNT_BUDGET).await {
            Ok(counts) => Some(counts),
            Err(StoreError::QueryTimeout(budget)) => {
                debug!(?budget, "backlog count interrupted, recording it as unknown");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let records = buckets
            .into_iter()
            .map(|(task_name, bucket)| StatRecord {
                timestamp: at,
                task_count: counts
                    .as_ref()
                    .map(|c| c.get(&task_name).copied().unwrap_or(0)),
                task_name,
                bucket,
            })
            .collect();
        self.store.write(records).await?;

        let cutoff = i64::try_from(self.retention_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .and_then(|retention| now.checked_sub_signed(retention));
        let purged = match cutoff {
            Some(cutoff) => self.store.purge_before(cutoff).await?,
            None => 0,
        };

        debug!(
            bucket = %at,
            purged,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "task stats written"
        );
        Ok(())
    }

    /// まだ flush されていない現在の分のバケット
    pub fn pending(&self) -> HashMap<String, StatBucket> {
        self.lock().buckets.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
