//! タスク別・分単位の実行統計

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 1 つの分バケット内の、1 つの task name のカウンタ
///
/// 時間はすべて秒
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatBucket {
    pub done: u64,
    pub errors: u64,
    pub wall_time: f64,
    pub wait_time: f64,
    pub write_time: f64,
    pub max_wall_time: f64,
    pub max_wait_time: f64,
    pub max_write_time: f64,
}

impl StatBucket {
    pub fn record(&mut self, wall: Duration, wait: Duration, write: Duration, errored: bool) {
        let (wall, wait, write) = (wall.as_secs_f64(), wait.as_secs_f64(), write.as_secs_f64());
        self.done += 1;
        self.wall_time += wall;
        self.wait_time += wait;
        self.write_time += write;
        self.max_wall_time = self.max_wall_time.max(wall);
        self.max_wait_time = self.max_wait_time.max(wait);
        self.max_write_time = self.max_write_time.max(write);
        if errored {
            self.errors += 1;
        }
    }
}

/// `StatStore` に永続化されたバケット
///
/// - `timestamp`: バケットが覆う分の開始時刻
/// - `task_count`: flush 時点のこの task name のバックログ
/// - `None` はランタイムガードでカウントが打ち切られたことを示す（「0 件」とは別）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    pub timestamp: DateTime<Utc>,
    pub task_name: String,
    pub task_count: Option<u64>,
    #[serde(flatten)]
    pub bucket: StatBucket,
}

/// 時間窓内の 1 つの task name の全バケットの集計
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    pub task_name: String,
    pub done: u64,
    pub errors: u64,
    pub wall_time: f64,
    pub wait_time: f64,
    pub write_time: f64,
    pub max_wall_time: f64,
    pub max_wait_time: f64,
    pub max_write_time: f64,
    pub max_task_count: Option<u64>,
}

impl StatSummary {
    pub fn avg_wall_time(&self) -> Option<f64> {
        self.average(self.wall_time)
    }

    pub fn avg_wait_time(&self) -> Option<f64> {
        self.average(self.wait_time)
    }

    pub fn avg_write_time(&self) -> Option<f64> {
        self.average(self.write_time)
    }

    /// 指定した長さの窓での 1 秒あたり完了タスク数
    pub fn per_second(&self, window: Duration) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        self.done as f64 / window.as_secs_f64()
    }

    fn average(&self, total: f64) -> Option<f64> {
        (self.done > 0).then(|| total / self.done as f64)
    }

    /// 永続化済みバケットを 1 つ集計に畳み込む
    pub fn absorb(&mut self, record: &StatRecord) {
        let b = &record.bucket;
        self.done += b.done;
        self.errors += b.errors;
        self.wall_time += b.wall_time;
        self.wait_time += b.wait_time;
        self.write_time += b.write_time;
        self.max_wall_time = self.max_wall_time.max(b.max_wall_time);
        self.max_wait_time = self.max_wait_time.max(b.max_wait_time);
        self.max_write_time = self.max_write_time.max(b.max_write_time);
        if let Some(count) = record.task_count {
            self.max_task_count = Some(self.max_task_count.map_or(count, |m| m.max(count)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_tracks_sums_maxima_and_errors() {
        let mut bucket = StatBucket::default();
        bucket.record(
            Duration::from_millis(500),
            Duration::from_millis(10),
            Duration::from_millis(2),
            false,
        );
        bucket.record(
            Duration::from_millis(1500),
            Duration::from_millis(5),
            Duration::from_millis(4),
            true,
        );

        assert_eq!(bucket.done, 2);
        assert_eq!(bucket.errors, 1);
        assert!((bucket.wall_time - 2.0).abs() < 1e-9);
        assert!((bucket.max_wall_time - 1.5).abs() < 1e-9);
        assert!((bucket.max_wait_time - 0.01).abs() < 1e-9);
        assert!((bucket.max_write_time - 0.004).abs() < 1e-9);
    }

    #[test]
    fn summary_averages_and_rates() {
        let mut summary = StatSummary::default();
        assert_eq!(summary.avg_wall_time(), None);

        let mut bucket = StatBucket::default();
        bucket.record(Duration::from_secs(2), Duration::from_secs(1), Duration::ZERO, false);
        bucket.record(Duration::from_secs(4), Duration::from_secs(3), Duration::ZERO, false);
        summary.absorb(&StatRecord {
            timestamp: Utc::now(),
            task_name: "a.b".into(),
            task_count: None,
            bucket,
        });

        assert_eq!(summary.avg_wall_time(), Some(3.0));
        assert_eq!(summary.avg_wait_time(), Some(2.0));
        assert_eq!(summary.max_task_count, None);
        assert!((summary.per_second(Duration::from_secs(60)) - 2.0 / 60.0).abs() < 1e-9);
    }
}
