//! Workers - 実行中ワーカーの追跡
//!
//! 実行中タスク 1 つにつき 1 エントリ
//! エントリ追加とタスク spawn、削除と一覧取得はそれぞれ同じロックの下で行う
//! なので一覧に起動途中・削除途中のワーカーが見えることはない

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::domain::TaskId;

struct WorkerHandle {
    task_name: String,
    started_at: Instant,
    join: JoinHandle<()>,
    /// ワーカーが終わる（このマップからの削除も含む）と閉じる（sender が drop される）
    finished: watch::Receiver<()>,
}

/// 追跡中ワーカー 1 つのスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: TaskId,
    pub task_name: String,
    pub started_at: Instant,
    pub alive: bool,
}

#[derive(Default)]
pub struct Workers {
    running: Mutex<HashMap<TaskId, WorkerHandle>>,
}

impl Workers {
    pub fn new() -> Self {
        Self::default()
    }

    /// `spawn` でワーカーを起動して追跡する
    ///
    /// `spawn` は完了シグナルの sender を受け取る
    /// ワーカーは [`Workers::stopped`] を呼んだ後までそれを保持すること
    pub fn start<F>(&self, id: TaskId, task_name: &str, spawn: F)
    where
        F: FnOnce(watch::Sender<()>) -> JoinHandle<()>,
    {
        let (done_tx, done_rx) = watch::channel(());
        let mut running = self.lock();
        let join = spawn(done_tx);
        running.insert(
            id,
            WorkerHandle {
                task_name: task_name.to_string(),
                started_at: Instant::now(),
                join,
                finished: done_rx,
            },
        );
    }

    pub fn stopped(&self, id: TaskId) {
        self.lock().remove(&id);
    }

    pub fn list(&self) -> Vec<WorkerInfo> {
        let running = self.lock();
        let mut workers: Vec<WorkerInfo> = running
            .iter()
            .map(|(id, w)| WorkerInfo {
                id: *id,
                task_name: w.task_name.clone(),
                started_at: w.started_at,
                alive: !w.join.is_finished(),
            })
            .collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 追跡中の全ワーカーを共通の `deadline` まで待つ
    /// 期限に間に合わなかったワーカーを返す（それらは動かしたまま）
    pub async fn join_until(&self, deadline: Instant) -> Vec<WorkerInfo> {
        // 先にスナップショット：await をまたいでロックを持たない
        let pending: Vec<(WorkerInfo, watch::Receiver<()>)> = {
            let running = self.lock();
            running
                .iter()
                .map(|(id, w)| {
                    let info = WorkerInfo {
                        id: *id,
                        task_name: w.task_name.clone(),
                        started_at: w.started_at,
                        alive: !w.join.is_finished(),
                    };
                    (info, w.finished.clone())
                })
                .collect()
        };

        let mut abandoned = Vec::new();
        for (info, mut finished) in pending {
            // sender が消えると `changed` はエラー、つまりワーカーは終わった
            let done = timeout_at(deadline, async {
                while finished.changed().await.is_ok() {}
            })
            .await;
            if done.is_err() {
                abandoned.push(info);
            }
        }
        abandoned
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, WorkerHandle>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn spawn_sleeper(workers: &Arc<Workers>, id: u64, ms: u64) {
        let tracker = workers.clone();
        let id = TaskId::new(id);
        workers.start(id, "test.sleep", move |done| {
            tokio::spawn(async move {
                sleep(Duration::from_millis(ms)).await;
                tracker.stopped(id);
                drop(done);
            })
        });
    }

    #[tokio::test]
    async fn finished_workers_remove_themselves() {
        let workers = Arc::new(Workers::new());
        spawn_sleeper(&workers, 1, 10);
        spawn_sleeper(&workers, 2, 10);
        assert_eq!(workers.len(), 2);

        let abandoned = workers.join_until(Instant::now() + Duration::from_secs(2)).await;

        assert!(abandoned.is_empty());
        assert!(workers.is_empty());
    }

    #[tokio::test]
    async fn slow_workers_are_abandoned_at_the_shared_deadline() {
        let workers = Arc::new(Workers::new());
        spawn_sleeper(&workers, 1, 20);
        spawn_sleeper(&workers, 2, 5_000);
        spawn_sleeper(&workers, 3, 5_000);

        let started = Instant::now();
        let abandoned = workers.join_until(started + Duration::from_millis(300)).await;

        // 遅い 2 つのワーカーは 300ms ずつではなく 1 つの期限を共有する
        assert!(started.elapsed() < Duration::from_millis(550));
        let ids: Vec<_> = abandoned.iter().map(|w| w.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&TaskId::new(2)) && ids.contains(&TaskId::new(3)));
        assert_eq!(workers.len(), 2);
    }

    #[tokio::test]
    async fn list_is_sorted_and_reports_liveness() {
        let workers = Arc::new(Workers::new());
        spawn_sleeper(&workers, 9, 5_000);
        spawn_sleeper(&workers, 4, 5_000);

        let listed = workers.list();
        assert_eq!(
            listed.iter().map(|w| w.id.get()).collect::<Vec<_>>(),
            vec![4, 9]
        );
        assert!(listed.iter().all(|w| w.alive));
    }
}
