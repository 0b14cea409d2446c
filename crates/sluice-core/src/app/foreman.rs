//! Foreman - ディスパッチャ
//!
//! `TaskStore` から FIFO 順にタスクを取り出し、それぞれを専用のワーカー（tokio タスク）で実行する
//! 同時実行は最大 `num_workers`
//! レコードはワーカー開始前にストアから削除する：配信は at-most-once
//!
//! # 状態遷移
//! `Starting -> Running -> Stopping -> Stopped`
//!
//! # 停止
//! - アイドル時は producer に起こされるまで `Notifier` で眠る
//! - 停止要求で期限が 1 つ決まる（要求時点から `graceful_timeout`）
//! - 実行中ワーカーはその期限までに終わらなければ見捨てられる

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::pidfile::PidFile;
use super::stats::Stats;
use super::workers::Workers;
use crate::config::ForemanConfig;
use crate::domain::{TaskArgs, TaskId, TaskRecord};
use crate::error::{ForemanError, TaskError};
use crate::ports::{
    Clock, ErrorReporter, LogReporter, NoContext, Notifier, StatStore, SystemClock, TaskContext,
    TaskFuture, TaskStore,
};
use crate::typed::{DynHandler, TaskRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ForemanState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ForemanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForemanState::Starting => "STARTING",
            ForemanState::Running => "RUNNING",
            ForemanState::Stopping => "STOPPING",
            ForemanState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

struct Control {
    state: watch::Sender<ForemanState>,
    /// 停止中なら `Some`
    /// 最初の停止要求だけが設定するので、繰り返しても猶予は延びない
    deadline: watch::Sender<Option<Instant>>,
    graceful_timeout: Duration,
}

impl Control {
    fn new(graceful_timeout: Duration) -> Self {
        Self {
            state: watch::Sender::new(ForemanState::Starting),
            deadline: watch::Sender::new(None),
            graceful_timeout,
        }
    }

    fn request_stop(&self) -> bool {
        let graceful = self.graceful_timeout;
        self.deadline.send_if_modified(|deadline| {
            if deadline.is_some() {
                return false;
            }
            *deadline = Some(Instant::now() + graceful);
            true
        })
    }

    fn is_stopping(&self) -> bool {
        self.deadline.borrow().is_some()
    }

    fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }

    fn set_state(&self, state: ForemanState) {
        let previous = self.state.send_replace(state);
        debug!(from = %previous, to = %state, "foreman state");
    }

    /// 停止が要求されたら返る
    async fn stop_requested(&self) {
        let mut rx = self.deadline.subscribe();
        // map で borrow ガードを返す前に drop する
        let _ = rx.wait_for(Option::is_some).await.map(|_| ());
    }
}

/// 動いている Foreman の clone 可能な操作窓口（シグナルハンドラ、テスト、組み込み先アプリ）
#[derive(Clone)]
pub struct ForemanHandle {
    control: Arc<Control>,
    notifier: Arc<dyn Notifier>,
}

impl ForemanHandle {
    /// Foreman に停止を要求、最初の要求だけが有効
    pub fn stop(&self) {
        if self.control.request_stop() {
            info!(
                graceful_timeout_s = self.control.graceful_timeout.as_secs_f64(),
                "stop requested"
            );
        } else {
            debug!("stop already requested");
        }
    }

    /// アイドルの Foreman にバックログを確認させる
    pub fn wake(&self) {
        if let Err(e) = self.notifier.wake() {
            warn!(error = %e, "could not send wakeup call");
        }
    }

    pub fn state(&self) -> ForemanState {
        *self.control.state.borrow()
    }

    /// Foreman が `state`（またはそれ以降）に達したら返る
    pub async fn reached(&self, state: ForemanState) {
        let mut rx = self.control.state.subscribe();
        let _ = rx.wait_for(|s| *s >= state).await.map(|_| ());
    }
}

/// ワーカーで実行するもの（解決・パース済み）
struct Job {
    id: TaskId,
    task_name: String,
    handler: Arc<dyn DynHandler>,
    args: TaskArgs,
    wait_time: Duration,
    write_time: Duration,
}

/// 全ワーカーが Foreman と共有するもの
#[derive(Clone)]
struct Crew {
    stats: Arc<Stats>,
    workers: Arc<Workers>,
    reporter: Arc<dyn ErrorReporter>,
    context: Arc<dyn TaskContext>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Crew {
    async fn run(self, job: Job, slot: OwnedSemaphorePermit, finished: watch::Sender<()>) {
        let Job {
            id,
            task_name,
            handler,
            args,
            wait_time,
            write_time,
        } = job;
        let started = Instant::now();

        let task: TaskFuture = {
            let args = args.clone();
            Box::pin(async move { handler.handle_dyn(args).await })
        };
        let task = self.context.wrap(&task_name, &args, task);

        // 本体の panic が JoinError としてここに来るよう別タスクにする
        let result = match tokio::spawn(task).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(TaskError::Panicked(e.to_string())),
        };
        let wall_time = started.elapsed();

        let errored = match &result {
            Ok(()) => false,
            Err(e) => {
                warn!(task = %id.short(), task_name = %task_name, error = %e, "task failed");
                self.reporter.capture(&task_name, e);
                true
            }
        };
        info!(
            task = %id.short(),
            task_name = %task_name,
            wall_time_s = wall_time.as_secs_f64(),
            "worker done"
        );

        self.stats
            .record_completion(&task_name, wall_time, wait_time, write_time, errored)
            .await;
        self.workers.stopped(id);
        drop(slot);
        drop(finished);
    }
}

enum Dispatch {
    Dispatched,
    Empty,
    Stopping,
}

pub struct Foreman {
    config: ForemanConfig,
    store: Arc<dyn TaskStore>,
    stat_store: Arc<dyn StatStore>,
    registry: Arc<TaskRegistry>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    slots: Arc<Semaphore>,
    control: Arc<Control>,
    crew: Crew,
    /// ストアから読んだがまだディスパッチしていないレコード
    /// ディスパッチされるまではストアに残っている
    prefetch: VecDeque<TaskRecord>,
}

impl Foreman {
    pub fn new(
        config: ForemanConfig,
        store: Arc<dyn TaskStore>,
        stat_store: Arc<dyn StatStore>,
        registry: Arc<TaskRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stats = Stats::new(
            stat_store.clone(),
            store.clone(),
            config.stats_retention_minutes,
            clock.clone(),
        );
        Self {
            slots: Arc::new(Semaphore::new(config.num_workers)),
            control: Arc::new(Control::new(config.graceful_timeout())),
            crew: Crew {
                stats: Arc::new(stats),
                workers: Arc::new(Workers::new()),
                reporter: Arc::new(LogReporter),
                context: Arc::new(NoContext),
            },
            prefetch: VecDeque::new(),
            config,
            store,
            stat_store,
            registry,
            notifier,
            clock,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.crew.reporter = reporter;
        self
    }

    pub fn with_context(mut self, context: Arc<dyn TaskContext>) -> Self {
        self.crew.context = context;
        self
    }

    /// 壁時計を差し替える（待ち時間の計測と統計のバケット分け）
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.crew.stats = Arc::new(Stats::new(
            self.stat_store.clone(),
            self.store.clone(),
            self.config.stats_retention_minutes,
            clock.clone(),
        ));
        self.clock = clock;
        self
    }

    pub fn handle(&self) -> ForemanHandle {
        ForemanHandle {
            control: self.control.clone(),
            notifier: self.notifier.clone(),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.crew.stats.clone()
    }

    pub fn workers(&self) -> Arc<Workers> {
        self.crew.workers.clone()
    }

    /// 停止されるまで動く
    ///
    /// 全ワーカーが終わるか見捨てられた後に返る
    /// ストアのエラーは停止要求と同じように Foreman を止め、その後に返される
    pub async fn run(mut self) -> Result<(), ForemanError> {
        if self.config.task_always_eager {
            error!("cannot run the foreman with task_always_eager set");
            return Err(ForemanError::EagerMode);
        }

        let pid_file = match self.config.pid_file() {
            Some(path) => Some(PidFile::acquire(path)?),
            None => {
                warn!("no pid file configured, pid check disabled");
                None
            }
        };

        info!(
            pid = std::process::id(),
            num_workers = self.config.num_workers,
            task_qs_limit = self.config.task_qs_limit,
            workaholic = self.config.workaholic,
            "foreman starting"
        );
        self.control.set_state(ForemanState::Running);

        let result = self.run_loop().await;
        if let Err(e) = &result {
            error!(error = %e, "foreman loop failed, stopping");
            self.control.request_stop();
        }

        self.control.set_state(ForemanState::Stopping);
        self.stop_workers().await;
        drop(pid_file);
        self.control.set_state(ForemanState::Stopped);
        info!("foreman stopped");
        result
    }

    async fn run_loop(&mut self) -> Result<(), ForemanError> {
        info!("clearing task backlog");
        loop {
            loop {
                match self.create_worker().await? {
                    Dispatch::Dispatched => {}
                    Dispatch::Empty => break,
                    Dispatch::Stopping => return Ok(()),
                }
            }

            // workaholic モードではバックログが残っている間は停止が保留されていたかもしれない
            // 眠る前にもう一度確認
            if self.ready_to_stop().await? {
                return Ok(());
            }

            debug!("waiting for wakeup call");
            tokio::select! {
                _ = self.notifier.wait() => debug!("woken up"),
                _ = self.control.stop_requested() => {}
            }
            if self.ready_to_stop().await? {
                return Ok(());
            }
        }
    }

    /// ディスパッチを 1 回試みる
    async fn create_worker(&mut self) -> Result<Dispatch, ForemanError> {
        loop {
            if self.prefetch.is_empty() {
                let batch = self.store.peek(self.config.task_qs_limit).await?;
                debug!(count = batch.len(), "tasks fetched from queue");
                if batch.is_empty() {
                    return Ok(Dispatch::Empty);
                }
                self.prefetch.extend(batch);
            }

            let Some(slot) = self.acquire_slot().await else {
                return Ok(Dispatch::Stopping);
            };
            // スロットは停止要求のせいで渡されたのかもしれない
            if self.ready_to_stop().await? {
                return Ok(Dispatch::Stopping);
            }

            let Some(record) = self.prefetch.pop_front() else {
                continue;
            };

            let t0 = Instant::now();
            let removed = self.store.remove(record.id).await?;
            let write_time = t0.elapsed();
            debug!(task = %record.id.short(), write_time_ms = write_time.as_secs_f64() * 1000.0, "task removed from queue");
            if !removed {
                debug!(task = %record.id.short(), "task already gone, skipping");
                continue;
            }

            match self.prepare(&record) {
                Ok((handler, args)) => {
                    self.spawn_worker(record, handler, args, slot, write_time);
                    return Ok(Dispatch::Dispatched);
                }
                Err(e) => {
                    // 捨てる：壊れたレコード 1 つでキューを詰まらせない
                    error!(
                        task = %record.id.short(),
                        task_name = %record.task_name,
                        error = %e,
                        "cannot execute task, dropping it"
                    );
                    self.crew.reporter.capture(&record.task_name, &e);
                }
            }
        }
    }

    /// 停止要求が先に来たら `None`
    /// workaholic の Foreman はここでは停止要求を無視する（定義上まだ仕事が残っている）
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        let slots = self.slots.clone();
        if self.config.workaholic {
            return slots.acquire_owned().await.ok();
        }
        tokio::select! {
            biased;
            permit = slots.acquire_owned() => permit.ok(),
            _ = self.control.stop_requested() => None,
        }
    }

    fn prepare(&self, record: &TaskRecord) -> Result<(Arc<dyn DynHandler>, TaskArgs), TaskError> {
        let handler = self.registry.resolve(&record.task_name)?;
        let args = record.parse_args()?;
        Ok((handler, args))
    }

    fn spawn_worker(
        &self,
        record: TaskRecord,
        handler: Arc<dyn DynHandler>,
        args: TaskArgs,
        slot: OwnedSemaphorePermit,
        write_time: Duration,
    ) {
        let wait_time = (self.clock.now() - record.created_at)
            .to_std()
            .unwrap_or_default();
        info!(
            task = %record.id.short(),
            task_name = %record.task_name,
            args = ?args.args,
            kwargs = ?args.kwargs,
            "starting worker"
        );

        let job = Job {
            id: record.id,
            task_name: record.task_name,
            handler,
            args,
            wait_time,
            write_time,
        };
        let crew = self.crew.clone();
        let (id, task_name) = (job.id, job.task_name.clone());
        self.crew.workers.start(id, &task_name, move |finished| {
            tokio::spawn(crew.run(job, slot, finished))
        });
    }

    /// 要求されていれば停止してよい、ただし workaholic モードでタスクが残っている間は除く
    async fn ready_to_stop(&self) -> Result<bool, ForemanError> {
        if !self.control.is_stopping() {
            return Ok(false);
        }
        if self.config.workaholic {
            let remaining = self.store.count().await?;
            if remaining > 0 {
                debug!(remaining, "workaholic mode, not stopping before the backlog is empty");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn stop_workers(&self) {
        let deadline = self.control.deadline().unwrap_or_else(Instant::now);
        let running = self.crew.workers.len();
        info!(running, "waiting for workers to finish");

        let abandoned = self.crew.workers.join_until(deadline).await;
        for worker in &abandoned {
            warn!(
                task = %worker.id.short(),
                task_name = %worker.task_name,
                graceful_timeout_s = self.control.graceful_timeout.as_secs_f64(),
                "worker did not finish in time, abandoning it"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use crate::impls::{InMemoryStatStore, InMemoryTaskStore, MemoryNotifier};
    use serde_json::json;
    use std::future::Future;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    fn config(num_workers: usize) -> ForemanConfig {
        ForemanConfig {
            num_workers,
            graceful_timeout_secs: 5,
            task_qs_limit: 3,
            pid_file: PathBuf::new(),
            ..ForemanConfig::default()
        }
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !check().await {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[derive(Default)]
    struct Captured(Mutex<Vec<String>>);

    impl ErrorReporter for Captured {
        fn capture(&self, task_name: &str, _error: &TaskError) {
            self.0.lock().unwrap().push(task_name.to_string());
        }
    }

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        registry: Arc<TaskRegistry>,
        notifier: Arc<MemoryNotifier>,
        reporter: Arc<Captured>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryTaskStore::new()),
                registry: Arc::new(TaskRegistry::new()),
                notifier: Arc::new(MemoryNotifier::new()),
                reporter: Arc::new(Captured::default()),
            }
        }

        fn foreman(&self, config: ForemanConfig) -> Foreman {
            Foreman::new(
                config,
                self.store.clone(),
                Arc::new(InMemoryStatStore::new()),
                self.registry.clone(),
                self.notifier.clone(),
            )
            .with_reporter(self.reporter.clone())
        }

        async fn enqueue(&self, name: &str, args: Vec<serde_json::Value>) -> TaskId {
            let id = self
                .store
                .push(NewTask::new(name, TaskArgs::positional(args)))
                .await
                .unwrap();
            self.notifier.wake().unwrap();
            id
        }

        async fn remaining(&self) -> u64 {
            self.store.count().await.unwrap()
        }
    }

    fn start(foreman: Foreman) -> (ForemanHandle, JoinHandle<Result<(), ForemanError>>) {
        let handle = foreman.handle();
        (handle, tokio::spawn(foreman.run()))
    }

    async fn finish(
        handle: &ForemanHandle,
        join: JoinHandle<Result<(), ForemanError>>,
    ) -> Result<(), ForemanError> {
        handle.stop();
        timeout(Duration::from_secs(10), join)
            .await
            .expect("foreman did not stop")
            .expect("foreman panicked")
    }

    /// 第 1 引数をリストに追加する `test.record` を登録
    fn recorder(registry: &TaskRegistry) -> Arc<Mutex<Vec<u64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry
            .register_fn("test.record", move |args: TaskArgs| {
                let sink = sink.clone();
                async move {
                    let n = args.args.first().and_then(|v| v.as_u64()).unwrap_or(u64::MAX);
                    sink.lock().unwrap().push(n);
                    Ok(())
                }
            })
            .unwrap();
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_task_runs_exactly_once() {
        let h = Harness::new();
        let seen = recorder(&h.registry);
        for i in 0..20 {
            h.enqueue("test.record", vec![json!(i)]).await;
        }

        let (handle, join) = start(h.foreman(config(4)));
        eventually("all tasks to run", || {
            let seen = seen.clone();
            async move { seen.lock().unwrap().len() == 20 }
        })
        .await;
        finish(&handle, join).await.unwrap();
        assert_eq!(h.remaining().await, 0);

        // 同じストアに対する 2 つ目の Foreman にはやり直すものがない
        let (handle, join) = start(h.foreman(config(4)));
        handle.reached(ForemanState::Running).await;
        sleep(Duration::from_millis(50)).await;
        finish(&handle, join).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<u64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn task_removed_before_a_crash_is_not_run_after_restart() {
        let h = Harness::new();
        let seen = recorder(&h.registry);
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(h.enqueue("test.record", vec![json!(i)]).await);
        }
        // レコードを削除し、実行前に死んだ Foreman
        assert!(h.store.remove(ids[1]).await.unwrap());

        let (handle, join) = start(h.foreman(config(2)));
        eventually("the surviving tasks to run", || {
            let seen = seen.clone();
            async move { seen.lock().unwrap().len() == 2 }
        })
        .await;
        sleep(Duration::from_millis(50)).await;
        finish(&handle, join).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 2]);
        assert_eq!(h.remaining().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_by_num_workers() {
        let h = Harness::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        {
            let (current, peak, done) = (current.clone(), peak.clone(), done.clone());
            h.registry
                .register_fn("test.busy", move |_| {
                    let (current, peak, done) = (current.clone(), peak.clone(), done.clone());
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(30)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap();
        }
        for _ in 0..12 {
            h.enqueue("test.busy", vec![]).await;
        }

        let (handle, join) = start(h.foreman(config(2)));
        eventually("all busy tasks", || {
            let done = done.clone();
            async move { done.load(Ordering::SeqCst) == 12 }
        })
        .await;
        finish(&handle, join).await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_worker_dispatches_in_fifo_order() {
        let h = Harness::new();
        let seen = recorder(&h.registry);
        for i in 0..10 {
            h.enqueue("test.record", vec![json!(i)]).await;
        }

        let (handle, join) = start(h.foreman(config(1)));
        eventually("all tasks to run", || {
            let seen = seen.clone();
            async move { seen.lock().unwrap().len() == 10 }
        })
        .await;
        finish(&handle, join).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_and_panicking_tasks_do_not_stop_the_foreman() {
        let h = Harness::new();
        let seen = recorder(&h.registry);
        h.registry
            .register_fn("test.fail", |_| async { Err(TaskError::failed("I am failing")) })
            .unwrap();
        h.registry
            .register_fn("test.panic", |args: TaskArgs| async move {
                if args.args.is_empty() {
                    panic!("boom");
                }
                Ok(())
            })
            .unwrap();

        h.enqueue("test.fail", vec![]).await;
        h.enqueue("test.panic", vec![]).await;
        h.enqueue("test.record", vec![json!(1)]).await;

        // 止めた時計：3 つの完了はすべて同じバケットに入る
        let clock = Arc::new(crate::ports::FixedClock::new(chrono::Utc::now()));
        let foreman = h.foreman(config(1)).with_clock(clock);
        let stats = foreman.stats();
        let (handle, join) = start(foreman);
        eventually("the healthy task", || {
            let seen = seen.clone();
            async move { !seen.lock().unwrap().is_empty() }
        })
        .await;
        finish(&handle, join).await.unwrap();

        let mut reported = h.reporter.0.lock().unwrap().clone();
        reported.sort();
        assert_eq!(reported, vec!["test.fail", "test.panic"]);

        let pending = stats.pending();
        assert_eq!(pending["test.fail"].errors, 1);
        assert_eq!(pending["test.panic"].errors, 1);
        assert_eq!(pending["test.record"].errors, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn poisoned_records_are_dropped_and_dispatch_continues() {
        let h = Harness::new();
        let seen = recorder(&h.registry);
        h.store.push_raw("test.record", "not json", "{}").await;
        h.store.push_raw("nodots", "[]", "{}").await;
        h.store.push_raw("missing.task", "[]", "{}").await;
        h.enqueue("test.record", vec![json!(7)]).await;

        let (handle, join) = start(h.foreman(config(1)));
        eventually("the valid task", || {
            let seen = seen.clone();
            async move { !seen.lock().unwrap().is_empty() }
        })
        .await;
        finish(&handle, join).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert_eq!(h.remaining().await, 0);
        assert_eq!(h.reporter.0.lock().unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_foreman_wakes_up_for_new_work() {
        let h = Harness::new();
        let seen = recorder(&h.registry);

        let (handle, join) = start(h.foreman(config(2)));
        handle.reached(ForemanState::Running).await;
        sleep(Duration::from_millis(20)).await;

        h.enqueue("test.record", vec![json!(3)]).await;
        eventually("the late task", || {
            let seen = seen.clone();
            async move { !seen.lock().unwrap().is_empty() }
        })
        .await;
        finish(&handle, join).await.unwrap();
        assert_eq!(handle.state(), ForemanState::Stopped);
    }

    fn slow_task(registry: &TaskRegistry, name: &str, duration: Duration) -> (Arc<AtomicBool>, Arc<AtomicBool>) {
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (s, f) = (started.clone(), finished.clone());
        registry
            .register_fn(name, move |_| {
                let (s, f) = (s.clone(), f.clone());
                async move {
                    s.store(true, Ordering::SeqCst);
                    sleep(duration).await;
                    f.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        (started, finished)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_running_workers() {
        let h = Harness::new();
        let (started, finished) = slow_task(&h.registry, "test.slow", Duration::from_millis(200));
        h.enqueue("test.slow", vec![]).await;

        let foreman = h.foreman(config(2));
        let workers = foreman.workers();
        let (handle, join) = start(foreman);
        eventually("the slow task to start", || {
            let started = started.clone();
            async move { started.load(Ordering::SeqCst) }
        })
        .await;

        let t0 = Instant::now();
        finish(&handle, join).await.unwrap();

        assert!(finished.load(Ordering::SeqCst));
        assert!(workers.is_empty());
        assert!(t0.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_abandons_workers_after_the_grace_period() {
        let h = Harness::new();
        let (started, finished) = slow_task(&h.registry, "test.stuck", Duration::from_secs(60));
        h.enqueue("test.stuck", vec![]).await;

        let foreman = h.foreman(ForemanConfig {
            graceful_timeout_secs: 1,
            ..config(2)
        });
        let workers = foreman.workers();
        let (handle, join) = start(foreman);
        eventually("the stuck task to start", || {
            let started = started.clone();
            async move { started.load(Ordering::SeqCst) }
        })
        .await;

        let t0 = Instant::now();
        handle.stop();
        // 2 回目の要求で期限が延びてはいけない
        sleep(Duration::from_millis(300)).await;
        handle.stop();
        finish(&handle, join).await.unwrap();
        let waited = t0.elapsed();

        assert!(waited >= Duration::from_millis(900), "stopped after {waited:?}");
        assert!(waited < Duration::from_millis(2_000), "stopped after {waited:?}");
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(workers.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_leaves_undispatched_tasks_queued() {
        let h = Harness::new();
        let (started, _) = slow_task(&h.registry, "test.slow", Duration::from_millis(100));
        for _ in 0..5 {
            h.enqueue("test.slow", vec![]).await;
        }

        let (handle, join) = start(h.foreman(config(1)));
        eventually("the first task to start", || {
            let started = started.clone();
            async move { started.load(Ordering::SeqCst) }
        })
        .await;
        finish(&handle, join).await.unwrap();

        assert!(h.remaining().await >= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workaholic_foreman_drains_the_backlog_first() {
        let h = Harness::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            h.registry
                .register_fn("test.slow", move |_| {
                    let count = count.clone();
                    async move {
                        sleep(Duration::from_millis(50)).await;
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap();
        }
        for _ in 0..5 {
            h.enqueue("test.slow", vec![]).await;
        }

        let (handle, join) = start(h.foreman(ForemanConfig {
            workaholic: true,
            ..config(1)
        }));
        handle.reached(ForemanState::Running).await;
        finish(&handle, join).await.unwrap();

        assert_eq!(h.remaining().await, 0);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn eager_mode_refuses_to_start() {
        let h = Harness::new();
        let foreman = h.foreman(ForemanConfig {
            task_always_eager: true,
            ..config(1)
        });
        assert!(matches!(foreman.run().await, Err(ForemanError::EagerMode)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pid_file_lives_as_long_as_the_foreman() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("foreman.pid");
        let h = Harness::new();

        let (handle, join) = start(h.foreman(ForemanConfig {
            pid_file: pid_path.clone(),
            ..config(1)
        }));
        handle.reached(ForemanState::Running).await;
        assert!(pid_path.exists());

        finish(&handle, join).await.unwrap();
        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn stats_record_queue_latency() {
        use crate::ports::FixedClock;
        use chrono::{TimeDelta, TimeZone, Utc};

        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()));
        let h = Harness {
            store: Arc::new(InMemoryTaskStore::with_clock(clock.clone())),
            ..Harness::new()
        };
        let seen = recorder(&h.registry);
        h.enqueue("test.record", vec![json!(1)]).await;
        clock.advance(TimeDelta::seconds(3));

        let foreman = h.foreman(config(1)).with_clock(clock.clone());
        let stats = foreman.stats();
        let (handle, join) = start(foreman);
        eventually("the task", || {
            let seen = seen.clone();
            async move { !seen.lock().unwrap().is_empty() }
        })
        .await;
        finish(&handle, join).await.unwrap();

        let bucket = &stats.pending()["test.record"];
        assert_eq!(bucket.done, 1);
        assert!((bucket.max_wait_time - 3.0).abs() < 1e-6);
    }
}
