//! TaskQueue - producer 側
//!
//! タスクをストアに入れて Foreman を起こす
//! `task_always_eager` のときは呼び出し側でその場で実行し、エラーはそのまま呼び出し側のエラー

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{NewTask, TaskArgs, TaskId};
use crate::error::EnqueueError;
use crate::ports::{NoContext, Notifier, TaskContext, TaskFuture, TaskStore};
use crate::typed::{Task, TaskRegistry};

/// `enqueue` がタスクをどう扱ったか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued(TaskId),
    RanEagerly,
}

impl Enqueued {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Enqueued::Queued(id) => Some(*id),
            Enqueued::RanEagerly => None,
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<TaskRegistry>,
    context: Arc<dyn TaskContext>,
    eager: bool,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            store,
            notifier,
            registry,
            context: Arc::new(NoContext),
            eager: false,
        }
    }

    pub fn with_context(mut self, context: Arc<dyn TaskContext>) -> Self {
        self.context = context;
        self
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    /// `task_name` を `args` で積む、eager モードならその場で実行
    ///
    /// wakeup の失敗はログに出すだけ：タスクは保存済みで、Foreman が次の wakeup で拾う
    pub async fn enqueue(&self, task_name: &str, args: TaskArgs) -> Result<Enqueued, EnqueueError> {
        let args = self.with_hook_kwargs(args);
        if self.eager {
            self.run_eagerly(task_name, args).await?;
            return Ok(Enqueued::RanEagerly);
        }

        let id = self.store.push(NewTask::new(task_name, args)).await?;
        info!(task = %id.short(), task_name, "task queued");
        self.wake();
        Ok(Enqueued::Queued(id))
    }

    /// [`TaskQueue::enqueue`] の型付き版
    pub async fn delay<T: Task>(&self, task: &T) -> Result<Enqueued, EnqueueError> {
        let args = task.to_args()?;
        self.enqueue(T::TYPE, args).await
    }

    /// タスクを集めて [`DeferredEnqueue::commit`] のときだけ保存する
    ///
    /// 呼び出し側の処理単位の結果に enqueue を結びつけられる
    /// commit せずに drop するとバッチは破棄される
    pub fn deferred(&self) -> DeferredEnqueue {
        DeferredEnqueue {
            queue: self.clone(),
            pending: Vec::new(),
        }
    }

    fn with_hook_kwargs(&self, mut args: TaskArgs) -> TaskArgs {
        for (key, value) in self.context.add_task_kwargs() {
            args.kwargs.insert(key, value);
        }
        args
    }

    async fn run_eagerly(&self, task_name: &str, args: TaskArgs) -> Result<(), EnqueueError> {
        let handler = self.registry.resolve(task_name)?;
        debug!(task_name, "running task eagerly");
        let task: TaskFuture = {
            let args = args.clone();
            Box::pin(async move { handler.handle_dyn(args).await })
        };
        self.context.wrap(task_name, &args, task).await?;
        Ok(())
    }

    fn wake(&self) {
        if let Err(e) = self.notifier.wake() {
            warn!(error = %e, "could not send wakeup call, the foreman will pick the task up later");
        }
    }
}

/// [`DeferredEnqueue::commit`] まで保留されるタスク
pub struct DeferredEnqueue {
    queue: TaskQueue,
    pending: Vec<NewTask>,
}

impl DeferredEnqueue {
    pub fn add(&mut self, task_name: &str, args: TaskArgs) {
        let args = self.queue.with_hook_kwargs(args);
        self.pending.push(NewTask::new(task_name, args));
    }

    pub fn add_task<T: Task>(&mut self, task: &T) -> Result<(), EnqueueError> {
        let args = task.to_args()?;
        self.add(T::TYPE, args);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 集めたものを順に保存（eager モードなら実行）し、最後に wakeup を 1 回送る
    pub async fn commit(mut self) -> Result<Vec<Enqueued>, EnqueueError> {
        let pending = std::mem::take(&mut self.pending);
        let mut done = Vec::with_capacity(pending.len());
        if self.queue.eager {
            for task in pending {
                self.queue.run_eagerly(&task.task_name, task.args).await?;
                done.push(Enqueued::RanEagerly);
            }
            return Ok(done);
        }

        for task in pending {
            let task_name = task.task_name.clone();
            let id = self.queue.store.push(task).await?;
            debug!(task = %id.short(), task_name = %task_name, "deferred task queued");
            done.push(Enqueued::Queued(id));
        }
        if !done.is_empty() {
            info!(count = done.len(), "deferred tasks queued");
            self.queue.wake();
        }
        Ok(done)
    }
}

impl Drop for DeferredEnqueue {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "discarding uncommitted tasks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::impls::{InMemoryTaskStore, MemoryNotifier};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Map, Value};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        notifier: Arc<MemoryNotifier>,
        registry: Arc<TaskRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryTaskStore::new()),
                notifier: Arc::new(MemoryNotifier::new()),
                registry: Arc::new(TaskRegistry::new()),
            }
        }

        fn queue(&self) -> TaskQueue {
            TaskQueue::new(self.store.clone(), self.notifier.clone(), self.registry.clone())
        }

        async fn woken(&self) -> bool {
            tokio::time::timeout(Duration::from_millis(50), self.notifier.wait())
                .await
                .is_ok()
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Resize {
        image: String,
        width: u32,
    }

    impl Task for Resize {
        const TYPE: &'static str = "images.resize";
    }

    #[tokio::test]
    async fn enqueue_stores_the_task_and_wakes_the_foreman() {
        let f = Fixture::new();
        let queued = f
            .queue()
            .enqueue("tests.noop", TaskArgs::positional(vec![json!(1)]))
            .await
            .unwrap();

        assert!(queued.task_id().is_some());
        let records = f.store.peek(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_name, "tests.noop");
        assert_eq!(records[0].args, "[1]");
        assert!(f.woken().await);
    }

    #[tokio::test]
    async fn delay_stores_struct_fields_as_kwargs() {
        let f = Fixture::new();
        f.queue()
            .delay(&Resize {
                image: "a.png".into(),
                width: 64,
            })
            .await
            .unwrap();

        let record = f.store.peek(1).await.unwrap().remove(0);
        assert_eq!(record.task_name, "images.resize");
        let args = record.parse_args().unwrap();
        assert!(args.args.is_empty());
        assert_eq!(args.kwargs["width"], json!(64));
    }

    struct Tenant;

    impl TaskContext for Tenant {
        fn add_task_kwargs(&self) -> Map<String, Value> {
            let mut kwargs = Map::new();
            kwargs.insert("tenant".into(), json!("acme"));
            kwargs
        }
    }

    #[tokio::test]
    async fn hook_kwargs_are_merged_and_win() {
        let f = Fixture::new();
        let mut kwargs = Map::new();
        kwargs.insert("tenant".into(), json!("other"));
        kwargs.insert("n".into(), json!(2));

        f.queue()
            .with_context(Arc::new(Tenant))
            .enqueue("tests.noop", TaskArgs::keyword(kwargs))
            .await
            .unwrap();

        let args = f.store.peek(1).await.unwrap()[0].parse_args().unwrap();
        assert_eq!(args.kwargs["tenant"], json!("acme"));
        assert_eq!(args.kwargs["n"], json!(2));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Crop(String, u32);

    impl Task for Crop {
        const TYPE: &'static str = "images.crop";
    }

    #[tokio::test]
    async fn positional_task_still_decodes_with_hook_kwargs() {
        let f = Fixture::new();
        f.queue()
            .with_context(Arc::new(Tenant))
            .delay(&Crop("c.png".into(), 16))
            .await
            .unwrap();

        let args = f.store.peek(1).await.unwrap()[0].parse_args().unwrap();
        assert_eq!(args.kwargs["tenant"], json!("acme"));
        assert_eq!(Crop::from_args(&args).unwrap(), Crop("c.png".into(), 16));
    }

    #[tokio::test]
    async fn eager_mode_runs_inline_and_propagates_errors() {
        let f = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            f.registry
                .register_fn("tests.count", move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap();
        }
        f.registry
            .register_fn("tests.fail", |_| async { Err(TaskError::failed("nope")) })
            .unwrap();
        let queue = f.queue().eager(true);

        assert_eq!(
            queue.enqueue("tests.count", TaskArgs::default()).await.unwrap(),
            Enqueued::RanEagerly
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            queue.enqueue("tests.fail", TaskArgs::default()).await,
            Err(EnqueueError::Task(TaskError::Failed(_)))
        ));
        assert!(matches!(
            queue.enqueue("tests.missing", TaskArgs::default()).await,
            Err(EnqueueError::Registry(_))
        ));
        assert_eq!(f.store.count().await.unwrap(), 0);
    }

    struct BrokenNotifier;

    #[async_trait::async_trait]
    impl Notifier for BrokenNotifier {
        fn wake(&self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }

        async fn wait(&self) {
            std::future::pending::<()>().await
        }
    }

    #[tokio::test]
    async fn failed_wakeup_call_does_not_lose_the_task() {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = TaskQueue::new(store.clone(), Arc::new(BrokenNotifier), Arc::new(TaskRegistry::new()));

        assert!(queue.enqueue("tests.noop", TaskArgs::default()).await.is_ok());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deferred_tasks_are_stored_in_order_on_commit() {
        let f = Fixture::new();
        let mut batch = f.queue().deferred();
        batch.add("tests.first", TaskArgs::default());
        batch
            .add_task(&Resize {
                image: "b.png".into(),
                width: 8,
            })
            .unwrap();
        assert_eq!(f.store.count().await.unwrap(), 0);

        let done = batch.commit().await.unwrap();

        assert_eq!(done.len(), 2);
        assert_eq!(f.store.queued_names().await, vec!["tests.first", "images.resize"]);
        assert!(f.woken().await);
    }

    #[tokio::test]
    async fn dropped_batch_is_discarded() {
        let f = Fixture::new();
        {
            let mut batch = f.queue().deferred();
            batch.add("tests.first", TaskArgs::default());
        }
        assert_eq!(f.store.count().await.unwrap(), 0);
        assert!(!f.woken().await);
    }

    #[tokio::test]
    async fn eager_context_wraps_the_task() {
        struct Recording(Arc<Mutex<Vec<String>>>);

        impl TaskContext for Recording {
            fn wrap(
                &self,
                task_name: &str,
                _args: &TaskArgs,
                task: crate::ports::TaskFuture,
            ) -> crate::ports::TaskFuture {
                self.0.lock().unwrap().push(task_name.to_string());
                task
            }
        }

        let f = Fixture::new();
        f.registry.register_fn("tests.noop", |_| async { Ok(()) }).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        f.queue()
            .eager(true)
            .with_context(Arc::new(Recording(seen.clone())))
            .enqueue("tests.noop", TaskArgs::default())
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["tests.noop"]);
    }
}
