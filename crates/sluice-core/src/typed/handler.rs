//! Handler trait - Task を実行する Handler の定義
//!
//! - `Handler<T>`: 型付き、task type ごとに 1 つ
//! - `DynHandler`: object-safe、Registry が保持する形
//! - `TypedHandler<T, H>` / `FnHandler`: `DynHandler` への型消去

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::TaskArgs;
use crate::error::TaskError;

/// # 使用例
/// ```ignore
/// struct VacuumHandler;
///
/// #[async_trait]
/// impl Handler<VacuumTagValues> for VacuumHandler {
///     async fn handle(&self, task: VacuumTagValues) -> Result<(), TaskError> {
///         vacuum(task.project).await
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<(), TaskError>;
}

#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, args: TaskArgs) -> Result<(), TaskError>;
    fn task_type(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, args: TaskArgs) -> Result<(), TaskError> {
        let task = T::from_args(&args)?;
        self.handler.handle(task).await
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}

/// 生の引数を受け取るクロージャの型なし Handler
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    async fn handle_dyn(&self, args: TaskArgs) -> Result<(), TaskError> {
        (self.f)(args).await
    }

    fn task_type(&self) -> &str {
        &self.name
    }
}
