//! AppBuilder - 起動時のワイヤリング
//!
//! # 学習ポイント
//! - Handler と loader を 1 つの `TaskRegistry` に集める
//! - デプロイが頼るタスクが揃っているかを起動時に検証（Fail-fast）
//! - 同じ Registry を共有する Foreman と TaskQueue を払い出す

use std::future::Future;
use std::sync::Arc;

use super::client::TaskQueue;
use super::foreman::Foreman;
use crate::config::ForemanConfig;
use crate::domain::TaskArgs;
use crate::error::{RegistryError, TaskError};
use crate::ports::{Notifier, StatStore, TaskStore};
use crate::typed::{Handler, Task, TaskLoader, TaskRegistry};

/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<VacuumTagValues, _>(VacuumHandler)?
///     .expect_tasks(&["tags.vacuum_tag_values"])
///     .build()?;
/// let foreman = app.foreman(config.foreman, store.clone(), stat_store, notifier.clone());
/// ```
pub struct AppBuilder {
    registry: TaskRegistry,
    expected_tasks: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task types: {0:?}; these tasks were expected but cannot be resolved")]
    MissingTaskTypes(Vec<String>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TaskRegistry::new(),
            expected_tasks: Vec::new(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(self, handler: H) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_fn<F, Fut>(self, name: &str, f: F) -> Result<Self, RegistryError>
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.registry.register_fn(name, f)?;
        Ok(self)
    }

    pub fn add_loader(self, loader: Arc<dyn TaskLoader>) -> Self {
        self.registry.add_loader(loader);
        self
    }

    /// `build` が解決できなければならない task name
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks
            .extend(task_types.iter().map(|t| t.to_string()));
        self
    }

    /// 期待されたタスクが 1 つでも解決できなければ失敗（loader 経由の解決も含む）
    pub fn build(self) -> Result<App, BuildError> {
        let missing: Vec<String> = self
            .expected_tasks
            .iter()
            .filter(|name| self.registry.resolve(name).is_err())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingTaskTypes(missing));
        }
        Ok(App {
            registry: Arc::new(self.registry),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct App {
    registry: Arc<TaskRegistry>,
}

impl App {
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn foreman(
        &self,
        config: ForemanConfig,
        store: Arc<dyn TaskStore>,
        stat_store: Arc<dyn StatStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Foreman {
        Foreman::new(config, store, stat_store, self.registry.clone(), notifier)
    }

    pub fn task_queue(&self, store: Arc<dyn TaskStore>, notifier: Arc<dyn Notifier>, eager: bool) -> TaskQueue {
        TaskQueue::new(store, notifier, self.registry.clone()).eager(eager)
    }
}
