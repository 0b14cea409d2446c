//! TaskRegistry - Handler の登録と解決
//!
//! task name を型消去された Handler に対応づける
//!
//! # 登録
//! - insert-if-absent：最初に登録された Handler が勝ち、以降は `AlreadyRegistered`
//! - 同じ登録コードを 2 回走らせても害はない
//!
//! # 遅延ロード
//! - 未登録の名前も `TaskLoader` 経由で解決できる
//! - 名前のモジュール部分（最後の `.` より前）を各 loader に渡し、その後もう一度引く

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use super::handler::{DynHandler, FnHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::TaskArgs;
use crate::error::{RegistryError, TaskError};

/// 1 つのモジュールの Handler を初回利用時に登録する
pub trait TaskLoader: Send + Sync {
    fn load(&self, module: &str, registry: &TaskRegistry) -> Result<(), RegistryError>;
}

#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn DynHandler>>>,
    loaders: RwLock<Vec<Arc<dyn TaskLoader>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(&self, handler: H) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn register_fn<F, Fut>(&self, name: &str, f: F) -> Result<(), RegistryError>
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.register_dyn(Arc::new(FnHandler::new(name, f)))
    }

    pub fn register_dyn(&self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let name = handler.task_type().to_string();
        if handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        handlers.insert(name, handler);
        Ok(())
    }

    pub fn add_loader(&self, loader: Arc<dyn TaskLoader>) {
        self.loaders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(loader);
    }

    /// 登録済みの Handler のみ、loader は見ない
    pub fn get(&self, name: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn DynHandler>, RegistryError> {
        if let Some(handler) = self.get(name) {
            return Ok(handler);
        }

        let Some((module, _)) = name.rsplit_once('.') else {
            return Err(RegistryError::MalformedName(name.to_string()));
        };

        // loader が `handlers` の write lock を取れるよう clone して外に出す
        let loaders: Vec<_> = self
            .loaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for loader in loaders {
            match loader.load(module, self) {
                Ok(()) | Err(RegistryError::AlreadyRegistered(_)) => {}
                Err(e) => return Err(e),
            }
            if let Some(handler) = self.get(name) {
                return Ok(handler);
            }
        }

        Err(RegistryError::TaskNotFound(name.to_string()))
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
