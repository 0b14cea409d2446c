//! デプロイの動作確認用サンプルタスク
//!
//! `sluice check` は `examples.fast_task` を積む
//! 残りの 2 つは失敗経路と長時間ワーカーを試す用

use std::time::Duration;

use rand::Rng;
use tracing::info;

use crate::error::{RegistryError, TaskError};
use crate::typed::{TaskLoader, TaskRegistry};

pub const FAST_TASK: &str = "examples.fast_task";
pub const FAILING_TASK: &str = "examples.failing_task";
pub const RANDOM_DURATION: &str = "examples.random_duration";

pub fn register(registry: &TaskRegistry) -> Result<(), RegistryError> {
    registry.register_fn(FAST_TASK, |_| async { Ok(()) })?;
    registry.register_fn(FAILING_TASK, |_| async { Err(TaskError::failed("I am failing")) })?;
    registry.register_fn(RANDOM_DURATION, |_| async {
        let secs = rand::thread_rng().gen_range(0.0..10.0);
        info!(secs, "starting something of a random duration");
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        Ok(())
    })?;
    Ok(())
}

/// `examples` モジュールの初回利用時にサンプルタスクを登録
pub struct ExampleTasks;

impl TaskLoader for ExampleTasks {
    fn load(&self, module: &str, registry: &TaskRegistry) -> Result<(), RegistryError> {
        if module == "examples" {
            register(registry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskArgs;
    use std::sync::Arc;

    #[tokio::test]
    async fn example_tasks_resolve_through_the_loader() {
        let registry = TaskRegistry::new();
        registry.add_loader(Arc::new(ExampleTasks));

        let fast = registry.resolve(FAST_TASK).unwrap();
        assert!(fast.handle_dyn(TaskArgs::default()).await.is_ok());

        let failing = registry.resolve(FAILING_TASK).unwrap();
        assert!(matches!(
            failing.handle_dyn(TaskArgs::default()).await,
            Err(TaskError::Failed(msg)) if msg == "I am failing"
        ));

        assert!(registry.get(RANDOM_DURATION).is_some());
        assert!(registry.resolve("examples.nope").is_err());
    }
}
