//! `retention.evict_for_size` - キューに積まれる削除タスク

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::engine::EvictionEngine;
use super::irrelevance::epoch_for;
use super::quota::QuotaBook;
use crate::domain::ProjectId;
use crate::error::{RegistryError, TaskError};
use crate::ports::Clock;
use crate::typed::{Handler, Task, TaskRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictForSize {
    pub project: ProjectId,
    pub max_event_count: u64,
    /// 省略時はタスクが動く epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<i64>,
}

impl Task for EvictForSize {
    const TYPE: &'static str = "retention.evict_for_size";
}

/// エンジンを実行し、結果のガードを共有の [`QuotaBook`] に記録する
/// 同じプロセスの取り込み側がそれを読める
pub struct EvictForSizeHandler {
    engine: Arc<EvictionEngine>,
    quotas: Arc<QuotaBook>,
    clock: Arc<dyn Clock>,
    epoch_seconds: i64,
}

impl EvictForSizeHandler {
    pub fn new(
        engine: Arc<EvictionEngine>,
        quotas: Arc<QuotaBook>,
        clock: Arc<dyn Clock>,
        epoch_seconds: i64,
    ) -> Self {
        Self {
            engine,
            quotas,
            clock,
            epoch_seconds,
        }
    }
}

#[async_trait]
impl Handler<EvictForSize> for EvictForSizeHandler {
    async fn handle(&self, task: EvictForSize) -> Result<(), TaskError> {
        let epoch = task
            .epoch
            .unwrap_or_else(|| epoch_for(self.clock.now(), self.epoch_seconds));
        let (project, max_event_count) = (task.project, task.max_event_count);
        let (engine, quotas) = (self.engine.clone(), self.quotas.clone());
        let guard = tokio::task::spawn_blocking(move || {
            quotas.enforce(&engine, project, max_event_count, epoch)
        })
        .await
        .map_err(|e| TaskError::Panicked(e.to_string()))??;

        info!(%project, epoch, guard = ?guard, "evict_for_size done");
        Ok(())
    }
}

pub fn register(
    registry: &TaskRegistry,
    engine: Arc<EvictionEngine>,
    quotas: Arc<QuotaBook>,
    clock: Arc<dyn Clock>,
    epoch_seconds: i64,
) -> Result<(), RegistryError> {
    registry.register::<EvictForSize, _>(EvictForSizeHandler::new(
        engine,
        quotas,
        clock,
        epoch_seconds,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskArgs;
    use crate::ports::FixedClock;
    use crate::retention::{EventStore, EvictionPolicy, InMemoryEventStore};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const P: ProjectId = ProjectId::new(3);

    fn setup() -> (Arc<InMemoryEventStore>, Arc<QuotaBook>, TaskRegistry) {
        let store = Arc::new(InMemoryEventStore::new());
        let engine = Arc::new(EvictionEngine::new(store.clone(), EvictionPolicy::default()));
        let quotas = Arc::new(QuotaBook::new());
        // 1970-01-11 10:00 は epoch 250
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(1970, 1, 11, 10, 0, 0).unwrap()));
        let registry = TaskRegistry::new();
        register(&registry, engine, quotas.clone(), clock, 3600).unwrap();
        (store, quotas, registry)
    }

    #[tokio::test]
    async fn evicts_using_the_current_epoch() {
        let (store, quotas, registry) = setup();
        store.add_many(P, 250, 0, 10, false);
        store.add_many(P, 250, 3, 10, false);

        let mut kwargs = serde_json::Map::new();
        kwargs.insert("project".into(), json!(3));
        kwargs.insert("max_event_count".into(), json!(12));
        registry
            .resolve(EvictForSize::TYPE)
            .unwrap()
            .handle_dyn(TaskArgs::keyword(kwargs))
            .await
            .unwrap();

        assert_eq!(store.stored_event_count(P).unwrap(), 10);
        assert_eq!(quotas.guard(P), Some(3));
    }

    #[tokio::test]
    async fn guard_survives_a_run_with_nothing_to_evict() {
        let (store, quotas, registry) = setup();
        store.add_many(P, 250, 0, 10, false);
        store.add_many(P, 250, 3, 10, false);
        let handler = registry.resolve(EvictForSize::TYPE).unwrap();
        let task = EvictForSize {
            project: P,
            max_event_count: 12,
            epoch: None,
        };

        handler.handle_dyn(task.to_args().unwrap()).await.unwrap();
        handler.handle_dyn(task.to_args().unwrap()).await.unwrap();

        assert_eq!(quotas.guard(P), Some(3));
        assert_eq!(store.stored_event_count(P).unwrap(), 10);
    }

    #[tokio::test]
    async fn unsatisfiable_quota_fails_the_task() {
        let (store, quotas, registry) = setup();
        store.add_many(P, 10, 0, 5, true);

        let task = EvictForSize {
            project: P,
            max_event_count: 1,
            epoch: Some(10),
        };
        let err = registry
            .resolve(EvictForSize::TYPE)
            .unwrap()
            .handle_dyn(task.to_args().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::Failed(msg) if msg.contains("unsatisfiable")));
        assert_eq!(quotas.guard(P), None);
    }
}
