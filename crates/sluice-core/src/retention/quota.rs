//! プロジェクトごとの quota 状態

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::engine::EvictionEngine;
use super::irrelevance::should_evict;
use crate::domain::ProjectId;
use crate::error::RetentionError;

/// プロジェクトのイベント quota と、最後の削除が残したガード
///
/// `max_total_irrelevance` は最後に削除が必要だったとき `evict_for_size` が返した値
/// それ以上のスコアの新規イベントは真っ先に消える側なので、取り込み側は処理を省ける
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectQuota {
    pub project: ProjectId,
    pub retention_max_event_count: u64,
    pub max_total_irrelevance: Option<u32>,
}

impl ProjectQuota {
    pub fn new(project: ProjectId, retention_max_event_count: u64) -> Self {
        Self {
            project,
            retention_max_event_count,
            max_total_irrelevance: None,
        }
    }

    pub fn is_over(&self, stored_event_count: u64) -> bool {
        should_evict(stored_event_count, self.retention_max_event_count)
    }

    /// プロジェクトを quota 内に収め、現在のガードを返す
    ///
    /// 削除が不要ならキャッシュ済みのガードをそのまま返す
    /// なので新しいイベントなしで再度呼んでも何も起きない
    pub fn enforce(
        &mut self,
        engine: &EvictionEngine,
        current_epoch: i64,
    ) -> Result<Option<u32>, RetentionError> {
        if let Some(guard) =
            engine.evict_for_size(self.project, self.retention_max_event_count, current_epoch)?
        {
            self.max_total_irrelevance = Some(guard);
        }
        Ok(self.max_total_irrelevance)
    }
}

/// このプロセスで削除を行った全プロジェクトの quota 状態
///
/// 削除はロックの外で行うので、2 つのプロジェクトが互いを待つことはない
/// ガードはエンジンが終わってから書き戻す
#[derive(Debug, Default)]
pub struct QuotaBook {
    quotas: Mutex<HashMap<ProjectId, ProjectQuota>>,
}

impl QuotaBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, project: ProjectId) -> Option<ProjectQuota> {
        self.lock().get(&project).cloned()
    }

    pub fn guard(&self, project: ProjectId) -> Option<u32> {
        self.lock()
            .get(&project)
            .and_then(|quota| quota.max_total_irrelevance)
    }

    /// プロジェクトの保存済み状態に対する [`ProjectQuota::enforce`]
    /// `retention_max_event_count` は `max_event_count` に更新する
    pub fn enforce(
        &self,
        engine: &EvictionEngine,
        project: ProjectId,
        max_event_count: u64,
        current_epoch: i64,
    ) -> Result<Option<u32>, RetentionError> {
        let mut quota = self
            .get(project)
            .unwrap_or_else(|| ProjectQuota::new(project, max_event_count));
        quota.retention_max_event_count = max_event_count;

        let guard = quota.enforce(engine, current_epoch)?;
        let mut quotas = self.lock();
        let entry = quotas.entry(project).or_insert(quota);
        entry.retention_max_event_count = max_event_count;
        if guard.is_some() {
            entry.max_total_irrelevance = guard;
        }
        Ok(entry.max_total_irrelevance)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProjectId, ProjectQuota>> {
        self.quotas.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
