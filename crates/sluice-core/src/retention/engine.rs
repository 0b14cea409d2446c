//! EvictionEngine - total irrelevance の閾値探索
//!
//! # アルゴリズム
//! - `evict_for_size` は total irrelevance の閾値を 1 ずつ下げ、プロジェクトが quota に収まるまで続ける
//! - 各閾値は `(最大 item irrelevance, 最大 age)` の組の族に分かれる
//! - 組ごとに、その age 以上古く item 部分より irrelevant な削除可能イベントを消す
//!
//! ストアは集計の問いにしか答えないので、同じ探索が SQL にもインメモリのヒストグラムにも使える

use std::sync::Arc;

use tracing::{debug, error, info};

use super::irrelevance::{age_irrelevance, age_of_eviction, DEFAULT_AGE_BASE};
use super::store::EventStore;
use crate::config::RetentionConfig;
use crate::domain::ProjectId;
use crate::error::RetentionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub age_base: u32,
    /// DELETE 文 1 回あたりの行数の上限
    pub batch_size: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            age_base: DEFAULT_AGE_BASE,
            batch_size: 500,
        }
    }
}

impl From<&RetentionConfig> for EvictionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            age_base: config.age_base,
            batch_size: config.batch_size.max(1),
        }
    }
}

pub struct EvictionEngine {
    store: Arc<dyn EventStore>,
    policy: EvictionPolicy,
}

impl EvictionEngine {
    pub fn new(store: Arc<dyn EventStore>, policy: EvictionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// 残りが `max_size` 件以下になるまで削除
    ///
    /// - 既に quota 内なら `None`
    /// - それ以外は収めるのに使った閾値 + 1
    /// - 閾値 0 でも多すぎる（固定イベントだけで quota を超える）ときは `QuotaInconsistency`
    pub fn evict_for_size(
        &self,
        project: ProjectId,
        max_size: u64,
        current_epoch: i64,
    ) -> Result<Option<u32>, RetentionError> {
        let initial = self.store.stored_event_count(project)?;
        if initial <= max_size {
            debug!(%project, stored = initial, max_size, "no need to evict");
            return Ok(None);
        }

        let highest = self.highest_total_irrelevance(project, current_epoch)?;
        // +1：ループは先に減らすので、最初の 1 周は何も消えない境界
        let mut candidate = highest.map_or(0, |h| i64::from(h) + 1);
        let mut stored = initial;
        let mut used = None;

        while stored > max_size {
            candidate -= 1;
            let Ok(threshold) = u32::try_from(candidate) else {
                error!(%project, max_size, remaining = stored, "eviction threshold went negative");
                return Err(RetentionError::QuotaInconsistency {
                    project,
                    max_size,
                    remaining: stored,
                });
            };
            let evicted = self.evict(project, threshold, current_epoch)?;
            stored = self.store.stored_event_count(project)?;
            debug!(%project, threshold, evicted, stored, "eviction pass");
            used = Some(threshold);
        }

        info!(
            %project,
            from = initial,
            to = stored,
            threshold = ?used,
            "evicted events down to quota"
        );
        Ok(used.map(|t| t + 1))
    }

    /// total irrelevance が `max_total_irrelevance` を超える削除可能イベントをすべて削除
    /// 削除件数を返す
    pub fn evict(
        &self,
        project: ProjectId,
        max_total_irrelevance: u32,
        current_epoch: i64,
    ) -> Result<u64, RetentionError> {
        let mut evicted = 0;
        for max_item_irrelevance in 0..=max_total_irrelevance {
            let budget = max_total_irrelevance - max_item_irrelevance;
            // age の予算なし：最新の帯、`current_epoch` より後に保存されたイベントも
            // age 0 として数えるよう上限を設けない
            let target_epoch = if budget == 0 {
                i64::MAX
            } else {
                let age = age_of_eviction(budget, self.policy.age_base);
                let Some(epoch) = i64::try_from(age)
                    .ok()
                    .and_then(|age| current_epoch.checked_sub(age))
                    .filter(|epoch| *epoch >= 0)
                else {
                    continue;
                };
                epoch
            };

            if self
                .store
                .count_events_at_or_before(project, target_epoch, max_item_irrelevance)?
                == 0
            {
                continue;
            }
            evicted += self.delete_in_batches(project, target_epoch, max_item_irrelevance)?;
        }
        Ok(evicted)
    }

    fn delete_in_batches(
        &self,
        project: ProjectId,
        epoch: i64,
        max_item_irrelevance: u32,
    ) -> Result<u64, RetentionError> {
        let batch = self.policy.batch_size.max(1);
        let mut deleted = 0;
        loop {
            let n = self
                .store
                .delete_events_at_or_before(project, epoch, max_item_irrelevance, batch)?;
            deleted += n;
            if n < batch as u64 {
                return Ok(deleted);
            }
        }
    }

    /// 削除可能イベントの item + age irrelevance の最大値、なければ `None`
    fn highest_total_irrelevance(
        &self,
        project: ProjectId,
        current_epoch: i64,
    ) -> Result<Option<u32>, RetentionError> {
        let maxima = self.store.max_irrelevance_per_epoch(project)?;
        Ok(maxima
            .into_iter()
            .map(|(epoch, item)| {
                let age = u64::try_from(current_epoch.saturating_sub(epoch)).unwrap_or(0);
                item.saturating_add(age_irrelevance(age, self.policy.age_base))
            })
            .max())
    }
}
