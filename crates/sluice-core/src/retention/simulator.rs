//! Retention シミュレータ
//!
//! 1 つのプロジェクトに epoch ごとにランダムなスコアのイベントを入れ、毎 epoch 後に quota まで削除する
//! ポリシーが残す形を確認できる（`sluice simulate`）

use std::fmt::Write;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::engine::{EvictionEngine, EvictionPolicy};
use super::irrelevance::item_irrelevance_for;
use super::memory::InMemoryEventStore;
use super::store::EventStore;
use crate::domain::ProjectId;
use crate::error::RetentionError;

const PROJECT: ProjectId = ProjectId::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochReport {
    pub epoch: i64,
    pub stored_before: u64,
    pub stored_after: u64,
    pub guard: Option<u32>,
}

pub struct Simulator {
    store: Arc<InMemoryEventStore>,
    engine: EvictionEngine,
    rng: StdRng,
    max_size: u64,
    epoch: i64,
}

impl Simulator {
    pub fn new(seed: u64, max_size: u64, policy: EvictionPolicy) -> Self {
        let store = Arc::new(InMemoryEventStore::new());
        Self {
            engine: EvictionEngine::new(store.clone(), policy),
            store,
            rng: StdRng::seed_from_u64(seed),
            max_size,
            epoch: 0,
        }
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    /// 現在の epoch に `inflow` 件のイベントを保存し、サイズで削除して次の epoch へ進む
    pub fn step(&mut self, inflow: u64) -> Result<EpochReport, RetentionError> {
        let stored = self.store.stored_event_count(PROJECT)?;
        for n in 0..inflow {
            // 各イベントは自分自身を含む件数に対してスコアを付ける
            let irrelevance = item_irrelevance_for(stored + 1 + n, &mut self.rng);
            self.store.add(PROJECT, self.epoch, irrelevance, false);
        }
        let stored_before = self.store.stored_event_count(PROJECT)?;

        let guard = self
            .engine
            .evict_for_size(PROJECT, self.max_size, self.epoch)?;
        let report = EpochReport {
            epoch: self.epoch,
            stored_before,
            stored_after: self.store.stored_event_count(PROJECT)?,
            guard,
        };
        self.epoch += 1;
        Ok(report)
    }

/// ヒストグラムの表：epoch ごとに 1 列、item irrelevance ごとに 1 行、最後に合計行
    pub fn render(&self) -> String {
        let histogram = self.store.histogram(PROJECT);
        let mut out = String::new();
        if histogram.is_empty() {
            out.push_str("(empty)\n");
            return out;
        }

        let max_epoch = histogram.keys().map(|(e, _)| *e).max().unwrap_or(0);
        let max_irrelevance = histogram.keys().map(|(_, i)| *i).max().unwrap_or(0);
        let max_count = histogram.values().copied().max().unwrap_or(0);
        let width = max_count.to_string().len() + 2;

        let _ = write!(out, "{:6}", "");
        for epoch in 0..=max_epoch {
            let _ = write!(out, "{epoch:>width$}");
        }
        out.push('\n');

        for irrelevance in 0..=max_irrelevance {
            let _ = write!(out, "{irrelevance:6}");
            for epoch in 0..=max_epoch {
                let n = histogram.get(&(epoch, irrelevance)).copied().unwrap_or(0);
                let _ = write!(out, "{n:>width$}");
            }
            out.push('\n');
        }

        out.push_str("total ");
        for epoch in 0..=max_epoch {
            let total: u64 = histogram
                .iter()
                .filter(|((e, _), _)| *e == epoch)
                .map(|(_, n)| *n)
                .sum();
            let _ = write!(out, "{total:>width$}");
        }
        out.push('\n');
        out
    }
}
