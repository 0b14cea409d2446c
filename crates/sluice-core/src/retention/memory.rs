//! InMemoryEventStore - プロジェクトごとの `(epoch, irrelevance)` ヒストグラム
//!
//! 個々のイベントは持たず、セルごとの件数だけ
//! シミュレータ用、および SQLite ストアのテストの基準

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use super::store::EventStore;
use crate::domain::ProjectId;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cell {
    evictable: u64,
    pinned: u64,
}

type Histogram = BTreeMap<(i64, u32), Cell>;

#[derive(Default)]
pub struct InMemoryEventStore {
    projects: Mutex<HashMap<ProjectId, Histogram>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, project: ProjectId, epoch: i64, irrelevance: u32, never_evict: bool) {
        self.add_many(project, epoch, irrelevance, 1, never_evict);
    }

    pub fn add_many(&self, project: ProjectId, epoch: i64, irrelevance: u32, count: u64, never_evict: bool) {
        let mut projects = self.lock();
        let cell = projects
            .entry(project)
            .or_default()
            .entry((epoch, irrelevance))
            .or_default();
        if never_evict {
            cell.pinned += count;
        } else {
            cell.evictable += count;
        }
    }

    /// `(epoch, irrelevance)` ごとの保存件数（固定イベントを含む）
    /// 空のセルは含めない
    pub fn histogram(&self, project: ProjectId) -> BTreeMap<(i64, u32), u64> {
        let projects = self.lock();
        projects
            .get(&project)
            .map(|h| {
                h.iter()
                    .map(|(key, cell)| (*key, cell.evictable + cell.pinned))
                    .filter(|(_, n)| *n > 0)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pinned_count(&self, project: ProjectId) -> u64 {
        self.lock()
            .get(&project)
            .map_or(0, |h| h.values().map(|c| c.pinned).sum())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProjectId, Histogram>> {
        self.projects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventStore for InMemoryEventStore {
    fn stored_event_count(&self, project: ProjectId) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .get(&project)
            .map_or(0, |h| h.values().map(|c| c.evictable + c.pinned).sum()))
    }

    fn max_irrelevance_per_epoch(&self, project: ProjectId) -> Result<Vec<(i64, u32)>, StoreError> {
        let projects = self.lock();
        let mut maxima: BTreeMap<i64, u32> = BTreeMap::new();
        if let Some(histogram) = projects.get(&project) {
            for ((epoch, irrelevance), cell) in histogram {
                if cell.evictable > 0 {
                    let max = maxima.entry(*epoch).or_default();
                    *max = (*max).max(*irrelevance);
                }
            }
        }
        Ok(maxima.into_iter().collect())
    }

    fn count_events_at_or_before(
        &self,
        project: ProjectId,
        epoch: i64,
        max_item_irrelevance: u32,
    ) -> Result<u64, StoreError> {
        let projects = self.lock();
        Ok(projects.get(&project).map_or(0, |h| {
            h.iter()
                .filter(|((e, irr), _)| *e <= epoch && *irr > max_item_irrelevance)
                .map(|(_, cell)| cell.evictable)
                .sum()
        }))
    }

    fn delete_events_at_or_before(
        &self,
        project: ProjectId,
        epoch: i64,
        max_item_irrelevance: u32,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let mut projects = self.lock();
        let Some(histogram) = projects.get_mut(&project) else {
            return Ok(0);
        };

        let mut remaining = limit as u64;
        let mut deleted = 0;
        // BTreeMap は epoch 優先の順、つまり古い順
        for ((e, irr), cell) in histogram.iter_mut() {
            if remaining == 0 || *e > epoch {
                break;
            }
            if *irr <= max_item_irrelevance {
                continue;
            }
            let n = cell.evictable.min(remaining);
            cell.evictable -= n;
            remaining -= n;
            deleted += n;
        }
        histogram.retain(|_, cell| cell.evictable + cell.pinned > 0);
        Ok(deleted)
    }
}
