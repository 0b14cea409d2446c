//! EventStore port - 削除の探索がイベントストレージに求めるもの
//!
//! - 呼び出しは同期：削除は blocking スレッドで動き、各呼び出しは集計クエリ 1 回
//! - `never_evict` のイベントは `stored_event_count` には数えるが、他のメソッドからは見えない

use crate::domain::ProjectId;
use crate::error::StoreError;

pub trait EventStore: Send + Sync {
    /// プロジェクトの全保存イベント（固定イベントを含む）
    fn stored_event_count(&self, project: ProjectId) -> Result<u64, StoreError>;

    /// epoch ごとの、削除可能イベントの最大 item irrelevance
    /// 削除可能イベントのない epoch は含めない
    fn max_irrelevance_per_epoch(&self, project: ProjectId) -> Result<Vec<(i64, u32)>, StoreError>;

    /// `epoch` 以前に保存され、item irrelevance が `max_item_irrelevance` より
    /// 厳密に大きい削除可能イベント
    fn count_events_at_or_before(
        &self,
        project: ProjectId,
        epoch: i64,
        max_item_irrelevance: u32,
    ) -> Result<u64, StoreError>;

    /// `count_events_at_or_before` が数えるイベントを古い順に最大 `limit` 件削除
    /// 削除件数を返す
    fn delete_events_at_or_before(
        &self,
        project: ProjectId,
        epoch: i64,
        max_item_irrelevance: u32,
        limit: usize,
    ) -> Result<u64, StoreError>;
}
