//! StatStore port - 分単位バケットの永続タスク統計

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{StatRecord, StatSummary};
use crate::error::StoreError;

#[async_trait]
pub trait StatStore: Send + Sync {
    async fn write(&self, records: Vec<StatRecord>) -> Result<(), StoreError>;

    /// `cutoff` より厳密に古いバケットを削除し、削除件数を返す
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// `since` 以降のバケットを task name ごとに集計（名前順）
    async fn summary(&self, since: DateTime<Utc>) -> Result<Vec<StatSummary>, StoreError>;
}
