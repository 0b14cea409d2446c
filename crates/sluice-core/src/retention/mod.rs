//! Retention - 容量ベースのイベント削除
//!
//! プロジェクトの保存イベント数を quota 内に収めるため、irrelevance の高いものから削除する
//! irrelevance はイベントごとのスコアと経過時間（age）の和
//! `never_evict` のイベントは決して削除しない

pub mod engine;
pub mod irrelevance;
pub mod memory;
pub mod quota;
pub mod simulator;
pub mod sqlite;
pub mod store;
pub mod task;

pub use self::engine::{EvictionEngine, EvictionPolicy};
pub use self::irrelevance::{
    age_irrelevance, age_of_eviction, epoch_for, item_irrelevance_for, nonzero_leading_bits,
    should_evict,
};
pub use self::memory::InMemoryEventStore;
pub use self::quota::{ProjectQuota, QuotaBook};
pub use self::simulator::{EpochReport, Simulator};
pub use self::sqlite::SqliteEventStore;
pub use self::store::EventStore;
pub use self::task::{EvictForSize, EvictForSizeHandler};
