//! Impls - ports の実装
//!
//! - **InMemoryTaskStore / InMemoryStatStore**: 単一プロセス・テスト用
//! - **SqliteStore**: 永続化されたタスクキューと統計テーブル
//! - **MemoryNotifier / FileNotifier**: wakeup チャネル（プロセス内 / プロセス間）

pub mod file_notifier;
pub mod memory_notifier;
pub mod memory_store;
pub mod sqlite;

pub use self::file_notifier::FileNotifier;
pub use self::memory_notifier::MemoryNotifier;
pub use self::memory_store::{InMemoryStatStore, InMemoryTaskStore};
pub use self::sqlite::{SqliteStore, TimedConnection};
