//! Ports - 抽象化レイヤー
//!
//! キュー本体と外界の境界はすべてここの trait
//! （タスク / 統計ストア、wakeup チャネル、時計、エラー報告、enqueue・実行フック）
//! 実装は `impls` にある

pub mod clock;
pub mod context;
pub mod notifier;
pub mod reporter;
pub mod stat_store;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::context::{NoContext, TaskContext, TaskFuture};
pub use self::notifier::Notifier;
pub use self::reporter::{ErrorReporter, LogReporter};
pub use self::stat_store::StatStore;
pub use self::task_store::TaskStore;
