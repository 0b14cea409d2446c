//! App - アプリケーション層
//!
//! ports を組み合わせて動くシステムにする
//!
//! # 主要コンポーネント
//! - **AppBuilder**: Registry のワイヤリングと起動時検証
//! - **Foreman**: ディスパッチループ、ワーカースロット、graceful shutdown
//! - **Workers**: 実行中ワーカーの追跡
//! - **Stats**: 分単位の実行カウンタ
//! - **TaskQueue**: enqueue 側（即時 / eager / deferred）

pub mod builder;
pub mod client;
pub mod example_tasks;
pub mod foreman;
pub mod pidfile;
pub mod signals;
pub mod stats;
pub mod workers;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::client::{DeferredEnqueue, Enqueued, TaskQueue};
pub use self::foreman::{Foreman, ForemanHandle, ForemanState};
pub use self::pidfile::PidFile;
pub use self::signals::forward_signals;
pub use self::stats::Stats;
pub use self::workers::{WorkerInfo, Workers};
