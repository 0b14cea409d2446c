//! store ports の SQLite 実装

pub mod store;
pub mod timed;

pub use self::store::SqliteStore;
pub use self::timed::TimedConnection;
