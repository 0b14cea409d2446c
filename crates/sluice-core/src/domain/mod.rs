//! Domain - ID、キュー上のタスクレコード、統計バケット

pub mod ids;
pub mod stats;
pub mod task;

pub use ids::{EventId, Id, IdMarker, ProjectId, TaskId};
pub use stats::{StatBucket, StatRecord, StatSummary};
pub use task::{NewTask, TaskArgs, TaskRecord};
