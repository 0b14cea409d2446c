//! Typed - 型付き Task API
//!
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait
//! - **内部（Dyn）**: `DynHandler` trait（Registry が保持し、Foreman が実行する形）

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler};
pub use self::registry::{TaskLoader, TaskRegistry};
pub use self::task::Task;
