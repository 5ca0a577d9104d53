//! Task module - task state machine and the in-memory task store.
//!
//! - `task`: [`Task`], its identifier and the forward-only status machine
//! - `store`: [`TaskStore`], the single owner of all tasks, which also launches
//!   the download pipeline once a task reaches its URL quota

pub mod store;
#[allow(clippy::module_inception)]
pub mod task;

pub use store::{AddUrlsOutcome, InvalidUrl, SharedTaskStore, TaskSnapshot, TaskStore};
pub use task::{Task, TaskError, TaskId, TaskStatus};
