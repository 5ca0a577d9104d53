//! # URL Bundler
//!
//! An HTTP service that gathers file URLs into tasks, downloads them
//! concurrently and bundles the results into one zip archive per task.
//!
//! ## Task Flow
//! 1. Client creates a task (bounded by the active-task cap)
//! 2. Client submits URLs; each one is checked for reachability and type
//! 3. Once the task holds its URL quota, the download pipeline starts
//! 4. Files are downloaded in parallel, zipped, then removed
//! 5. Client polls the task until it is `completed` or `failed`
//!
//! ```text
//! pending ──> add_links ──> processing ──┬──> completed
//!                                        └──> failed
//! ```
//!
//! ## Modules
//! - `task`: Task state machine and the in-memory task store
//! - `pipeline`: URL validation, downloading and archiving
//! - `api`: HTTP routes
//! - `config`: Environment-driven configuration

pub mod api;
pub mod config;
pub mod pipeline;
pub mod task;

pub use config::Config;
