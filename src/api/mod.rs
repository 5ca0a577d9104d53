//! HTTP API for the URL bundler.
//!
//! ## Endpoints
//! - `POST /task` - Create a task
//! - `POST /task/:id` - Submit URLs to a task
//! - `GET /task/:id` - Get task status
//! - `GET /health` - Health check
//! - `GET /archives/:file` - Download a finished archive

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
