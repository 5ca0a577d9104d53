//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::pipeline::{Fetcher, ReqwestFetcher};
use crate::task::{AddUrlsOutcome, SharedTaskStore, TaskError, TaskId, TaskSnapshot, TaskStore};

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub tasks: SharedTaskStore,
}

impl AppState {
    pub fn new(config: Config, fetcher: Arc<dyn Fetcher>) -> Self {
        let tasks = Arc::new(TaskStore::new(&config, fetcher));
        Self { config, tasks }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let archives = ServeDir::new(&state.config.archive_dir);

    Router::new()
        .route("/health", get(health))
        .route("/task", post(create_task))
        .route("/task/:id", get(get_task).post(add_urls))
        .nest_service("/archives", archives)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.download_dir).await?;
    tokio::fs::create_dir_all(&config.archive_dir).await?;

    let fetcher = Arc::new(ReqwestFetcher::from_config(&config)?);
    let state = Arc::new(AppState::new(config.clone(), fetcher));
    let sweeper = state.tasks.spawn_retention_sweeper();

    let app = router(Arc::clone(&state));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!(
        max_active_tasks = config.max_active_tasks,
        max_files_per_task = config.max_files_per_task,
        archive_dir = %config.archive_dir.display(),
        "Accepting tasks"
    );

    // Setup graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, waiting for pipelines...");
    if !state.tasks.shutdown(config.shutdown_grace).await {
        tracing::warn!("Some pipelines did not finish before shutdown");
    }
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Error returned by handlers, rendered as [`ErrorResponse`].
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    request: String,
    error: String,
}

impl ApiError {
    fn new(status: StatusCode, uri: &Uri, error: impl ToString) -> Self {
        Self {
            status,
            request: uri.path().to_string(),
            error: error.to_string(),
        }
    }

    fn from_task_error(uri: &Uri, err: TaskError) -> Self {
        let status = match &err {
            TaskError::AdmissionRejected { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskError::NotAcceptingSubmissions { .. } => StatusCode::CONFLICT,
            TaskError::InvalidTransition { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, uri, err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            request: self.request,
            error: self.error,
        };
        (self.status, Json(body)).into_response()
    }
}

/// A malformed id cannot name an existing task.
fn parse_id(uri: &Uri, raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::from_task_error(uri, TaskError::NotFound(raw.to_string())))
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Create a new task.
async fn create_task(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Json<TaskSnapshot>, ApiError> {
    state
        .tasks
        .create()
        .await
        .map(Json)
        .map_err(|e| ApiError::from_task_error(&uri, e))
}

/// Submit URLs to a task.
async fn add_urls(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Path(id): Path<String>,
    body: Result<Json<AddUrlsRequest>, JsonRejection>,
) -> Result<Json<AddUrlsOutcome>, ApiError> {
    let id = parse_id(&uri, &id)?;
    let Json(req) = body.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, &uri, e.body_text()))?;

    tracing::info!(task_id = %id, urls = req.urls.len(), "Received URLs");

    state
        .tasks
        .add_urls(id, &req.urls)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_task_error(&uri, e))
}

/// Get task status.
async fn get_task(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    let id = parse_id(&uri, &id)?;
    state
        .tasks
        .get_status(id)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_task_error(&uri, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{FakeFetcher, FakeRoute};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct TestServer {
        base: String,
        client: reqwest::Client,
        _downloads: TempDir,
        _archives: TempDir,
    }

    impl TestServer {
        async fn start(fetcher: FakeFetcher, configure: impl FnOnce(&mut Config)) -> Self {
            let downloads = tempdir().unwrap();
            let archives = tempdir().unwrap();

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());

            let mut config = Config {
                download_dir: downloads.path().to_path_buf(),
                archive_dir: archives.path().to_path_buf(),
                public_base_url: base.clone(),
                ..Config::default()
            };
            configure(&mut config);

            let state = Arc::new(AppState::new(config, Arc::new(fetcher)));
            let app = router(state);
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            Self {
                base,
                client: reqwest::Client::new(),
                _downloads: downloads,
                _archives: archives,
            }
        }

        async fn create(&self) -> reqwest::Response {
            self.client
                .post(format!("{}/task", self.base))
                .send()
                .await
                .unwrap()
        }

        async fn create_id(&self) -> String {
            let body: Value = self.create().await.json().await.unwrap();
            body["task"]["id"].as_str().unwrap().to_string()
        }

        async fn add(&self, id: &str, urls: &[String]) -> reqwest::Response {
            self.client
                .post(format!("{}/task/{}", self.base, id))
                .json(&json!({ "urls": urls }))
                .send()
                .await
                .unwrap()
        }

        async fn status(&self, id: &str) -> reqwest::Response {
            self.client
                .get(format!("{}/task/{}", self.base, id))
                .send()
                .await
                .unwrap()
        }

        async fn wait_terminal(&self, id: &str) -> Value {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let body: Value = self.status(id).await.json().await.unwrap();
                    let status = body["task"]["status"].as_str().unwrap_or_default();
                    if status == "completed" || status == "failed" {
                        return body;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .expect("task did not finish")
        }
    }

    fn url(name: &str) -> String {
        format!("http://files.test/{}", name)
    }

    fn files() -> FakeFetcher {
        FakeFetcher::new()
            .route(&url("a.jpg"), FakeRoute::file("image/jpeg", b"jpeg bytes"))
            .route(&url("b.pdf"), FakeRoute::file("application/pdf", b"%PDF-1.4"))
            .route(&url("c.pdf"), FakeRoute::file("application/pdf", b"%PDF-1.7"))
            .route(&url("page.html"), FakeRoute::file("text/html", b"<html>"))
    }

    #[tokio::test]
    async fn test_health() {
        let server = TestServer::start(FakeFetcher::new(), |_| {}).await;
        let body: Value = server
            .client
            .get(format!("{}/health", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_create_returns_snapshot() {
        let server = TestServer::start(FakeFetcher::new(), |_| {}).await;
        let response = server.create().await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["task"]["status"], "pending");
        assert_eq!(body["task"]["url_files"], json!([]));
        assert!(body["task"].get("errors").is_none());
        assert!(body["task"].get("url_archive").is_none());
        assert_eq!(body["active_tasks"], json!([body["task"]["id"]]));
        assert_eq!(body["completed_tasks"], json!([]));
    }

    #[tokio::test]
    async fn test_admission_rejected_is_503() {
        let server = TestServer::start(FakeFetcher::new(), |c| c.max_active_tasks = 1).await;
        server.create_id().await;

        let response = server.create().await;
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["request"], "/task");
        assert_eq!(body["error"], "Server busy: 1 active tasks (max 1)");
    }

    #[tokio::test]
    async fn test_full_flow_produces_downloadable_archive() {
        let server = TestServer::start(files(), |c| c.max_files_per_task = 2).await;
        let id = server.create_id().await;

        let response = server
            .add(&id, &[url("page.html"), url("a.jpg"), url("b.pdf"), url("c.pdf")])
            .await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["valid_urls"], json!([url("a.jpg"), url("b.pdf")]));
        assert_eq!(
            body["invalid_urls"],
            json!([{
                "url": url("page.html"),
                "reason": "disallowed_type",
                "message": "invalid file extension",
            }])
        );
        assert_eq!(body["rejected_urls"], json!([url("c.pdf")]));

        let done = server.wait_terminal(&id).await;
        assert_eq!(done["task"]["status"], "completed");
        assert_eq!(done["active_tasks"], json!([]));
        assert_eq!(done["completed_tasks"], json!([id]));

        let archive_url = done["task"]["url_archive"].as_str().unwrap().to_string();
        assert_eq!(archive_url, format!("{}/archives/{}.zip", server.base, id));

        let archive = server.client.get(&archive_url).send().await.unwrap();
        assert_eq!(archive.status(), reqwest::StatusCode::OK);
        let bytes = archive.bytes().await.unwrap();
        let zip = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_lists_are_omitted() {
        let server = TestServer::start(files(), |_| {}).await;
        let id = server.create_id().await;

        let body: Value = server.add(&id, &[url("a.jpg")]).await.json().await.unwrap();
        assert_eq!(body, json!({ "valid_urls": [url("a.jpg")] }));

        let body: Value = server.status(&id).await.json().await.unwrap();
        assert_eq!(body["task"]["status"], "add_links");
    }

    #[tokio::test]
    async fn test_submitting_to_processing_task_is_409() {
        let fetcher = files().with_fetch_delay(Duration::from_millis(300));
        let server = TestServer::start(fetcher, |c| c.max_files_per_task = 1).await;
        let id = server.create_id().await;

        server.add(&id, &[url("a.jpg")]).await;
        let response = server.add(&id, &[url("b.pdf")]).await;
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["request"], format!("/task/{}", id));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids_are_404() {
        let server = TestServer::start(FakeFetcher::new(), |_| {}).await;

        let unknown = TaskId::new().to_string();
        let response = server.status(&unknown).await;
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = server.status("not-a-uuid").await;
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["request"], "/task/not-a-uuid");
        assert_eq!(body["error"], "Task not-a-uuid not found");

        let response = server.add(&unknown, &[url("a.jpg")]).await;
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let server = TestServer::start(FakeFetcher::new(), |_| {}).await;
        let id = server.create_id().await;

        let response = server
            .client
            .post(format!("{}/task/{}", server.base, id))
            .header("content-type", "application/json")
            .body("{\"urls\": 42}")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["request"], format!("/task/{}", id));
        assert!(!body["error"].as_str().unwrap().is_empty());
    }
}
