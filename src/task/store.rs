//! In-memory task store.
//!
//! The store owns every [`Task`] plus two derived id sets:
//! - active: tasks that are not terminal, or terminal but not yet observed
//! - completed: terminal tasks that have been read at least once
//!
//! All three live behind one mutex. Critical sections only mutate memory;
//! URL validation and the download pipeline run with the lock released. When a
//! task reaches its URL quota the store snapshots its URL list and spawns the
//! pipeline, which re-acquires the lock once to record the outcome.
//!
//! Dropping the future of [`TaskStore::add_urls`] stops the remaining
//! validations but never a pipeline that was already launched. Pipelines only
//! stop early on [`TaskStore::shutdown`] with `cancel_pipelines_on_shutdown`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::task::{Task, TaskError, TaskId, TaskStatus};
use crate::config::Config;
use crate::pipeline::{Fetcher, Pipeline, PipelineOutcome, Rejection, UrlValidator};

/// Point-in-time view of one task plus the store's id sets.
///
/// Id order is unspecified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task: Task,
    pub active_tasks: Vec<TaskId>,
    pub completed_tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidUrl {
    pub url: String,
    pub reason: Rejection,
    pub message: String,
}

impl InvalidUrl {
    fn new(url: &str, reason: Rejection) -> Self {
        Self {
            url: url.to_string(),
            reason,
            message: reason.message().to_string(),
        }
    }
}

/// Partition of one URL batch. Every submitted URL lands in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddUrlsOutcome {
    #[serde(rename = "valid_urls", default, skip_serializing_if = "Vec::is_empty")]
    pub accepted: Vec<String>,
    #[serde(rename = "invalid_urls", default, skip_serializing_if = "Vec::is_empty")]
    pub invalid: Vec<InvalidUrl>,
    /// URLs that arrived after the task had reached its quota.
    #[serde(rename = "rejected_urls", default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_by_quota: Vec<String>,
}

#[derive(Debug, Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    active: BTreeSet<TaskId>,
    completed: BTreeSet<TaskId>,
}

impl StoreState {
    fn snapshot(&self, task: Task) -> TaskSnapshot {
        TaskSnapshot {
            task,
            active_tasks: self.active.iter().copied().collect(),
            completed_tasks: self.completed.iter().copied().collect(),
        }
    }
}

pub struct TaskStore {
    state: Arc<Mutex<StoreState>>,
    validator: UrlValidator,
    pipeline: Arc<Pipeline>,
    max_active_tasks: usize,
    max_files_per_task: usize,
    task_retention: Option<Duration>,
    cancel_pipelines_on_shutdown: bool,
    pipelines: TaskTracker,
    pipeline_permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

/// Shared task store wrapped in Arc for concurrent access.
pub type SharedTaskStore = Arc<TaskStore>;

impl TaskStore {
    pub fn new(config: &Config, fetcher: Arc<dyn Fetcher>) -> Self {
        Self::with_parts(
            config,
            UrlValidator::from_config(Arc::clone(&fetcher), config),
            Pipeline::from_config(fetcher, config),
        )
    }

    pub fn with_parts(config: &Config, validator: UrlValidator, pipeline: Pipeline) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            validator,
            pipeline: Arc::new(pipeline),
            max_active_tasks: config.max_active_tasks,
            max_files_per_task: config.max_files_per_task,
            task_retention: config.task_retention,
            cancel_pipelines_on_shutdown: config.cancel_pipelines_on_shutdown,
            pipelines: TaskTracker::new(),
            pipeline_permits: Arc::new(Semaphore::new(config.max_concurrent_pipelines)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a task in `pending`, unless the active set is full.
    pub async fn create(&self) -> Result<TaskSnapshot, TaskError> {
        let mut state = self.state.lock().await;

        if state.active.len() >= self.max_active_tasks {
            tracing::warn!(
                active = state.active.len(),
                max = self.max_active_tasks,
                "Server busy, too many active tasks"
            );
            return Err(TaskError::AdmissionRejected {
                active: state.active.len(),
                max: self.max_active_tasks,
            });
        }

        let task = Task::new();
        let id = task.id;
        state.tasks.insert(id, task.clone());
        state.active.insert(id);

        tracing::info!(task_id = %id, "Created task");
        Ok(state.snapshot(task))
    }

    /// Validate and attach `urls` to a task, in order.
    ///
    /// Invalid URLs are reported and skipped. When the quota is reached the
    /// task moves to `processing`, the pipeline starts, and the rest of the
    /// batch is returned as rejected.
    pub async fn add_urls(&self, id: TaskId, urls: &[String]) -> Result<AddUrlsOutcome, TaskError> {
        {
            let state = self.state.lock().await;
            let task = state
                .tasks
                .get(&id)
                .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
            if !task.status.accepts_urls() {
                tracing::warn!(task_id = %id, status = %task.status, "Task is not accepting URLs");
                return Err(TaskError::NotAcceptingSubmissions {
                    id,
                    status: task.status,
                });
            }
        }

        let mut outcome = AddUrlsOutcome::default();

        for (i, raw) in urls.iter().enumerate() {
            if let Err(reason) = self.validator.validate(raw).await {
                tracing::warn!(task_id = %id, url = %raw, reason = %reason, "URL rejected");
                outcome.invalid.push(InvalidUrl::new(raw, reason));
                continue;
            }

            let mut state = self.state.lock().await;
            let task = match state.tasks.get_mut(&id) {
                Some(task) if task.status.accepts_urls() => task,
                // Filled by a concurrent submission while this URL was validated.
                _ => {
                    outcome.rejected_by_quota.extend(urls[i..].iter().cloned());
                    break;
                }
            };

            // Move the status before the URL is stored.
            let fills_quota = task.url_files.len() + 1 >= self.max_files_per_task;
            if let Err(e) = advance_for_url(task, fills_quota) {
                tracing::error!(task_id = %id, error = %e, "Cannot attach URL");
                outcome.rejected_by_quota.extend(urls[i..].iter().cloned());
                break;
            }

            task.url_files.push(raw.clone());
            outcome.accepted.push(raw.clone());

            if fills_quota {
                outcome.rejected_by_quota.extend(urls[i + 1..].iter().cloned());
                let snapshot = task.url_files.clone();
                drop(state);

                tracing::info!(
                    task_id = %id,
                    urls = snapshot.len(),
                    "URL quota reached, starting pipeline"
                );
                self.launch_pipeline(id, snapshot);
                break;
            }
        }

        Ok(outcome)
    }

    /// Current state of a task. Observing a terminal task moves it from the
    /// active set to the completed set.
    pub async fn get_status(&self, id: TaskId) -> Result<TaskSnapshot, TaskError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let task = state
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        if task.status.is_terminal() && state.active.remove(&id) {
            state.completed.insert(id);
            tracing::info!(task_id = %id, status = %task.status, "Task moved to completed");
        }

        Ok(state.snapshot(task))
    }

    /// Drop observed terminal tasks that finished more than the retention ago.
    /// Returns the number removed; always zero without a retention.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.task_retention else {
            return 0;
        };
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let expired: Vec<TaskId> = state
            .completed
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(id)
                    .and_then(|t| t.finished_at)
                    .and_then(|finished| finished.checked_add_signed(retention))
                    .map_or(false, |expiry| expiry < now)
            })
            .copied()
            .collect();

        for id in &expired {
            state.completed.remove(id);
            state.tasks.remove(id);
        }

        if !expired.is_empty() {
            tracing::info!("Pruned {} expired tasks", expired.len());
        }
        expired.len()
    }

    /// Run [`prune_expired`](Self::prune_expired) periodically until shutdown.
    /// Returns `None` when no retention is configured.
    pub fn spawn_retention_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let retention = self.task_retention?;
        let period = retention.clamp(Duration::from_secs(1), Duration::from_secs(60));
        let store = Arc::clone(self);

        Some(tokio::spawn(async move {
            // Cutoffs follow the runtime clock from a wall-clock origin.
            let wall_start = Utc::now();
            let start = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = store.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let elapsed = chrono::Duration::from_std(start.elapsed())
                            .unwrap_or(chrono::Duration::MAX);
                        let now = wall_start.checked_add_signed(elapsed).unwrap_or(wall_start);
                        let pruned = store.prune_expired(now).await;
                        tracing::debug!(pruned, "Retention sweep finished");
                    }
                }
            }
        }))
    }

    /// Stop background work and wait up to `grace` for running pipelines.
    ///
    /// Pipelines are cancelled only if `cancel_pipelines_on_shutdown` is set;
    /// otherwise they keep running until they finish or the grace expires.
    /// Returns `true` if every pipeline finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.pipelines.close();

        let running = self.pipelines.len();
        if running > 0 {
            tracing::info!(
                running,
                cancel = self.cancel_pipelines_on_shutdown,
                "Waiting for running pipelines"
            );
        }

        match tokio::time::timeout(grace, self.pipelines.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "{} pipelines still running after {:?}",
                    self.pipelines.len(),
                    grace
                );
                false
            }
        }
    }

    fn launch_pipeline(&self, id: TaskId, urls: Vec<String>) {
        let state = Arc::clone(&self.state);
        let pipeline = Arc::clone(&self.pipeline);
        let permits = Arc::clone(&self.pipeline_permits);
        let cancel = if self.cancel_pipelines_on_shutdown {
            self.shutdown.child_token()
        } else {
            CancellationToken::new()
        };

        self.pipelines.spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            let outcome = pipeline.run(id, &urls, &cancel).await;
            record_outcome(&state, id, outcome).await;
        });
    }
}

/// Status change for one more accepted URL: the first URL moves `pending` to
/// `add_links`, the URL that fills the quota moves on to `processing`.
fn advance_for_url(task: &mut Task, fills_quota: bool) -> Result<(), TaskError> {
    if task.status == TaskStatus::Pending {
        task.transition(TaskStatus::AddLinks)?;
        tracing::info!(task_id = %task.id, "Task status updated to add_links");
    }
    if fills_quota {
        task.transition(TaskStatus::Processing)?;
    }
    Ok(())
}

async fn record_outcome(state: &Mutex<StoreState>, id: TaskId, outcome: PipelineOutcome) {
    let mut state = state.lock().await;
    let Some(task) = state.tasks.get_mut(&id) else {
        tracing::warn!(task_id = %id, "Pipeline finished for unknown task");
        return;
    };

    let status = outcome.status();
    if let Err(e) = task.transition(status) {
        tracing::error!(task_id = %id, error = %e, "Dropping pipeline outcome");
        return;
    }
    task.errors = outcome.errors;
    task.url_archive = outcome.archive_url;

    tracing::info!(
        task_id = %id,
        status = %status,
        errors = task.errors.len(),
        "Task finished"
    );
}
