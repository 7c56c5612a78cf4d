// SPDX-License-Identifier: MIT
//! Task units (spec §4.8): heavy-inbound turns are offloaded here instead of
//! running inline under the dispatch engine's coalescing window. Each task
//! carries a content-derived idempotency key, runs under a per-route
//! concurrency cap, retries on timeout/failure, and persists its lifecycle
//! under the owning route's directory so a restart doesn't silently re-run
//! (or silently drop) work in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qqgate_core::{
    AgentReplyOptions, AgentRunOutcome, AgentRuntime, DeliverReply, DropReason, Route,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// A completed task key suppresses re-execution for this long (spec §3,
/// §4.8: "a completed task key suppresses re-execution for 24 hours"), not
/// forever.
const IDEMPOTENCY_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_key: String,
    pub route: String,
    pub dispatch_id: String,
    pub state: TaskState,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// `sha256("<route>|<normalized text>|<media fingerprint>")`, truncated —
/// stable across retries of the same logical turn, distinct across turns.
pub fn compute_task_key(route: &Route, text: &str, media_fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(route.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(text.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(media_fingerprint.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Lifecycle persistence under each route's own directory (spec §6
/// "Persisted layout"), the same `sessions_root`-rooted, route-scoped,
/// read/write-on-demand shape `RouteStore` uses — no in-memory cache, so a
/// restart never has to reload anything. Three files per route, under
/// `meta/`:
/// - `task-state.json` — the most recent transition, any task key.
/// - `task-lifecycle.ndjson` — append-only history of every transition,
///   including idempotent-skip lines.
/// - `task-<taskKey>.json` — the latest record for that specific key, the
///   idempotency ledger `find_recent_completed` consults.
pub struct TaskStore {
    sessions_root: PathBuf,
}

impl TaskStore {
    pub fn new(sessions_root: impl Into<PathBuf>) -> Self {
        Self { sessions_root: sessions_root.into() }
    }

    fn meta_dir(&self, route: &Route) -> PathBuf {
        self.sessions_root.join(qqgate_core::route_dir_name(route)).join("meta")
    }
    fn state_path(&self, route: &Route) -> PathBuf {
        self.meta_dir(route).join("task-state.json")
    }
    fn lifecycle_path(&self, route: &Route) -> PathBuf {
        self.meta_dir(route).join("task-lifecycle.ndjson")
    }
    fn task_path(&self, route: &Route, task_key: &str) -> PathBuf {
        self.meta_dir(route).join(format!("task-{task_key}.json"))
    }

    fn load_task_record(&self, route: &Route, task_key: &str) -> Option<TaskRecord> {
        let data = std::fs::read_to_string(self.task_path(route, task_key)).ok()?;
        serde_json::from_str(&data).ok()
    }

    /// A prior terminal record for `task_key`, but only if it's still
    /// within the idempotency suppression window (spec §3/§4.8: 24h from
    /// completion, not forever).
    pub fn find_recent_completed(&self, route: &Route, task_key: &str, now_ms: i64) -> Option<TaskRecord> {
        let record = self.load_task_record(route, task_key)?;
        let terminal =
            matches!(record.state, TaskState::Succeeded | TaskState::Failed | TaskState::Timeout);
        if terminal && now_ms.saturating_sub(record.updated_at_ms) < IDEMPOTENCY_WINDOW_MS {
            Some(record)
        } else {
            None
        }
    }

    /// Writes `record` as the route's latest state, the per-key record, and
    /// appends it to the lifecycle ndjson — all three files on every
    /// transition (queued/running/succeeded/failed/timeout).
    fn persist_transition(&self, route: &Route, record: &TaskRecord) {
        if let Err(err) = std::fs::create_dir_all(self.meta_dir(route)) {
            tracing::warn!(error = %err, "task meta directory create failed");
            return;
        }
        match serde_json::to_string_pretty(record) {
            Ok(s) => {
                if let Err(err) = std::fs::write(self.state_path(route), &s) {
                    tracing::warn!(error = %err, "task state write failed");
                }
                if let Err(err) = std::fs::write(self.task_path(route, &record.task_key), &s) {
                    tracing::warn!(error = %err, "task record write failed");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "task record serialize failed");
                return;
            }
        }
        self.append_lifecycle(route, record);
    }

    fn append_lifecycle(&self, route: &Route, record: &TaskRecord) {
        let line = match serde_json::to_string(record) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "task lifecycle serialize failed");
                return;
            }
        };
        use std::io::Write as _;
        match std::fs::OpenOptions::new().create(true).append(true).open(self.lifecycle_path(route)) {
            Ok(mut f) => {
                if let Err(err) = writeln!(f, "{line}") {
                    tracing::warn!(error = %err, "task lifecycle append failed");
                }
            }
            Err(err) => tracing::warn!(error = %err, "task lifecycle open failed"),
        }
    }

    /// Records an `idempotent_replay_skipped` lifecycle line for a
    /// deduped call (spec §4.8, scenario S5). Only the ndjson history gets
    /// a new line — `task-state.json`/`task-<key>.json` are left holding
    /// the original completed record so the 24h suppression window keeps
    /// counting from the real completion, not from this replay.
    fn record_idempotent_skip(&self, route: &Route, prior: &TaskRecord, dispatch_id: &str, now_ms: i64) {
        if let Err(err) = std::fs::create_dir_all(self.meta_dir(route)) {
            tracing::warn!(error = %err, "task meta directory create failed");
            return;
        }
        let skip = TaskRecord {
            task_key: prior.task_key.clone(),
            route: route.to_string(),
            dispatch_id: dispatch_id.to_string(),
            state: prior.state,
            attempt: prior.attempt,
            error_reason: Some("idempotent_replay_skipped".to_string()),
            created_at_ms: prior.created_at_ms,
            updated_at_ms: now_ms,
        };
        self.append_lifecycle(route, &skip);
    }
}

/// Runs heavy-turn agent invocations with a per-route concurrency cap,
/// retry-on-failure, and idempotent suppression of already-completed keys.
pub struct TaskUnits {
    store: TaskStore,
    semaphores: Mutex<HashMap<Route, Arc<Semaphore>>>,
    max_concurrency: usize,
}

pub enum TaskOutcome {
    Ran(AgentRunOutcome),
    Duplicate,
}

impl TaskUnits {
    /// `sessions_root` is the same directory `RouteStore` is rooted at —
    /// task lifecycle files live under each route's own `meta/` folder
    /// alongside its `agent.json`/`usage.json` (spec §6).
    pub fn new(sessions_root: impl Into<PathBuf>, max_concurrency: usize) -> Self {
        Self {
            store: TaskStore::new(sessions_root),
            semaphores: Mutex::new(HashMap::new()),
            max_concurrency: max_concurrency.max(1),
        }
    }

    fn semaphore_for(&self, route: &Route) -> Arc<Semaphore> {
        self.semaphores
            .lock()
            .expect("semaphores mutex poisoned")
            .entry(route.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrency)))
            .clone()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run_agent_task(
        &self,
        agent: &dyn AgentRuntime,
        opts: AgentReplyOptions,
        deliver: &(dyn DeliverReply),
        cancel: CancellationToken,
        task_key: String,
        max_retries: u32,
        attempt_timeout: Duration,
        now_ms: i64,
    ) -> Result<TaskOutcome, DropReason> {
        if let Some(prior) = self.store.find_recent_completed(&opts.route, &task_key, now_ms) {
            self.store.record_idempotent_skip(&opts.route, &prior, &opts.dispatch_id, now_ms);
            return Ok(TaskOutcome::Duplicate);
        }

        let mut record = TaskRecord {
            task_key: task_key.clone(),
            route: opts.route.to_string(),
            dispatch_id: opts.dispatch_id.clone(),
            state: TaskState::Queued,
            attempt: 0,
            error_reason: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        self.store.persist_transition(&opts.route, &record);

        let sem = self.semaphore_for(&opts.route);
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                record.state = TaskState::Failed;
                record.error_reason = Some("cancelled".to_string());
                self.store.persist_transition(&opts.route, &record);
                return Err(DropReason::DispatchAborted);
            }
            permit = sem.acquire_owned() => permit.expect("semaphore closed"),
        };

        record.state = TaskState::Running;
        self.store.persist_transition(&opts.route, &record);

        let mut last_timed_out = false;
        for attempt in 0..=max_retries {
            record.attempt = attempt;
            if cancel.is_cancelled() {
                record.state = TaskState::Failed;
                record.error_reason = Some("cancelled".to_string());
                self.store.persist_transition(&opts.route, &record);
                drop(permit);
                return Err(DropReason::DispatchAborted);
            }
            let run_fut = agent.run(opts.clone(), deliver, cancel.clone());
            match tokio::time::timeout(attempt_timeout, run_fut).await {
                Ok(Ok(outcome)) => {
                    record.state = TaskState::Succeeded;
                    record.error_reason = None;
                    self.store.persist_transition(&opts.route, &record);
                    drop(permit);
                    return Ok(TaskOutcome::Ran(outcome));
                }
                Ok(Err(err)) => {
                    tracing::warn!(task_key = %task_key, error = %err, "task attempt failed");
                    last_timed_out = false;
                }
                Err(_elapsed) => {
                    tracing::warn!(task_key = %task_key, "task attempt timed out");
                    last_timed_out = true;
                }
            }
        }

        record.state = if last_timed_out { TaskState::Timeout } else { TaskState::Failed };
        record.error_reason = Some(if last_timed_out { "timeout".to_string() } else { "unknown_error".to_string() });
        self.store.persist_transition(&opts.route, &record);
        drop(permit);
        if last_timed_out {
            Err(DropReason::DispatchTimeout)
        } else {
            Err(DropReason::UnknownError)
        }
    }
}

pub fn task_root(base: &Path, route: &Route) -> PathBuf {
    base.join(qqgate_core::route_dir_name(route)).join("tasks")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qqgate_core::{AgentReplySegment, AgentRunError, SessionKey};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct CountingAgent {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl AgentRuntime for CountingAgent {
        async fn run(
            &self,
            _opts: AgentReplyOptions,
            _deliver: &(dyn DeliverReply),
            _cancel: CancellationToken,
        ) -> Result<AgentRunOutcome, AgentRunError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(AgentRunError("boom".into()))
            } else {
                Ok(AgentRunOutcome::Completed)
            }
        }
        async fn ensure_agent(&self, _session_key: &SessionKey) -> Result<(), AgentRunError> {
            Ok(())
        }
    }

    struct NullDeliver;
    #[async_trait]
    impl DeliverReply for NullDeliver {
        async fn deliver(&self, _segment: AgentReplySegment) {}
    }

    fn opts(route: Route) -> AgentReplyOptions {
        AgentReplyOptions {
            route: route.clone(),
            session_key: "agent:main:main".into(),
            msg_id: None,
            dispatch_id: "d1".into(),
            text: "hi".into(),
            media_urls: vec![],
            media_items_total: 0,
            fast_ack_sent: false,
        }
    }

    #[test]
    fn task_key_stable_for_same_inputs() {
        let route = Route::User("2151539153".into());
        let a = compute_task_key(&route, "hello", "");
        let b = compute_task_key(&route, "hello", "");
        assert_eq!(a, b);
        let c = compute_task_key(&route, "hello world", "");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_agent_succeeds() {
        let dir = tempdir().unwrap();
        let units = TaskUnits::new(dir.path(), 2);
        let agent = CountingAgent { calls: AtomicU32::new(0), fail_times: 0 };
        let route = Route::User("2151539153".into());
        let result = units
            .run_agent_task(
                &agent,
                opts(route),
                &NullDeliver,
                CancellationToken::new(),
                "key-1".into(),
                2,
                Duration::from_millis(200),
                1000,
            )
            .await
            .unwrap();
        assert!(matches!(result, TaskOutcome::Ran(AgentRunOutcome::Completed)));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let dir = tempdir().unwrap();
        let units = TaskUnits::new(dir.path(), 2);
        let agent = CountingAgent { calls: AtomicU32::new(0), fail_times: 2 };
        let route = Route::User("2151539153".into());
        let result = units
            .run_agent_task(
                &agent,
                opts(route),
                &NullDeliver,
                CancellationToken::new(),
                "key-2".into(),
                3,
                Duration::from_millis(200),
                1000,
            )
            .await
            .unwrap();
        assert!(matches!(result, TaskOutcome::Ran(AgentRunOutcome::Completed)));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_retries_returns_unknown_error() {
        let dir = tempdir().unwrap();
        let units = TaskUnits::new(dir.path(), 2);
        let agent = CountingAgent { calls: AtomicU32::new(0), fail_times: 100 };
        let route = Route::User("2151539153".into());
        let err = units
            .run_agent_task(
                &agent,
                opts(route),
                &NullDeliver,
                CancellationToken::new(),
                "key-3".into(),
                1,
                Duration::from_millis(200),
                1000,
            )
            .await
            .unwrap_err();
        assert_eq!(err, DropReason::UnknownError);
    }

    #[tokio::test]
    async fn duplicate_task_key_is_suppressed_after_completion() {
        let dir = tempdir().unwrap();
        let units = TaskUnits::new(dir.path(), 2);
        let agent = CountingAgent { calls: AtomicU32::new(0), fail_times: 0 };
        let route = Route::User("2151539153".into());
        units
            .run_agent_task(
                &agent,
                opts(route.clone()),
                &NullDeliver,
                CancellationToken::new(),
                "key-4".into(),
                0,
                Duration::from_millis(200),
                1000,
            )
            .await
            .unwrap();
        let result = units
            .run_agent_task(
                &agent,
                opts(route),
                &NullDeliver,
                CancellationToken::new(),
                "key-4".into(),
                0,
                Duration::from_millis(200),
                1001,
            )
            .await
            .unwrap();
        assert!(matches!(result, TaskOutcome::Duplicate));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_within_window_appends_idempotent_skip_to_lifecycle() {
        let dir = tempdir().unwrap();
        let units = TaskUnits::new(dir.path(), 2);
        let agent = CountingAgent { calls: AtomicU32::new(0), fail_times: 0 };
        let route = Route::User("2151539153".into());
        units
            .run_agent_task(
                &agent,
                opts(route.clone()),
                &NullDeliver,
                CancellationToken::new(),
                "key-5".into(),
                0,
                Duration::from_millis(200),
                1_000,
            )
            .await
            .unwrap();
        units
            .run_agent_task(
                &agent,
                opts(route.clone()),
                &NullDeliver,
                CancellationToken::new(),
                "key-5".into(),
                0,
                Duration::from_millis(200),
                2_000,
            )
            .await
            .unwrap();

        let lifecycle = std::fs::read_to_string(
            dir.path().join(qqgate_core::route_dir_name(&route)).join("meta").join("task-lifecycle.ndjson"),
        )
        .unwrap();
        assert!(lifecycle.lines().any(|line| line.contains("idempotent_replay_skipped")));
    }

    #[tokio::test]
    async fn duplicate_outside_window_runs_again() {
        let dir = tempdir().unwrap();
        let units = TaskUnits::new(dir.path(), 2);
        let agent = CountingAgent { calls: AtomicU32::new(0), fail_times: 0 };
        let route = Route::User("2151539153".into());
        units
            .run_agent_task(
                &agent,
                opts(route.clone()),
                &NullDeliver,
                CancellationToken::new(),
                "key-6".into(),
                0,
                Duration::from_millis(200),
                1_000,
            )
            .await
            .unwrap();
        let result = units
            .run_agent_task(
                &agent,
                opts(route),
                &NullDeliver,
                CancellationToken::new(),
                "key-6".into(),
                0,
                Duration::from_millis(200),
                1_000 + IDEMPOTENCY_WINDOW_MS + 1,
            )
            .await
            .unwrap();
        assert!(matches!(result, TaskOutcome::Ran(AgentRunOutcome::Completed)));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    struct SlowAgent;
    #[async_trait]
    impl AgentRuntime for SlowAgent {
        async fn run(
            &self,
            _opts: AgentReplyOptions,
            _deliver: &(dyn DeliverReply),
            _cancel: CancellationToken,
        ) -> Result<AgentRunOutcome, AgentRunError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AgentRunOutcome::Completed)
        }
        async fn ensure_agent(&self, _session_key: &SessionKey) -> Result<(), AgentRunError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn exhausting_retries_on_timeout_is_recorded_as_timeout_not_failed() {
        let dir = tempdir().unwrap();
        let units = TaskUnits::new(dir.path(), 2);
        let route = Route::User("2151539153".into());
        let err = units
            .run_agent_task(
                &SlowAgent,
                opts(route.clone()),
                &NullDeliver,
                CancellationToken::new(),
                "key-7".into(),
                0,
                Duration::from_millis(1),
                1_000,
            )
            .await
            .unwrap_err();
        assert_eq!(err, DropReason::DispatchTimeout);

        let state = std::fs::read_to_string(
            dir.path().join(qqgate_core::route_dir_name(&route)).join("meta").join("task-state.json"),
        )
        .unwrap();
        let record: TaskRecord = serde_json::from_str(&state).unwrap();
        assert_eq!(record.state, TaskState::Timeout);
        assert_eq!(record.error_reason.as_deref(), Some("timeout"));
    }
}
