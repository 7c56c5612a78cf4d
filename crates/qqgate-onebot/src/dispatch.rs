// SPDX-License-Identifier: MIT
//! The dispatch engine (spec §4.7) — the central state machine driving one
//! route's conversation turns through `idle -> coalescing -> running ->
//! delivering -> superseded|done`.
//!
//! Each call to [`DispatchEngine::handle_inbound`] represents one already
//! aggregated logical inbound message (see [`crate::aggregator`]). The
//! engine decides, against the route's current in-flight state, whether to
//! preempt a running turn, queue this one as pending-latest, or start
//! immediately; runs the agent under a timeout with cooperative
//! cancellation; and on completion checks it is still the owner of its
//! dispatch-id before clearing in-flight state and delivering anything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qqgate_config::InterruptPolicy;
use qqgate_core::{
    AgentReplyOptions, AgentReplySegment, AgentRunOutcome, AgentRuntime, DeliverReply, DropReason,
    Route, SessionKey,
};
use tokio_util::sync::CancellationToken;

use crate::route_runtime::{PendingLatest, RouteRuntime};
use crate::tasks::{compute_task_key, TaskOutcome, TaskUnits};

/// Heavy-turn threshold (spec §4.7 "heavy task offload"): any inbound
/// carrying media, or text at or beyond this length, is handed to task
/// units instead of running inline.
pub const HEAVY_TASK_TEXT_CHARS: usize = 800;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub interrupt_policy: InterruptPolicy,
    pub interrupt_window_ms: u64,
    pub interrupt_coalesce_enabled: bool,
    pub reply_run_timeout_ms: u64,
    pub adaptive_timeout_degrade_window_ms: i64,
    pub file_task_lock_ms: i64,
    pub task_max_retries: u32,
    pub task_max_runtime_ms: u64,
}

/// One logical, already-aggregated inbound turn handed to the engine.
#[derive(Debug, Clone)]
pub struct InboundTurn {
    pub route: Route,
    pub session_key: SessionKey,
    pub msg_id: Option<String>,
    pub seq: u64,
    pub text: String,
    pub media_urls: Vec<String>,
    pub media_items_total: usize,
    pub has_inbound_media_like: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The agent ran and the engine cleared in-flight as its owner.
    Delivered,
    /// This turn was queued as pending-latest behind a running turn.
    Queued,
    /// This turn was dropped outright (policy gate, or a stale drain).
    Dropped(DropReason),
}

/// Sink the engine forwards agent reply segments and post-dispatch events
/// into. Implemented by the binary's wiring of the delivery queue /
/// diagnostics logger; kept as a trait here so the engine is testable
/// without either.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn deliver(&self, route: &Route, dispatch_id: &str, segment: AgentReplySegment);
    async fn send_fallback(&self, route: &Route, dispatch_id: &str, reason: DropReason);
    fn trace(&self, route: &Route, event: &str, dispatch_id: &str);
    /// Capability/quota gate run once before the agent is invoked (spec
    /// §4.12 `beforeDispatch`).
    fn check_policy_before_dispatch(&self, route: &Route) -> Result<(), DropReason>;
}

/// Routes a leading-`/` message to an external admin-command parser before
/// it ever reaches the agent runtime. The parser's own command grammar is
/// out of scope here — this trait only decides, per message, whether that
/// parser claimed it or the agent should see it instead (the
/// `handle_command`/passthrough split a chat bridge needs regardless of
/// which command set it speaks).
#[async_trait]
pub trait AdminCommandRouter: Send + Sync {
    /// Returns `Some(reply)` if `text` was a recognised admin command,
    /// `None` if the turn should pass through to the agent runtime.
    async fn try_handle(&self, route: &Route, text: &str) -> Option<String>;
}

struct RouteDeliverAdapter<'a> {
    route: &'a Route,
    dispatch_id: &'a str,
    sink: &'a dyn DispatchSink,
}

#[async_trait]
impl<'a> DeliverReply for RouteDeliverAdapter<'a> {
    async fn deliver(&self, segment: AgentReplySegment) {
        self.sink.deliver(self.route, self.dispatch_id, segment).await;
    }
}

pub struct DispatchEngine {
    route_runtime: Arc<RouteRuntime>,
    task_units: Arc<TaskUnits>,
    agent: Arc<dyn AgentRuntime>,
    sink: Arc<dyn DispatchSink>,
    config: DispatchConfig,
    /// The most recent full turn seen per route, kept only so a drained
    /// pending-latest entry (which carries just `msg_id`/`seq`, spec §3)
    /// can be replayed with its original text/media instead of refetched.
    last_turn_cache: Mutex<HashMap<Route, InboundTurn>>,
    admin_router: Option<Arc<dyn AdminCommandRouter>>,
}

impl DispatchEngine {
    pub fn new(
        route_runtime: Arc<RouteRuntime>,
        task_units: Arc<TaskUnits>,
        agent: Arc<dyn AgentRuntime>,
        sink: Arc<dyn DispatchSink>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            route_runtime,
            task_units,
            agent,
            sink,
            config,
            last_turn_cache: Mutex::new(HashMap::new()),
            admin_router: None,
        })
    }

    pub fn with_admin_router(mut self: Arc<Self>, router: Arc<dyn AdminCommandRouter>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_admin_router called before the engine is shared")
            .admin_router = Some(router);
        self
    }

    /// Entry point: one aggregated inbound turn. Recurses (via a spawned
    /// task) to drain any pending-latest left behind once the turn this
    /// call starts finishes — see the module doc and the `DESIGN.md` open
    /// question on pending-latest drain semantics.
    pub async fn handle_inbound(self: &Arc<Self>, turn: InboundTurn, now_ms: i64) -> DispatchOutcome {
        self.last_turn_cache.lock().expect("last_turn_cache mutex poisoned").insert(turn.route.clone(), turn.clone());

        if let Some(router) = &self.admin_router {
            let trimmed = turn.text.trim();
            if trimmed.starts_with('/') {
                if let Some(reply) = router.try_handle(&turn.route, trimmed).await {
                    self.sink.trace(&turn.route, "admin_command_handled", "");
                    self.sink.deliver(&turn.route, "", AgentReplySegment::Text(reply)).await;
                    return DispatchOutcome::Delivered;
                }
            }
        }

        if let Err(reason) = self.sink.check_policy_before_dispatch(&turn.route) {
            self.sink.trace(&turn.route, "dispatch_policy_blocked", "");
            return DispatchOutcome::Dropped(reason);
        }

        if let Some(current) = self.route_runtime.current_in_flight(&turn.route) {
            return self.handle_while_busy(turn, current, now_ms).await;
        }

        self.start_dispatch(turn, now_ms).await
    }

    fn effective_policy(&self, route: &Route, now_ms: i64) -> InterruptPolicy {
        match self.config.interrupt_policy {
            InterruptPolicy::Adaptive => {
                let degraded = self.route_runtime.recently_timed_out(
                    route,
                    now_ms,
                    self.config.adaptive_timeout_degrade_window_ms,
                ) || self.route_runtime.is_file_task_locked(route, now_ms);
                if degraded {
                    InterruptPolicy::QueueLatest
                } else {
                    InterruptPolicy::Preempt
                }
            }
            other => other,
        }
    }

    async fn handle_while_busy(
        self: &Arc<Self>,
        turn: InboundTurn,
        current: crate::route_runtime::InFlight,
        now_ms: i64,
    ) -> DispatchOutcome {
        match self.effective_policy(&turn.route, now_ms) {
            InterruptPolicy::QueueLatest | InterruptPolicy::Adaptive => {
                let pending = PendingLatest {
                    msg_id: turn.msg_id.clone(),
                    session_key: turn.session_key.clone(),
                    inbound_seq: turn.seq,
                    has_inbound_media_like: turn.has_inbound_media_like,
                    updated_at_ms: now_ms,
                };
                if self.route_runtime.set_pending_latest(&turn.route, pending).is_some() {
                    self.sink.trace(&turn.route, "queued_superseded_by_newer_inbound", &current.dispatch_id);
                }
                DispatchOutcome::Queued
            }
            InterruptPolicy::Preempt => {
                current.cancel.cancel();
                self.sink.trace(&turn.route, "dispatch_preempted", &current.dispatch_id);
                self.start_dispatch(turn, now_ms).await
            }
        }
    }

    async fn start_dispatch(self: &Arc<Self>, turn: InboundTurn, now_ms: i64) -> DispatchOutcome {
        if self.config.interrupt_coalesce_enabled && self.config.interrupt_window_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.interrupt_window_ms)).await;
            if let Some(pending) = self.route_runtime.peek_pending(&turn.route) {
                if pending.inbound_seq > turn.seq {
                    self.sink.trace(&turn.route, "coalesce_superseded_after_preempt", "");
                    return DispatchOutcome::Queued;
                }
            }
        }

        let (in_flight, _previous) = self.route_runtime.begin_in_flight(&turn.route, turn.msg_id.clone(), now_ms);
        let dispatch_id = in_flight.dispatch_id.clone();
        self.sink.trace(&turn.route, "dispatch_started", &dispatch_id);

        let heavy = turn.media_items_total > 0 || turn.text.chars().count() >= HEAVY_TASK_TEXT_CHARS;

        let opts = AgentReplyOptions {
            route: turn.route.clone(),
            session_key: turn.session_key.clone(),
            msg_id: turn.msg_id.clone(),
            dispatch_id: dispatch_id.clone(),
            text: turn.text.clone(),
            media_urls: turn.media_urls.clone(),
            media_items_total: turn.media_items_total,
            fast_ack_sent: heavy,
        };

        if heavy {
            self.route_runtime.lock_file_task(&turn.route, now_ms, self.config.file_task_lock_ms);
            self.sink.trace(&turn.route, "fast_ack_sent", &dispatch_id);
        }

        let run_result = self.run_with_timeout(&turn.route, &dispatch_id, opts, in_flight.cancel.clone(), heavy, now_ms).await;

        self.finish_dispatch(turn, dispatch_id, run_result, now_ms).await
    }

    async fn run_with_timeout(
        &self,
        route: &Route,
        dispatch_id: &str,
        opts: AgentReplyOptions,
        cancel: CancellationToken,
        heavy: bool,
        now_ms: i64,
    ) -> Result<AgentRunOutcome, DropReason> {
        let adapter = RouteDeliverAdapter { route, dispatch_id, sink: self.sink.as_ref() };
        let timeout = Duration::from_millis(self.config.reply_run_timeout_ms);

        if heavy {
            let task_key = compute_task_key(route, &opts.text, &opts.media_urls.join(","));
            match self
                .task_units
                .run_agent_task(
                    self.agent.as_ref(),
                    opts,
                    &adapter,
                    cancel,
                    task_key,
                    self.config.task_max_retries,
                    Duration::from_millis(self.config.task_max_runtime_ms),
                    now_ms,
                )
                .await
            {
                Ok(TaskOutcome::Ran(outcome)) => Ok(outcome),
                Ok(TaskOutcome::Duplicate) => Err(DropReason::DuplicateTextSuppressed),
                Err(reason) => Err(reason),
            }
        } else {
            match tokio::time::timeout(timeout, self.agent.run(opts, &adapter, cancel.clone())).await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(_err)) => Err(DropReason::UnknownError),
                Err(_elapsed) => {
                    cancel.cancel();
                    Err(DropReason::DispatchTimeout)
                }
            }
        }
    }

    async fn finish_dispatch(
        self: &Arc<Self>,
        turn: InboundTurn,
        dispatch_id: String,
        run_result: Result<AgentRunOutcome, DropReason>,
        now_ms: i64,
    ) -> DispatchOutcome {
        if let Err(DropReason::DispatchTimeout) = run_result {
            self.route_runtime.record_timeout(&turn.route, now_ms);
        }

        // Clear-by-owner: only this dispatch's exact id may clear in-flight.
        // A predecessor preempted out from under a newer flow must not.
        let owns_in_flight = self.route_runtime.clear_in_flight(&turn.route, &dispatch_id);
        if !owns_in_flight {
            self.sink.trace(&turn.route, "dispatch_id_mismatch", &dispatch_id);
            return DispatchOutcome::Dropped(DropReason::DispatchIdMismatch);
        }

        let outcome = match run_result {
            Ok(AgentRunOutcome::Completed) => {
                self.sink.trace(&turn.route, "dispatch_done", &dispatch_id);
                DispatchOutcome::Delivered
            }
            Ok(AgentRunOutcome::CompletedEmpty) => {
                self.sink.trace(&turn.route, "dispatch_completed_empty", &dispatch_id);
                DispatchOutcome::Delivered
            }
            Ok(AgentRunOutcome::Aborted) => {
                self.sink.trace(&turn.route, "dispatch_aborted", &dispatch_id);
                DispatchOutcome::Dropped(DropReason::DispatchAborted)
            }
            Err(reason) => {
                self.sink.trace(&turn.route, "dispatch_failed", &dispatch_id);
                if reason.is_fallback_eligible() {
                    self.sink.send_fallback(&turn.route, &dispatch_id, reason).await;
                }
                DispatchOutcome::Dropped(reason)
            }
        };

        self.drain_pending(turn.route.clone(), now_ms);
        outcome
    }

    /// Drains the route's pending-latest entry (if any) once this dispatch
    /// finishes, and spawns a fresh `handle_inbound` for it so the queued
    /// turn actually runs rather than sitting forever once the user stops
    /// sending new messages.
    ///
    /// A pending-latest entry only ever exists for a turn that arrived
    /// *after* the one we just finished (it is written by
    /// `handle_while_busy` while this dispatch was running), so it is
    /// always newer than our own seq by construction — there is no upper
    /// bound to apply here, unlike `drain_pending_if_not_newer`'s general
    /// contract used elsewhere. We drain unconditionally.
    fn drain_pending(self: &Arc<Self>, route: Route, now_ms: i64) {
        let Some(pending) = self.route_runtime.drain_pending_if_not_newer(&route, u64::MAX) else { return };
        let engine = self.clone();
        tokio::spawn(async move {
            let turn = InboundTurn {
                route: route.clone(),
                session_key: crate::session_key_for(&route),
                msg_id: pending.msg_id,
                seq: pending.inbound_seq,
                text: String::new(),
                media_urls: vec![],
                media_items_total: 0,
                has_inbound_media_like: pending.has_inbound_media_like,
            };
            engine.handle_inbound(turn, now_ms).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qqgate_core::{AgentRunError, MediaSegmentKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct EchoAgent {
        delay_ms: u64,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentRuntime for EchoAgent {
        async fn run(
            &self,
            opts: AgentReplyOptions,
            deliver: &(dyn DeliverReply),
            cancel: CancellationToken,
        ) -> Result<AgentRunOutcome, AgentRunError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
                    _ = cancel.cancelled() => return Ok(AgentRunOutcome::Aborted),
                }
            }
            deliver.deliver(AgentReplySegment::Text(format!("echo:{}", opts.text))).await;
            Ok(AgentRunOutcome::Completed)
        }
        async fn ensure_agent(&self, _session_key: &SessionKey) -> Result<(), AgentRunError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: StdMutex<Vec<(String, String)>>,
        traces: StdMutex<Vec<String>>,
        fallback_count: AtomicU32,
    }

    #[async_trait]
    impl DispatchSink for RecordingSink {
        async fn deliver(&self, route: &Route, dispatch_id: &str, segment: AgentReplySegment) {
            if let AgentReplySegment::Text(t) = segment {
                self.delivered.lock().unwrap().push((route.to_string(), format!("{dispatch_id}:{t}")));
            }
        }
        async fn send_fallback(&self, _route: &Route, _dispatch_id: &str, _reason: DropReason) {
            self.fallback_count.fetch_add(1, Ordering::SeqCst);
        }
        fn trace(&self, _route: &Route, event: &str, _dispatch_id: &str) {
            self.traces.lock().unwrap().push(event.to_string());
        }
        fn check_policy_before_dispatch(&self, _route: &Route) -> Result<(), DropReason> {
            Ok(())
        }
    }

    fn engine(agent: EchoAgent, sink: Arc<RecordingSink>, policy: InterruptPolicy, dir: &std::path::Path) -> Arc<DispatchEngine> {
        let route_runtime = Arc::new(RouteRuntime::new());
        let task_units = Arc::new(TaskUnits::new(dir, 2));
        let config = DispatchConfig {
            interrupt_policy: policy,
            interrupt_window_ms: 0,
            interrupt_coalesce_enabled: false,
            reply_run_timeout_ms: 5000,
            adaptive_timeout_degrade_window_ms: 120_000,
            file_task_lock_ms: 60_000,
            task_max_retries: 0,
            task_max_runtime_ms: 5000,
        };
        DispatchEngine::new(route_runtime, task_units, Arc::new(agent), sink, config)
    }

    fn turn(route: Route, seq: u64, text: &str) -> InboundTurn {
        InboundTurn {
            route,
            session_key: "agent:main:main".into(),
            msg_id: Some(format!("m{seq}")),
            seq,
            text: text.to_string(),
            media_urls: vec![],
            media_items_total: 0,
            has_inbound_media_like: false,
        }
    }

    #[tokio::test]
    async fn simple_turn_delivers_and_clears_in_flight() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let eng = engine(EchoAgent { delay_ms: 0, calls: AtomicU32::new(0) }, sink.clone(), InterruptPolicy::Preempt, dir.path());
        let route = Route::User("2151539153".into());
        let outcome = eng.handle_inbound(turn(route.clone(), 1, "hi"), 1000).await;
        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert!(eng_in_flight_cleared(&eng, &route));
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    fn eng_in_flight_cleared(eng: &Arc<DispatchEngine>, route: &Route) -> bool {
        eng.route_runtime.current_in_flight(route).is_none()
    }

    #[tokio::test]
    async fn preempt_policy_cancels_running_turn_and_starts_new_one() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let eng = engine(EchoAgent { delay_ms: 2000, calls: AtomicU32::new(0) }, sink.clone(), InterruptPolicy::Preempt, dir.path());
        let route = Route::User("2151539153".into());
        let eng2 = eng.clone();
        let route2 = route.clone();
        let first = tokio::spawn(async move { eng2.handle_inbound(turn(route2, 1, "slow"), 1000).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = eng.handle_inbound(turn(route.clone(), 2, "fast"), 1050).await;
        let first_outcome = first.await.unwrap();
        assert_eq!(first_outcome, DispatchOutcome::Dropped(DropReason::DispatchAborted));
        assert_eq!(second, DispatchOutcome::Delivered);
    }

    #[tokio::test]
    async fn queue_latest_policy_queues_instead_of_preempting() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let eng = engine(EchoAgent { delay_ms: 300, calls: AtomicU32::new(0) }, sink.clone(), InterruptPolicy::QueueLatest, dir.path());
        let route = Route::User("2151539153".into());
        let eng2 = eng.clone();
        let route2 = route.clone();
        let first = tokio::spawn(async move { eng2.handle_inbound(turn(route2, 1, "one"), 1000).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = eng.handle_inbound(turn(route.clone(), 2, "two"), 1050).await;
        assert_eq!(second, DispatchOutcome::Queued);
        let first_outcome = first.await.unwrap();
        assert_eq!(first_outcome, DispatchOutcome::Delivered);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn timeout_triggers_cancellation_and_fallback() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let route_runtime = Arc::new(RouteRuntime::new());
        let task_units = Arc::new(TaskUnits::new(dir.path(), 2));
        let config = DispatchConfig {
            interrupt_policy: InterruptPolicy::Preempt,
            interrupt_window_ms: 0,
            interrupt_coalesce_enabled: false,
            reply_run_timeout_ms: 50,
            adaptive_timeout_degrade_window_ms: 120_000,
            file_task_lock_ms: 60_000,
            task_max_retries: 0,
            task_max_runtime_ms: 5000,
        };
        let eng = DispatchEngine::new(
            route_runtime,
            task_units,
            Arc::new(EchoAgent { delay_ms: 5000, calls: AtomicU32::new(0) }),
            sink.clone(),
            config,
        );
        let route = Route::User("2151539153".into());
        let outcome = eng.handle_inbound(turn(route, 1, "slow"), 1000).await;
        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::DispatchTimeout));
        assert_eq!(sink.fallback_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heavy_inbound_offloads_to_task_units() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let eng = engine(EchoAgent { delay_ms: 0, calls: AtomicU32::new(0) }, sink.clone(), InterruptPolicy::Preempt, dir.path());
        let route = Route::Group("100001".into());
        let mut big = turn(route, 1, &"x".repeat(900));
        big.media_items_total = 0;
        let outcome = eng.handle_inbound(big, 1000).await;
        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert!(sink.traces.lock().unwrap().contains(&"fast_ack_sent".to_string()));
    }

    #[tokio::test]
    async fn policy_blocked_route_never_dispatches() {
        struct BlockingSink;
        #[async_trait]
        impl DispatchSink for BlockingSink {
            async fn deliver(&self, _route: &Route, _dispatch_id: &str, _segment: AgentReplySegment) {}
            async fn send_fallback(&self, _route: &Route, _dispatch_id: &str, _reason: DropReason) {}
            fn trace(&self, _route: &Route, _event: &str, _dispatch_id: &str) {}
            fn check_policy_before_dispatch(&self, _route: &Route) -> Result<(), DropReason> {
                Err(DropReason::PolicyBlocked)
            }
        }
        let dir = tempdir().unwrap();
        let route_runtime = Arc::new(RouteRuntime::new());
        let task_units = Arc::new(TaskUnits::new(dir.path(), 2));
        let config = DispatchConfig {
            interrupt_policy: InterruptPolicy::Preempt,
            interrupt_window_ms: 0,
            interrupt_coalesce_enabled: false,
            reply_run_timeout_ms: 5000,
            adaptive_timeout_degrade_window_ms: 120_000,
            file_task_lock_ms: 60_000,
            task_max_retries: 0,
            task_max_runtime_ms: 5000,
        };
        let eng = DispatchEngine::new(
            route_runtime,
            task_units,
            Arc::new(EchoAgent { delay_ms: 0, calls: AtomicU32::new(0) }),
            Arc::new(BlockingSink),
            config,
        );
        let route = Route::Group("100002".into());
        let outcome = eng.handle_inbound(turn(route, 1, "hi"), 1000).await;
        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::PolicyBlocked));
    }

    #[allow(unused)]
    fn unused_media_kind() -> MediaSegmentKind {
        MediaSegmentKind::Image
    }

    struct StaticRouter(&'static str, &'static str);

    #[async_trait]
    impl AdminCommandRouter for StaticRouter {
        async fn try_handle(&self, _route: &Route, text: &str) -> Option<String> {
            if text == self.0 {
                Some(self.1.to_string())
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn recognised_slash_command_bypasses_the_agent_entirely() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let agent = EchoAgent { delay_ms: 0, calls: AtomicU32::new(0) };
        let eng = engine(agent, sink.clone(), InterruptPolicy::Preempt, dir.path())
            .with_admin_router(Arc::new(StaticRouter("/status", "all good")));
        let route = Route::User("2151539153".into());
        let outcome = eng.handle_inbound(turn(route.clone(), 1, "/status"), 1000).await;
        assert_eq!(outcome, DispatchOutcome::Delivered);
        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].1.ends_with("all good"));
        assert!(eng_in_flight_cleared(&eng, &route));
    }

    #[tokio::test]
    async fn unrecognised_slash_command_passes_through_to_the_agent() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let agent = EchoAgent { delay_ms: 0, calls: AtomicU32::new(0) };
        let eng = engine(agent, sink.clone(), InterruptPolicy::Preempt, dir.path())
            .with_admin_router(Arc::new(StaticRouter("/status", "all good")));
        let route = Route::User("2151539153".into());
        let outcome = eng.handle_inbound(turn(route, 1, "/unknown"), 1000).await;
        assert_eq!(outcome, DispatchOutcome::Delivered);
        let delivered = sink.delivered.lock().unwrap();
        assert!(delivered[0].1.ends_with("echo:/unknown"));
    }
}
