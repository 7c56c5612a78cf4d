// SPDX-License-Identifier: MIT
//! Per-account wiring: connects a [`ProtocolClient`] through the inbound
//! media resolver, aggregator and dispatch engine out to the delivery
//! queue, and binds the automation reconciler / proactive nudge sweep onto
//! the same dispatch path (spec §1 "Data flow").

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use qqgate_config::{ChannelAccountConfig, Config, ExecutionMode, StreamTransportPrefer};
use qqgate_core::{
    AgentReplySegment, AgentRuntime, DropReason, MediaSegmentKind as CoreMediaKind, Route,
    RouteStore, RouteUsage, SendKind,
};
use qqgate_onebot::delivery::{DeliveryItem, DeliveryQueue, DeliveryQueueConfig};
use qqgate_onebot::diagnostics::{fields, DiagChannel, DiagEvent, DiagnosticsLogger};
use qqgate_onebot::dispatch::{DispatchConfig, DispatchEngine, DispatchOutcome, DispatchSink, InboundTurn};
use qqgate_onebot::media::{
    resolve_message_media, DedupGuard, MaterializeOptions, MediaSegmentKind as LocalMediaKind,
};
use qqgate_onebot::normalizer::{normalize_segment, OutboundCall};
use qqgate_onebot::policy::{check_policy, PolicyInputs, PolicyStage};
use qqgate_onebot::proactive::{NudgePolicy, ProactiveNudgeTracker};
use qqgate_onebot::protocol::{actions, ActionClient, InboundEvent, MessageType, PostType, ProtocolClient};
use qqgate_onebot::route_runtime::RouteRuntime;
use qqgate_onebot::sender::{build_candidates, PathPolicy, RelayUrlIssuer, SendCandidateKind};
use qqgate_onebot::tasks::{task_root, TaskUnits};
use qqgate_onebot::aggregator::Aggregator;
use qqgate_scheduler::{ActivityLookup, ActivitySnapshot, Reconciler, ReconcilerConfig, TriggerSink};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Translates a route-agnostic [`OutboundCall`] (spec §4.10's generic
/// `send_msg` shape) into the real wire action and params a OneBot
/// implementation accepts (spec §6 `send_private_msg` / `send_group_msg` /
/// `send_guild_channel_msg`). Kept out of `qqgate_onebot::normalizer` so
/// that module stays route-kind-agnostic and its existing tests untouched.
fn to_wire_call(route: &Route, call: &OutboundCall) -> (&'static str, serde_json::Value) {
    let message = call.params.get("message").cloned().unwrap_or(serde_json::json!([]));
    match route {
        Route::User(id) => (actions::SEND_PRIVATE_MSG, serde_json::json!({ "user_id": id, "message": message })),
        Route::Group(id) => (actions::SEND_GROUP_MSG, serde_json::json!({ "group_id": id, "message": message })),
        Route::Guild(guild_id, channel_id) => (
            actions::SEND_GUILD_CHANNEL_MSG,
            serde_json::json!({ "guild_id": guild_id, "channel_id": channel_id, "message": message }),
        ),
    }
}

fn media_send_kind(kind: LocalMediaKind) -> SendKind {
    match kind {
        LocalMediaKind::Image => SendKind::Media,
        LocalMediaKind::Record => SendKind::Voice,
        LocalMediaKind::Video | LocalMediaKind::File => SendKind::Media,
    }
}

fn candidate_file_value(kind: SendCandidateKind, value: &str) -> String {
    match kind {
        SendCandidateKind::Http | SendCandidateKind::Stream | SendCandidateKind::Base64 => value.to_string(),
        SendCandidateKind::Local => format!("file://{value}"),
    }
}

/// Everything one configured account needs at runtime, shared across the
/// inbound read loop, the [`DispatchSink`] impl, and the automation wiring.
pub struct AccountRuntime {
    pub account_id: String,
    pub config: ChannelAccountConfig,
    pub client: ProtocolClient,
    pub route_store: Arc<RouteStore>,
    pub route_runtime: Arc<RouteRuntime>,
    pub aggregator: Arc<Aggregator>,
    pub nudge: Arc<ProactiveNudgeTracker>,
    pub delivery: Arc<DeliveryQueue>,
    pub diagnostics: Arc<DiagnosticsLogger>,
    pub path_policy: Arc<PathPolicy>,
    pub relay: Option<Arc<dyn RelayUrlIssuer>>,
    pub sessions_root: PathBuf,
    pub tasks_root: PathBuf,
    pub fallback_cooldowns: std::sync::Mutex<std::collections::HashMap<Route, i64>>,
}

impl AccountRuntime {
    fn is_owner_route(&self, route: &Route) -> bool {
        match (&self.config.owner_user_id, route) {
            (Some(owner), Route::User(id)) => owner == id,
            _ => false,
        }
    }

    fn owner_bool(&self, route: &Route) -> bool {
        self.is_owner_route(route)
    }

    fn policy_inputs<'a>(
        &self,
        route: &'a Route,
        caps: &'a qqgate_core::RouteCapabilities,
        usage: &'a RouteUsage,
    ) -> PolicyInputs<'a> {
        PolicyInputs { route, is_owner_private_route: self.owner_bool(route), capabilities: caps, usage }
    }

    fn agent_id_for(&self, route: &Route) -> String {
        format!("{}:{}", self.account_id, route)
    }

    /// Resolves one outgoing media segment to an on-wire file value,
    /// applying the path allowlist and the stream/http/base64/local
    /// candidate order (spec §4.11).
    fn resolve_outbound_media(&self, local_path: &str) -> Result<String, DropReason> {
        let path = Path::new(local_path);
        let candidates = build_candidates(
            path,
            None,
            self.relay.as_deref(),
            self.config.media_proxy_ttl_sec,
            &self.path_policy,
            self.config.stream_transport_prefer,
        )?;
        let chosen = candidates.first().ok_or(DropReason::UnsupportedSource)?;
        Ok(candidate_file_value(chosen.kind, &chosen.value))
    }

    async fn send_one(&self, route: &Route, dispatch_id: &str, call: OutboundCall) {
        if let Some(kind) = call.media_kind {
            let meta = self.route_store.load_or_init_metadata(
                route,
                self.owner_bool(route),
                &self.agent_id_for(route),
                &self.account_id,
            );
            let usage = self.route_store.load_usage(route);
            if let Ok(meta) = meta {
                let inputs = self.policy_inputs(route, &meta.capabilities, &usage);
                if let Err(reason) = check_policy(PolicyStage::BeforeOutbound, Some(media_send_kind(kind)), &inputs) {
                    self.trace_event(route, "outbound_media_blocked", dispatch_id, fields(&[("reason", reason.as_str().into())]));
                    return;
                }
            }
        }

        let (action, params) = to_wire_call(route, &call);
        self.delivery.enqueue(DeliveryItem {
            route: route.clone(),
            dispatch_id: dispatch_id.to_string(),
            action,
            params,
            media_fingerprint: None,
        });

        if call.media_kind.is_some() {
            if let Ok(mut usage) = Ok::<_, ()>(self.route_store.load_usage(route)) {
                usage.bump(media_send_kind(call.media_kind.unwrap()));
                let _ = self.route_store.save_usage(route, &usage);
            }
        }
    }

    fn trace_event(&self, route: &Route, event: &str, dispatch_id: &str, payload: serde_json::Value) {
        self.diagnostics.emit(
            route,
            DiagChannel::Trace,
            &DiagEvent { ts_ms: now_ms(), event, fields: fields(&[("dispatchId", dispatch_id.into()), ("data", payload)]) },
        );
    }
}

#[async_trait]
impl DispatchSink for AccountRuntime {
    async fn deliver(&self, route: &Route, dispatch_id: &str, segment: AgentReplySegment) {
        let max_chars = self.config.max_message_length;
        let resolved_segment = match &segment {
            AgentReplySegment::Media { url, kind } => match self.resolve_outbound_media(url) {
                Ok(resolved) => AgentReplySegment::Media { url: resolved, kind: *kind },
                Err(reason) => {
                    self.send_fallback(route, dispatch_id, reason).await;
                    return;
                }
            },
            AgentReplySegment::Text(_) => segment,
        };

        for call in normalize_segment(route, &resolved_segment, max_chars) {
            self.send_one(route, dispatch_id, call).await;
        }
    }

    async fn send_fallback(&self, route: &Route, dispatch_id: &str, reason: DropReason) {
        if !self.config.outbound_fallback_on_drop {
            return;
        }
        let now = now_ms();
        {
            let mut cooldowns = self.fallback_cooldowns.lock().expect("fallback cooldown mutex poisoned");
            if let Some(last) = cooldowns.get(route) {
                if now - last < self.config.outbound_fallback_cooldown_ms as i64 {
                    return;
                }
            }
            cooldowns.insert(route.clone(), now);
        }
        let text = format!("[gateway] reply dropped: {}", reason.as_str());
        let call = OutboundCall {
            action: "send_msg",
            params: serde_json::json!({ "message": [{ "type": "text", "data": { "text": text } }] }),
            media_kind: None,
        };
        self.send_one(route, dispatch_id, call).await;
    }

    fn trace(&self, route: &Route, event: &str, dispatch_id: &str) {
        self.trace_event(route, event, dispatch_id, serde_json::Value::Null);
    }

    fn check_policy_before_dispatch(&self, route: &Route) -> Result<(), DropReason> {
        let meta = self
            .route_store
            .load_or_init_metadata(route, self.owner_bool(route), &self.agent_id_for(route), &self.account_id)
            .map_err(|_| DropReason::UnknownError)?;
        let usage = self.route_store.load_usage(route);
        let inputs = self.policy_inputs(route, &meta.capabilities, &usage);
        check_policy(PolicyStage::BeforeDispatch, None, &inputs)
    }
}

/// Feeds the automation scheduler's smart-throttle guard from this
/// account's aggregator/nudge state (spec §4.13).
pub struct ActivityLookupImpl {
    pub nudge: Arc<ProactiveNudgeTracker>,
}

impl ActivityLookup for ActivityLookupImpl {
    fn snapshot(&self, route: &Route) -> ActivitySnapshot {
        match self.nudge.state(route) {
            Some(state) => ActivitySnapshot {
                last_inbound_at_ms: Some(state.last_inbound_at_ms),
                last_activity_at_ms: Some(state.last_inbound_at_ms),
                last_sent_at_ms: state.last_nudge_at_ms,
            },
            None => ActivitySnapshot::default(),
        }
    }
}

/// Hands a due automation target's prompt into the same dispatch engine an
/// inbound message would reach (spec §4.13 "enter the dispatch engine
/// directly").
pub struct TriggerSinkImpl {
    pub engine: Arc<DispatchEngine>,
    pub last_seq: AtomicI64,
}

#[async_trait]
impl TriggerSink for TriggerSinkImpl {
    async fn trigger(&self, target: &qqgate_config::AutomationTarget, prompt: String) -> Result<(), String> {
        if target.execution_mode != ExecutionMode::AgentOnly {
            return Err("legacy-deliver automation targets are not supported by this gateway".into());
        }
        let route = Route::parse(&target.route).ok_or_else(|| "invalid route".to_string())?;
        let seq = self.last_seq.fetch_add(1, Ordering::SeqCst) as u64;
        let turn = InboundTurn {
            session_key: qqgate_core::session_key(&route, None),
            route,
            msg_id: None,
            seq,
            text: prompt,
            media_urls: Vec::new(),
            media_items_total: 0,
            has_inbound_media_like: false,
        };
        match self.engine.handle_inbound(turn, now_ms()).await {
            DispatchOutcome::Dropped(reason) => Err(reason.as_str().to_string()),
            DispatchOutcome::Delivered | DispatchOutcome::Queued => Ok(()),
        }
    }
}

/// Everything needed to run one account's inbound loop + its automation
/// reconciler + its proactive nudge sweep, each as an independent task
/// joined under one shutdown token.
pub struct AccountHandles {
    pub runtime: Arc<AccountRuntime>,
    pub engine: Arc<DispatchEngine>,
}

pub fn dispatch_config_for(account: &ChannelAccountConfig) -> DispatchConfig {
    DispatchConfig {
        interrupt_policy: account.interrupt_policy,
        interrupt_window_ms: account.interrupt_window_ms(),
        interrupt_coalesce_enabled: account.interrupt_coalesce_enabled,
        reply_run_timeout_ms: account.reply_run_timeout_ms,
        adaptive_timeout_degrade_window_ms: account.adaptive_timeout_degrade_window_ms as i64,
        file_task_lock_ms: account.file_task_lock_ms as i64,
        task_max_retries: qqgate_config::clamp_task_max_retries(account.task_max_retries),
        task_max_runtime_ms: qqgate_config::clamp_task_max_runtime_ms(account.task_max_runtime_ms),
    }
}

/// Builds the runtime + dispatch engine for one configured account. Does
/// not yet start the inbound read loop or automation — see [`run_account`].
pub fn build_account(
    account_id: String,
    account: ChannelAccountConfig,
    workspace_root: &Path,
    agent: Arc<dyn AgentRuntime>,
    relay: Option<Arc<dyn RelayUrlIssuer>>,
    cancel: CancellationToken,
) -> AccountHandles {
    let sessions_root = workspace_root.join("qq_sessions");
    let tasks_root = workspace_root.join("tasks");

    let client = ProtocolClient::connect(account.ws_url.clone(), account.access_token.clone(), cancel.clone());
    let route_store = Arc::new(RouteStore::new(&sessions_root));
    let route_runtime = Arc::new(RouteRuntime::new());
    let aggregator = Arc::new(Aggregator::new());
    let nudge = Arc::new(ProactiveNudgeTracker::new());
    let diagnostics = Arc::new(DiagnosticsLogger::new(&sessions_root));

    let allowed_roots = if account.media_path_allowlist.is_empty() {
        vec![sessions_root.clone(), tasks_root.clone()]
    } else {
        account.media_path_allowlist.iter().map(PathBuf::from).collect()
    };
    let path_policy = Arc::new(PathPolicy::new(allowed_roots));

    let delivery_config = DeliveryQueueConfig {
        pace_interval_ms: account.send_queue_base_delay_ms,
        pace_jitter_ms: account.send_queue_jitter_ms,
        send_retries: account.send_queue_max_retries,
        send_retry_min_delay_ms: account.send_retry_min_delay_ms,
        send_retry_max_delay_ms: account.send_retry_max_delay_ms,
        send_retry_jitter_ratio: account.send_retry_jitter_ratio,
        send_wait_for_reconnect_ms: account.send_wait_for_reconnect_ms,
        media_dedup_window_ms: account.outbound_repeat_guard_window_ms as i64,
    };
    let delivery = DeliveryQueue::spawn(client.clone(), route_runtime.clone(), delivery_config, now_ms);

    let task_units = Arc::new(TaskUnits::new(&sessions_root, qqgate_config::clamp_task_max_concurrency(account.task_max_concurrency) as usize));

    let runtime = Arc::new(AccountRuntime {
        account_id,
        config: account,
        client,
        route_store,
        route_runtime: route_runtime.clone(),
        aggregator,
        nudge,
        delivery,
        diagnostics,
        path_policy,
        relay,
        sessions_root,
        tasks_root,
        fallback_cooldowns: std::sync::Mutex::new(std::collections::HashMap::new()),
    });

    let engine = DispatchEngine::new(
        route_runtime,
        task_units,
        agent,
        runtime.clone() as Arc<dyn DispatchSink>,
        dispatch_config_for(&runtime.config),
    );

    AccountHandles { runtime, engine }
}

/// Runs one account's inbound loop until `shutdown` fires: subscribes to
/// the protocol client's event stream, resolves/materializes inbound
/// media, aggregates, and hands each finalized turn to the dispatch engine.
pub async fn run_account_inbound(handles: Arc<AccountHandles>, shutdown: CancellationToken) {
    let runtime = &handles.runtime;
    let mut events = runtime.client.subscribe();
    info!(account = %runtime.account_id, "account inbound loop starting");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => {
                match event {
                    Ok(ev) => handle_event(handles.clone(), ev).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(account = %runtime.account_id, skipped = n, "inbound event lagged, dropping");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn handle_event(handles: Arc<AccountHandles>, ev: InboundEvent) {
    if ev.post_type != PostType::Message {
        return;
    }
    let runtime = &handles.runtime;
    let route = match route_from_event(&ev) {
        Some(r) => r,
        None => return,
    };
    if let Route::Group(id) = &route {
        if !runtime.config.allowed_groups.is_empty() && !runtime.config.allowed_groups.contains(id) {
            return;
        }
    }
    if let Some(user_id) = &ev.user_id {
        if runtime.config.blocked_users.contains(user_id) {
            return;
        }
    }
    if matches!(route, Route::Guild(_, _)) && !runtime.config.enable_guilds {
        return;
    }

    runtime.nudge.note_inbound(&route, now_ms());

    let text = extract_text(&ev);
    let media = resolve_inbound_media(runtime, &route, &ev).await;
    let is_private = matches!(route, Route::User(_));
    let window_ms = runtime.config.aggregate_window_ms_for(is_private);

    let seq = runtime.aggregator.push(
        route.clone(),
        text,
        media.0,
        media.1,
        media.2,
    );

    tokio::time::sleep(Duration::from_millis(window_ms)).await;
    let Some(finalized) = runtime.aggregator.finalize(&route, seq) else { return };

    let turn = InboundTurn {
        session_key: qqgate_core::session_key(&route, runtime.config.owner_user_id.as_deref()),
        route: route.clone(),
        msg_id: ev.message_id.clone(),
        seq,
        text: finalized.text,
        media_urls: finalized.media_urls,
        media_items_total: finalized.media_items_total,
        has_inbound_media_like: finalized.has_inbound_media_like,
    };
    handles.engine.handle_inbound(turn, now_ms()).await;
}

fn route_from_event(ev: &InboundEvent) -> Option<Route> {
    match ev.message_type {
        Some(MessageType::Private) => ev.user_id.clone().map(Route::User),
        Some(MessageType::Group) => ev.group_id.clone().map(Route::Group),
        Some(MessageType::Guild) => match (&ev.guild_id, &ev.channel_id) {
            (Some(g), Some(c)) => Some(Route::Guild(g.clone(), c.clone())),
            _ => None,
        },
        None => None,
    }
}

fn extract_text(ev: &InboundEvent) -> String {
    let Some(segments) = &ev.message else { return ev.raw_message.clone().unwrap_or_default() };
    let mut out = String::new();
    for seg in segments {
        if let qqgate_onebot::protocol::Segment::Text { text } = seg {
            out.push_str(text);
        }
    }
    out
}

async fn resolve_inbound_media(
    runtime: &AccountRuntime,
    route: &Route,
    ev: &InboundEvent,
) -> (Vec<String>, usize, bool) {
    let Some(segments) = &ev.message else { return (Vec::new(), 0, false) };
    let refs = resolve_message_media(segments, runtime.config.inbound_media_max_per_message);
    if refs.is_empty() {
        return (Vec::new(), 0, false);
    }

    let out_dir = task_root(&runtime.sessions_root, route);
    let opts = MaterializeOptions {
        http_timeout: Duration::from_millis(runtime.config.inbound_media_http_timeout_ms),
        http_retries: runtime.config.inbound_media_http_retries,
        out_dir,
    };
    let mut dedup = DedupGuard::new();
    let mut urls = Vec::new();
    let ts_ms = now_ms();

    for (index, media_ref) in refs.iter().enumerate() {
        let mut materialized = None;
        for candidate in &media_ref.candidates {
            let result = qqgate_onebot::media::materialize_one(candidate, media_ref.name_hint.as_deref(), index, ts_ms, &opts, &mut dedup).await;
            if result.materialized {
                materialized = Some(result);
                break;
            }
        }
        if let Some(result) = materialized {
            if let Some(url) = result.output_url {
                urls.push(url);
            }
        } else {
            runtime.trace_event(route, "inbound_media_unresolved", "", fields(&[("index", index.into())]));
        }
    }

    (urls, refs.len(), true)
}

/// Starts the automation reconciler for one account's targets, filtered to
/// those scoped under this account's own owner route namespace being out
/// of scope here — automation targets address routes directly (spec §6),
/// so every enabled target in config is wired to every account's engine;
/// in practice a deployment scopes targets to the one account whose routes
/// they name.
pub fn spawn_reconciler(
    config: &Config,
    engine: Arc<DispatchEngine>,
    nudge: Arc<ProactiveNudgeTracker>,
    workspace_root: &Path,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let targets = config.automation.clone();
    let reconciler_config = ReconcilerConfig::from_config(config, true);
    let state_root = workspace_root.join("qq_sessions");
    let activity = ActivityLookupImpl { nudge };
    let sink = TriggerSinkImpl { engine, last_seq: AtomicI64::new(0) };
    let reconciler = Reconciler::new(targets, reconciler_config, state_root, activity, sink);
    tokio::spawn(async move { reconciler.run(shutdown).await })
}

/// Sweeps every route the nudge tracker has seen for proactive-dm
/// eligibility and, when eligible, feeds a synthetic turn into the
/// dispatch engine the same way an inbound message would (spec §4.15).
pub fn spawn_proactive_sweep(
    runtime: Arc<AccountRuntime>,
    engine: Arc<DispatchEngine>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !runtime.config.proactive_dm_enabled {
            return;
        }
        let Some(route_str) = runtime.config.proactive_dm_route.clone() else { return };
        let Some(route) = Route::parse(&route_str) else { return };
        let policy = NudgePolicy {
            silence_ms: runtime.config.proactive_dm_min_silence_ms as i64,
            min_interval_ms: runtime.config.proactive_dm_min_interval_ms as i64,
        };
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = now_ms();
                    if runtime.nudge.is_eligible(&route, now, policy) {
                        let turn = InboundTurn {
                            session_key: qqgate_core::session_key(&route, runtime.config.owner_user_id.as_deref()),
                            route: route.clone(),
                            msg_id: None,
                            seq: 0,
                            text: String::new(),
                            media_urls: Vec::new(),
                            media_items_total: 0,
                            has_inbound_media_like: false,
                        };
                        engine.handle_inbound(turn, now).await;
                        runtime.nudge.note_nudge_sent(&route, now);
                    }
                }
            }
        }
    })
}
