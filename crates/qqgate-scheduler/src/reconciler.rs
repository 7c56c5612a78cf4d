// SPDX-License-Identifier: MIT
//! Periodic reconcile loop (spec §4.13): for each enabled automation target,
//! determine whether its schedule is due, apply the smart-throttle guard,
//! and on success hand a prompt to the dispatch engine through
//! [`TriggerSink`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use qqgate_config::{AutomationTarget, Config, ExecutionMode, Schedule};
use qqgate_core::Route;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cron::CronMatcher;
use crate::smart::{self, ActivitySnapshot, SkipReason};
use crate::state::{RunResult, StateEvent, StateStore, TargetState};

/// Looks up the activity a smart-throttle decision needs for a route. The
/// scheduler has no view of dispatch/delivery state itself — this is the
/// seam the gateway binary wires to the running dispatch engines.
pub trait ActivityLookup: Send + Sync {
    fn snapshot(&self, route: &Route) -> ActivitySnapshot;
}

/// Hands a due, un-throttled target's prompt to the dispatch engine.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn trigger(&self, target: &AutomationTarget, prompt: String) -> Result<(), String>;
}

pub struct ReconcilerConfig {
    pub strict_agent_only: bool,
    pub reconcile_interval_ms: u64,
}

impl ReconcilerConfig {
    pub fn from_config(config: &Config, strict_agent_only: bool) -> Self {
        Self {
            strict_agent_only,
            reconcile_interval_ms: qqgate_config::clamp_reconcile_interval_ms(
                config.reconcile_interval_ms,
            ),
        }
    }
}

pub struct Reconciler<A: ActivityLookup, T: TriggerSink> {
    targets: Vec<AutomationTarget>,
    config: ReconcilerConfig,
    states: StateStore,
    activity: A,
    sink: T,
    /// Parsed cron matchers are expensive to rebuild every tick; cached by
    /// target id.
    cron_cache: Mutex<HashMap<String, CronMatcher>>,
}

impl<A: ActivityLookup, T: TriggerSink> Reconciler<A, T> {
    pub fn new(
        targets: Vec<AutomationTarget>,
        config: ReconcilerConfig,
        state_root: impl Into<std::path::PathBuf>,
        activity: A,
        sink: T,
    ) -> Self {
        Self {
            targets,
            config,
            states: StateStore::new(state_root),
            activity,
            sink,
            cron_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the reconcile loop until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.reconcile_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => self.reconcile_once().await,
                _ = shutdown.cancelled() => break,
            }
        }
    }

    pub async fn reconcile_once(&self) {
        let now = Utc::now();
        for target in &self.targets {
            if !target.enabled {
                continue;
            }
            if let Err(reason) = self.validate_target(target) {
                warn!(target = %target.id, %reason, "automation target invalid, skipping");
                continue;
            }
            self.reconcile_target(target, now).await;
        }
    }

    fn validate_target(&self, target: &AutomationTarget) -> Result<(), &'static str> {
        if Route::parse(&target.route).is_none() {
            return Err("invalid route");
        }
        if self.config.strict_agent_only && target.execution_mode != ExecutionMode::AgentOnly {
            return Err("strict_agent_only requires execution_mode=agent-only");
        }
        Ok(())
    }

    async fn reconcile_target(&self, target: &AutomationTarget, now: chrono::DateTime<Utc>) {
        let route = match Route::parse(&target.route) {
            Some(r) => r,
            None => return,
        };
        let now_ms = now.timestamp_millis();
        let mut state = self.states.load_latest(&route, &target.id);

        let due = match self.is_due(target, &mut state, now) {
            Some(d) => d,
            None => return,
        };
        if !due {
            return;
        }

        let skip_reason = target.job.smart.as_ref().and_then(|throttle| {
            let snapshot = self.activity.snapshot(&route);
            let random_ms = smart::draw_random_interval_ms(throttle);
            smart::evaluate(throttle, snapshot, now_ms, random_ms)
        });

        if let Some(reason) = skip_reason {
            self.record_skip(&route, target, &mut state, now_ms, reason);
            return;
        }

        self.fire(&route, target, &mut state, now_ms).await;
    }

    /// Returns `Some(true)` if due now, `Some(false)` if parsed fine but not
    /// due yet, `None` on a schedule parse error (already logged).
    fn is_due(
        &self,
        target: &AutomationTarget,
        state: &mut TargetState,
        now: chrono::DateTime<Utc>,
    ) -> Option<bool> {
        match &target.job.schedule {
            Schedule::Every { every_ms } => {
                let last = state.last_triggered_at_ms.unwrap_or(0);
                Some(now.timestamp_millis() - last >= *every_ms as i64)
            }
            Schedule::At { at } => {
                if state.last_triggered_at_ms.is_some() {
                    return Some(false);
                }
                let parsed = chrono::DateTime::parse_from_rfc3339(at).ok()?;
                Some(now >= parsed)
            }
            Schedule::Cron { expr, tz } => {
                let mut cache = self.cron_cache.lock().expect("cron cache poisoned");
                let matcher = cache.entry(target.id.clone()).or_insert_with(|| {
                    CronMatcher::parse(expr, tz.as_deref()).unwrap_or_else(|err| {
                        warn!(target = %target.id, error = %err, "falling back to never-due cron matcher");
                        // A matcher that never includes any instant: Feb 30th
                        // never occurs, so this cron expression never fires.
                        CronMatcher::parse("0 0 30 2 *", None).expect("static expr always parses")
                    })
                });
                if !matcher.matches(now) {
                    return Some(false);
                }
                let bucket = matcher.bucket_key(now);
                if state.last_fired_bucket.as_deref() == Some(bucket.as_str()) {
                    return Some(false);
                }
                state.last_fired_bucket = Some(bucket);
                Some(true)
            }
        }
    }

    fn record_skip(
        &self,
        route: &Route,
        target: &AutomationTarget,
        state: &mut TargetState,
        now_ms: i64,
        reason: SkipReason,
    ) {
        state.last_run_result = RunResult::Skipped;
        state.last_skip_reason = Some(reason);
        state.last_error = None;
        let _ = self.states.save_latest(route, state);
        let _ = self.states.append_event(
            route,
            &StateEvent {
                ts_ms: now_ms,
                target_id: &target.id,
                triggered: true,
                produced: false,
                skipped: true,
                note: format!("skip:{}", reason.as_str()),
            },
        );
    }

    async fn fire(&self, route: &Route, target: &AutomationTarget, state: &mut TargetState, now_ms: i64) {
        let prompt = length_guided_prompt(&target.job.message, target.job.smart.as_ref().map(|s| s.max_chars));
        match self.sink.trigger(target, prompt).await {
            Ok(()) => {
                info!(target = %target.id, route = %route, "automation target triggered");
                state.last_triggered_at_ms = Some(now_ms);
                state.last_sent_at_ms = Some(now_ms);
                state.last_run_result = RunResult::Triggered;
                state.last_skip_reason = None;
                state.last_error = None;
                let _ = self.states.save_latest(route, state);
                let _ = self.states.append_event(
                    route,
                    &StateEvent {
                        ts_ms: now_ms,
                        target_id: &target.id,
                        triggered: true,
                        produced: true,
                        skipped: false,
                        note: "triggered".into(),
                    },
                );
            }
            Err(err) => {
                warn!(target = %target.id, error = %err, "automation trigger failed");
                state.last_triggered_at_ms = Some(now_ms);
                state.last_run_result = RunResult::Error;
                state.last_error = Some(err.clone());
                let _ = self.states.save_latest(route, state);
                let _ = self.states.append_event(
                    route,
                    &StateEvent {
                        ts_ms: now_ms,
                        target_id: &target.id,
                        triggered: true,
                        produced: false,
                        skipped: false,
                        note: format!("error:{err}"),
                    },
                );
            }
        }
    }
}

/// Appends a short length-guidance suffix so the agent doesn't turn a
/// scheduled nudge into an essay (spec §4.13 "pass message prompt with
/// length guidance").
fn length_guided_prompt(message: &str, max_chars: Option<u32>) -> String {
    match max_chars {
        Some(max) => format!("{message}\n\n(回复请控制在 {max} 字以内。)"),
        None => message.to_string(),
    }
}
