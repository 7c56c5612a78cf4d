// SPDX-License-Identifier: MIT
//! Proactive nudge (spec §4.15): per-route silence/interval timers that let
//! the agent speak first after a route has gone quiet for a while, without
//! ever firing twice for the same silence window.

use std::collections::HashMap;
use std::sync::Mutex;

use qqgate_core::Route;

#[derive(Debug, Clone, Copy)]
pub struct NudgeRouteState {
    pub last_inbound_at_ms: i64,
    pub last_nudge_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct NudgePolicy {
    /// Minimum silence since the last inbound message before a nudge is
    /// eligible.
    pub silence_ms: i64,
    /// Minimum spacing between two nudges on the same route, independent
    /// of inbound activity.
    pub min_interval_ms: i64,
}

/// Durable per-route nudge timers. Persisted state is the caller's
/// responsibility (spec §4.15 "durable state") — this tracks only the
/// in-memory decision, the same shape the caller reloads at startup.
#[derive(Default)]
pub struct ProactiveNudgeTracker {
    routes: Mutex<HashMap<Route, NudgeRouteState>>,
}

impl ProactiveNudgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_inbound(&self, route: &Route, now_ms: i64) {
        let mut guard = self.routes.lock().expect("nudge mutex poisoned");
        let state = guard.entry(route.clone()).or_insert(NudgeRouteState { last_inbound_at_ms: now_ms, last_nudge_at_ms: None });
        state.last_inbound_at_ms = now_ms;
    }

    pub fn note_nudge_sent(&self, route: &Route, now_ms: i64) {
        let mut guard = self.routes.lock().expect("nudge mutex poisoned");
        let state = guard.entry(route.clone()).or_insert(NudgeRouteState { last_inbound_at_ms: now_ms, last_nudge_at_ms: None });
        state.last_nudge_at_ms = Some(now_ms);
    }

    pub fn state(&self, route: &Route) -> Option<NudgeRouteState> {
        self.routes.lock().expect("nudge mutex poisoned").get(route).copied()
    }

    /// True iff the route has been silent at least `silence_ms` and no
    /// nudge has fired within `min_interval_ms`.
    pub fn is_eligible(&self, route: &Route, now_ms: i64, policy: NudgePolicy) -> bool {
        let guard = self.routes.lock().expect("nudge mutex poisoned");
        let Some(state) = guard.get(route) else { return false };
        let silent_long_enough = now_ms - state.last_inbound_at_ms >= policy.silence_ms;
        let spaced_out = match state.last_nudge_at_ms {
            Some(t) => now_ms - t >= policy.min_interval_ms,
            None => true,
        };
        silent_long_enough && spaced_out
    }

    /// All routes currently eligible, for the reconcile loop to sweep.
    pub fn eligible_routes(&self, now_ms: i64, policy: NudgePolicy) -> Vec<Route> {
        let guard = self.routes.lock().expect("nudge mutex poisoned");
        guard
            .iter()
            .filter(|(_, state)| {
                let silent_long_enough = now_ms - state.last_inbound_at_ms >= policy.silence_ms;
                let spaced_out = match state.last_nudge_at_ms {
                    Some(t) => now_ms - t >= policy.min_interval_ms,
                    None => true,
                };
                silent_long_enough && spaced_out
            })
            .map(|(route, _)| route.clone())
            .collect()
    }
}
