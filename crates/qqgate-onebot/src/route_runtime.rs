// SPDX-License-Identifier: MIT
//! Route runtime context (spec §4.6): per-route in-flight dispatch state,
//! pending-latest queueing, and timeout tracking that powers the adaptive
//! interrupt degrade policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use qqgate_core::Route;
use tokio_util::sync::CancellationToken;

/// One in-flight dispatch (spec §3 "In-flight dispatch"). At most one per
/// route at any instant.
#[derive(Clone)]
pub struct InFlight {
    pub dispatch_id: String,
    pub msg_id: Option<String>,
    pub started_at_ms: i64,
    pub cancel: CancellationToken,
}

/// One pending-latest entry (spec §3). At most one per route; newer
/// arrivals supersede older ones.
#[derive(Clone, Debug)]
pub struct PendingLatest {
    pub msg_id: Option<String>,
    pub session_key: qqgate_core::SessionKey,
    pub inbound_seq: u64,
    pub has_inbound_media_like: bool,
    pub updated_at_ms: i64,
}

#[derive(Default)]
pub struct RouteRuntime {
    in_flight: Mutex<HashMap<Route, InFlight>>,
    pending: Mutex<HashMap<Route, PendingLatest>>,
    last_timeout_at_ms: Mutex<HashMap<Route, i64>>,
    /// File-task lock markers (spec §5): set on routes receiving heavy-file
    /// inbound, expires after `fileTaskLockMs`.
    file_task_lock_until_ms: Mutex<HashMap<Route, i64>>,
    dispatch_counter: AtomicU64,
}

impl RouteRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new monotonic dispatch-id `<route>:<n>:<ts>`, install it
    /// as the route's in-flight entry, and return the previous one (if
    /// any) so the caller may abort it (spec §4.6).
    pub fn begin_in_flight(
        &self,
        route: &Route,
        msg_id: Option<String>,
        now_ms: i64,
    ) -> (InFlight, Option<InFlight>) {
        let n = self.dispatch_counter.fetch_add(1, Ordering::SeqCst);
        let dispatch_id = format!("{route}:{n}:{now_ms}");
        let fresh = InFlight {
            dispatch_id,
            msg_id,
            started_at_ms: now_ms,
            cancel: CancellationToken::new(),
        };
        let mut guard = self.in_flight.lock().expect("in_flight mutex poisoned");
        let previous = guard.insert(route.clone(), fresh.clone());
        (fresh, previous)
    }

    /// Succeeds only on exact dispatch-id match — prevents a late preempted
    /// flow from clearing the new flow's state (spec §4.6, §8 "Clear-by-owner").
    pub fn clear_in_flight(&self, route: &Route, dispatch_id: &str) -> bool {
        let mut guard = self.in_flight.lock().expect("in_flight mutex poisoned");
        match guard.get(route) {
            Some(cur) if cur.dispatch_id == dispatch_id => {
                guard.remove(route);
                true
            }
            _ => false,
        }
    }

    pub fn current_in_flight(&self, route: &Route) -> Option<InFlight> {
        self.in_flight.lock().expect("in_flight mutex poisoned").get(route).cloned()
    }

    /// True iff `dispatch_id` is still the route's current in-flight.
    pub fn is_current(&self, route: &Route, dispatch_id: &str) -> bool {
        matches!(self.current_in_flight(route), Some(f) if f.dispatch_id == dispatch_id)
    }

    /// Insert/replace the route's pending-latest entry. A newer arrival
    /// strictly supersedes the previous one, which the caller should log
    /// with `queued_superseded_by_newer_inbound`.
    pub fn set_pending_latest(&self, route: &Route, entry: PendingLatest) -> Option<PendingLatest> {
        self.pending.lock().expect("pending mutex poisoned").insert(route.clone(), entry)
    }

    /// Drain the pending-latest entry iff its seq is ≤ `our_seq` (spec §4.7
    /// step 7 "Drain pending-latest").
    pub fn drain_pending_if_not_newer(&self, route: &Route, our_seq: u64) -> Option<PendingLatest> {
        let mut guard = self.pending.lock().expect("pending mutex poisoned");
        match guard.get(route) {
            Some(p) if p.inbound_seq <= our_seq => guard.remove(route),
            _ => None,
        }
    }

    pub fn peek_pending(&self, route: &Route) -> Option<PendingLatest> {
        self.pending.lock().expect("pending mutex poisoned").get(route).cloned()
    }

    pub fn clear_pending(&self, route: &Route) {
        self.pending.lock().expect("pending mutex poisoned").remove(route);
    }

    pub fn record_timeout(&self, route: &Route, now_ms: i64) {
        self.last_timeout_at_ms
            .lock()
            .expect("last_timeout mutex poisoned")
            .insert(route.clone(), now_ms);
    }

    /// True while the route is within `degrade_window_ms` of its last
    /// recorded timeout (spec §4.6 "adaptive interrupt" policy).
    pub fn recently_timed_out(&self, route: &Route, now_ms: i64, degrade_window_ms: i64) -> bool {
        match self.last_timeout_at_ms.lock().expect("last_timeout mutex poisoned").get(route) {
            Some(&t) => now_ms - t < degrade_window_ms,
            None => false,
        }
    }

    pub fn lock_file_task(&self, route: &Route, now_ms: i64, lock_ms: i64) {
        self.file_task_lock_until_ms
            .lock()
            .expect("file_task_lock mutex poisoned")
            .insert(route.clone(), now_ms + lock_ms);
    }

    pub fn is_file_task_locked(&self, route: &Route, now_ms: i64) -> bool {
        match self.file_task_lock_until_ms.lock().expect("file_task_lock mutex poisoned").get(route) {
            Some(&until) => now_ms < until,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route::User("2151539153".into())
    }

    #[test]
    fn begin_in_flight_allocates_monotonic_ids() {
        let rt = RouteRuntime::new();
        let (a, prev_a) = rt.begin_in_flight(&route(), None, 1000);
        assert!(prev_a.is_none());
        let (b, prev_b) = rt.begin_in_flight(&route(), None, 1001);
        assert_ne!(a.dispatch_id, b.dispatch_id);
        assert_eq!(prev_b.unwrap().dispatch_id, a.dispatch_id);
    }

    #[test]
    fn clear_in_flight_requires_exact_match() {
        let rt = RouteRuntime::new();
        let (a, _) = rt.begin_in_flight(&route(), None, 1000);
        assert!(!rt.clear_in_flight(&route(), "not-the-id"));
        assert!(rt.clear_in_flight(&route(), &a.dispatch_id));
        assert!(rt.current_in_flight(&route()).is_none());
    }

    #[test]
    fn late_preempted_flow_cannot_clear_newer_flow() {
        let rt = RouteRuntime::new();
        let (old, _) = rt.begin_in_flight(&route(), None, 1000);
        let (_new, _) = rt.begin_in_flight(&route(), None, 1001);
        assert!(!rt.clear_in_flight(&route(), &old.dispatch_id));
        assert!(rt.current_in_flight(&route()).is_some());
    }

    #[test]
    fn pending_latest_insert_supersedes_previous() {
        let rt = RouteRuntime::new();
        let p1 = PendingLatest { msg_id: Some("1".into()), session_key: "agent:main:main".into(), inbound_seq: 1, has_inbound_media_like: false, updated_at_ms: 0 };
        let p2 = PendingLatest { msg_id: Some("2".into()), session_key: "agent:main:main".into(), inbound_seq: 2, has_inbound_media_like: false, updated_at_ms: 1 };
        assert!(rt.set_pending_latest(&route(), p1).is_none());
        let superseded = rt.set_pending_latest(&route(), p2).unwrap();
        assert_eq!(superseded.inbound_seq, 1);
    }

    #[test]
    fn drain_pending_only_when_not_newer_than_dispatch_seq() {
        let rt = RouteRuntime::new();
        let p = PendingLatest { msg_id: None, session_key: "agent:main:main".into(), inbound_seq: 5, has_inbound_media_like: false, updated_at_ms: 0 };
        rt.set_pending_latest(&route(), p);
        assert!(rt.drain_pending_if_not_newer(&route(), 3).is_none());
        assert!(rt.peek_pending(&route()).is_some());
        assert!(rt.drain_pending_if_not_newer(&route(), 5).is_some());
        assert!(rt.peek_pending(&route()).is_none());
    }

    #[test]
    fn adaptive_degrade_window_expires() {
        let rt = RouteRuntime::new();
        rt.record_timeout(&route(), 1000);
        assert!(rt.recently_timed_out(&route(), 1500, 1000));
        assert!(!rt.recently_timed_out(&route(), 3000, 1000));
    }

    #[test]
    fn file_task_lock_expires_after_duration() {
        let rt = RouteRuntime::new();
        rt.lock_file_task(&route(), 1000, 500);
        assert!(rt.is_file_task_locked(&route(), 1200));
        assert!(!rt.is_file_task_locked(&route(), 1600));
    }
}
