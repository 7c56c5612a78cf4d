// SPDX-License-Identifier: MIT
//! Delivery queue (spec §4.9): a single global FIFO that paces outbound
//! `send_msg` calls, retries transport failures with backoff, and runs a
//! preflight dispatch-id check so a superseded flow's output never reaches
//! the wire after a newer one has already started.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use qqgate_core::{DropReason, Route};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;

use crate::protocol::{ActionClient, ActionResponse, TransportError};
use crate::route_runtime::RouteRuntime;

/// One queued outbound call, tagged with the dispatch-id it belongs to so
/// the preflight check can drop it if that flow has since been superseded.
#[derive(Debug, Clone)]
pub struct DeliveryItem {
    pub route: Route,
    pub dispatch_id: String,
    pub action: &'static str,
    pub params: Value,
    /// Media items are deduplicated within a short window (spec §4.9
    /// "media-dedup window") keyed on this fingerprint, typically the
    /// resolved URL or content hash.
    pub media_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryQueueConfig {
    pub pace_interval_ms: u64,
    pub pace_jitter_ms: u64,
    /// Per-call retry budget for `send_with_retry`, and the requeue budget
    /// (`requeueLeft`) a dropped, retriable send is given at the outer
    /// queue layer (spec §4.9).
    pub send_retries: u32,
    pub send_retry_min_delay_ms: u64,
    pub send_retry_max_delay_ms: u64,
    pub send_retry_jitter_ratio: f64,
    /// Preflight/requeue reconnect wait: how long to give the socket to
    /// come back before giving up on an attempt or a requeue (spec §4.9
    /// `sendWaitForReconnectMs`).
    pub send_wait_for_reconnect_ms: u64,
    pub media_dedup_window_ms: i64,
}

impl Default for DeliveryQueueConfig {
    fn default() -> Self {
        Self {
            pace_interval_ms: 400,
            pace_jitter_ms: 150,
            send_retries: 3,
            send_retry_min_delay_ms: 500,
            send_retry_max_delay_ms: 8_000,
            send_retry_jitter_ratio: 0.15,
            send_wait_for_reconnect_ms: 5_000,
            media_dedup_window_ms: 30_000,
        }
    }
}

struct MediaDedupEntry {
    fingerprint: String,
    at_ms: i64,
}

/// A single global FIFO queue, drained by one worker loop so outbound pace
/// is enforced across all routes rather than per-route (spec §4.9 "global
/// pacing").
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<(DeliveryItem, u32)>,
    queued: Mutex<VecDeque<()>>, // length tracking only, for `len()`
    notify_empty: Notify,
    config: DeliveryQueueConfig,
}

pub enum DeliveryOutcome {
    Sent(ActionResponse),
    Dropped(DropReason),
}

/// True for transport failures the source treats as a dead/reconnecting
/// socket rather than a protocol-level rejection (spec §4.9 "requeue on
/// retriable": WebSocket-not-open, request-timeout, ECONNRESET,
/// socket-hangup, broken-pipe, temporarily-unavailable, timed-out).
/// `ActionFailed` (the peer answered with `status: failed`) and
/// `InvalidUrl` (misconfiguration) are not — retrying those would just
/// repeat the same rejection.
fn is_retriable_transport_error(err: &TransportError) -> bool {
    matches!(err, TransportError::Unavailable | TransportError::Timeout(_) | TransportError::Ws(_))
}

impl DeliveryQueue {
    /// Spawns the drain loop and returns a handle. `client` and
    /// `route_runtime` are shared with the dispatch engine so the preflight
    /// check observes the same in-flight state.
    pub fn spawn(
        client: impl ActionClient + Send + Sync + 'static,
        route_runtime: std::sync::Arc<RouteRuntime>,
        config: DeliveryQueueConfig,
        now_ms_fn: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> std::sync::Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = std::sync::Arc::new(Self {
            tx,
            queued: Mutex::new(VecDeque::new()),
            notify_empty: Notify::new(),
            config,
        });
        let worker_queue = queue.clone();
        tokio::spawn(async move {
            worker_queue.run(rx, client, route_runtime, config, now_ms_fn).await;
        });
        queue
    }

    pub fn enqueue(&self, item: DeliveryItem) {
        self.queued.lock().expect("queued mutex poisoned").push_back(());
        let _ = self.tx.send((item, self.config.send_retries));
    }

    fn requeue(&self, item: DeliveryItem, requeue_left: u32) {
        self.queued.lock().expect("queued mutex poisoned").push_back(());
        let _ = self.tx.send((item, requeue_left));
    }

    pub fn len(&self) -> usize {
        self.queued.lock().expect("queued mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn run(
        &self,
        mut rx: mpsc::UnboundedReceiver<(DeliveryItem, u32)>,
        client: impl ActionClient,
        route_runtime: std::sync::Arc<RouteRuntime>,
        config: DeliveryQueueConfig,
        now_ms_fn: impl Fn() -> i64,
    ) {
        let mut recent_media: Vec<MediaDedupEntry> = Vec::new();
        while let Some((item, requeue_left)) = rx.recv().await {
            {
                let mut guard = self.queued.lock().expect("queued mutex poisoned");
                guard.pop_front();
                if guard.is_empty() {
                    self.notify_empty.notify_waiters();
                }
            }

            let now_ms = now_ms_fn();
            recent_media.retain(|e| now_ms - e.at_ms < config.media_dedup_window_ms);

            if !route_runtime.is_current(&item.route, &item.dispatch_id) {
                tracing::debug!(dispatch_id = %item.dispatch_id, "delivery dropped: dispatch_id_mismatch");
                continue;
            }

            if let Some(fp) = &item.media_fingerprint {
                if recent_media.iter().any(|e| &e.fingerprint == fp) {
                    tracing::debug!(fingerprint = %fp, "delivery dropped: duplicate_payload");
                    continue;
                }
                recent_media.push(MediaDedupEntry { fingerprint: fp.clone(), at_ms: now_ms });
            }

            // Preflight: ensure the socket is connected before committing
            // the send, waiting up to the reconnect grace window.
            if !client.is_connected() {
                client
                    .wait_until_connected(Duration::from_millis(config.send_wait_for_reconnect_ms))
                    .await;
            }

            match send_with_retry(&client, item.action, item.params.clone(), &config).await {
                Ok(_) => {}
                Err(err) if is_retriable_transport_error(&err) && requeue_left > 0 => {
                    tracing::debug!(
                        dispatch_id = %item.dispatch_id,
                        error = %err,
                        requeue_left,
                        "delivery requeued: retriable disconnect"
                    );
                    sleep(Duration::from_millis(config.send_wait_for_reconnect_ms)).await;
                    self.requeue(item, requeue_left - 1);
                    continue;
                }
                Err(err) => {
                    tracing::warn!(dispatch_id = %item.dispatch_id, error = %err, "delivery dropped after retries");
                }
            }

            let jitter = if config.pace_jitter_ms > 0 {
                rand::thread_rng().gen_range(0..=config.pace_jitter_ms)
            } else {
                0
            };
            sleep(Duration::from_millis(config.pace_interval_ms + jitter)).await;
        }
    }

    /// Waits (best-effort) until the queue has drained, used by graceful
    /// shutdown to give in-flight sends a chance to land.
    pub async fn wait_drained(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = self.notify_empty.notified() => {}
                _ = sleep(Duration::from_millis(50)) => {}
            }
        }
    }
}

/// `calcRetryDelayMs = clamp(min * 2^(attempt-1), min, max) ± jitterRatio`
/// (spec §4.9), where `attempt` is the 1-indexed retry about to be made.
fn calc_retry_delay_ms(config: &DeliveryQueueConfig, attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(32);
    let base = config.send_retry_min_delay_ms.saturating_mul(1u64 << exp);
    let clamped = base.clamp(config.send_retry_min_delay_ms, config.send_retry_max_delay_ms);
    let jitter_span = (clamped as f64 * config.send_retry_jitter_ratio).round() as i64;
    if jitter_span <= 0 {
        return clamped;
    }
    let delta = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    (clamped as i64 + delta).max(0) as u64
}

/// One call with its own bounded retry/backoff, independent of the queue's
/// pace interval (spec §4.9 "per-call retry").
pub async fn send_with_retry(
    client: &impl ActionClient,
    action: &str,
    params: Value,
    config: &DeliveryQueueConfig,
) -> Result<ActionResponse, TransportError> {
    let mut last_err = None;
    for attempt in 0..=config.send_retries {
        if attempt > 0 {
            if !client.is_connected() {
                client
                    .wait_until_connected(Duration::from_millis(config.send_wait_for_reconnect_ms))
                    .await;
            }
        }
        match client.send_action(action, params.clone()).await {
            Ok(resp) if resp.is_ok() => return Ok(resp),
            Ok(resp) => {
                last_err = Some(TransportError::ActionFailed(resp.msg.clone().unwrap_or_default()));
            }
            Err(err) => last_err = Some(err),
        }
        if attempt < config.send_retries {
            sleep(Duration::from_millis(calc_retry_delay_ms(config, attempt + 1))).await;
        }
    }
    Err(last_err.unwrap_or(TransportError::Unavailable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ActionStatus, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyClient {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionClient for FlakyClient {
        async fn send_action(&self, _action: &str, _params: Value) -> Result<ActionResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Ok(ActionResponse { status: ActionStatus::Failed, data: None, msg: Some("retry me".into()), echo: None })
            } else {
                Ok(ActionResponse { status: ActionStatus::Ok, data: None, msg: None, echo: None })
            }
        }
    }

    #[tokio::test]
    async fn send_with_retry_succeeds_after_failures_within_budget() {
        let client = FlakyClient { fail_times: 2, calls: AtomicU32::new(0) };
        let config = DeliveryQueueConfig {
            send_retry_min_delay_ms: 1,
            send_retry_max_delay_ms: 1,
            send_retry_jitter_ratio: 0.0,
            ..Default::default()
        };
        let resp = send_with_retry(&client, "send_msg", serde_json::json!({}), &config).await.unwrap();
        assert!(resp.is_ok());
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn send_with_retry_exhausts_budget_and_returns_err() {
        let client = FlakyClient { fail_times: 100, calls: AtomicU32::new(0) };
        let config = DeliveryQueueConfig {
            send_retries: 1,
            send_retry_min_delay_ms: 1,
            send_retry_max_delay_ms: 1,
            send_retry_jitter_ratio: 0.0,
            ..Default::default()
        };
        let result = send_with_retry(&client, "send_msg", serde_json::json!({}), &config).await;
        assert!(result.is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_dispatch_id_is_dropped_before_send() {
        struct CountingClient(AtomicU32);
        #[async_trait]
        impl ActionClient for CountingClient {
            async fn send_action(&self, _action: &str, _params: Value) -> Result<ActionResponse, TransportError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(ActionResponse { status: ActionStatus::Ok, data: None, msg: None, echo: None })
            }
        }
        let route_runtime = Arc::new(RouteRuntime::new());
        let route = Route::User("2151539153".into());
        let (fresh, _) = route_runtime.begin_in_flight(&route, None, 1000);
        let _ = fresh; // a newer flow now owns in-flight
        let client = CountingClient(AtomicU32::new(0));
        let queue = DeliveryQueue::spawn(client, route_runtime, DeliveryQueueConfig { pace_interval_ms: 1, ..Default::default() }, || 1000);
        queue.enqueue(DeliveryItem {
            route,
            dispatch_id: "stale-id".into(),
            action: "send_msg",
            params: serde_json::json!({}),
            media_fingerprint: None,
        });
        queue.wait_drained(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn retriable_transport_error_is_requeued_and_eventually_sent() {
        struct FlakyTransportClient {
            fail_times: u32,
            calls: AtomicU32,
        }
        #[async_trait]
        impl ActionClient for FlakyTransportClient {
            async fn send_action(&self, _action: &str, _params: Value) -> Result<ActionResponse, TransportError> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_times {
                    Err(TransportError::Unavailable)
                } else {
                    Ok(ActionResponse { status: ActionStatus::Ok, data: None, msg: None, echo: None })
                }
            }
        }
        let route_runtime = Arc::new(RouteRuntime::new());
        let route = Route::User("2151539153".into());
        let client = FlakyTransportClient { fail_times: 2, calls: AtomicU32::new(0) };
        let config = DeliveryQueueConfig {
            pace_interval_ms: 1,
            pace_jitter_ms: 0,
            send_retries: 1,
            send_retry_min_delay_ms: 1,
            send_retry_max_delay_ms: 1,
            send_retry_jitter_ratio: 0.0,
            send_wait_for_reconnect_ms: 1,
            ..Default::default()
        };
        let queue = DeliveryQueue::spawn(client, route_runtime, config, || 1000);
        queue.enqueue(DeliveryItem {
            route,
            dispatch_id: "d1".into(),
            action: "send_msg",
            params: serde_json::json!({}),
            media_fingerprint: None,
        });
        queue.wait_drained(Duration::from_millis(1000)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn non_retriable_transport_error_is_dropped_without_requeue() {
        struct AlwaysFailsClient(AtomicU32);
        #[async_trait]
        impl ActionClient for AlwaysFailsClient {
            async fn send_action(&self, _action: &str, _params: Value) -> Result<ActionResponse, TransportError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::InvalidUrl("bad url".into()))
            }
        }
        let route_runtime = Arc::new(RouteRuntime::new());
        let route = Route::User("2151539153".into());
        let client = AlwaysFailsClient(AtomicU32::new(0));
        let config = DeliveryQueueConfig {
            pace_interval_ms: 1,
            send_retries: 2,
            send_retry_min_delay_ms: 1,
            send_retry_max_delay_ms: 1,
            send_retry_jitter_ratio: 0.0,
            send_wait_for_reconnect_ms: 1,
            ..Default::default()
        };
        let queue = DeliveryQueue::spawn(client, route_runtime, config, || 1000);
        queue.enqueue(DeliveryItem {
            route,
            dispatch_id: "d1".into(),
            action: "send_msg",
            params: serde_json::json!({}),
            media_fingerprint: None,
        });
        queue.wait_drained(Duration::from_millis(500)).await;
        assert!(queue.is_empty());
    }

    #[test]
    fn calc_retry_delay_grows_exponentially_and_respects_clamp() {
        let config = DeliveryQueueConfig {
            send_retry_min_delay_ms: 500,
            send_retry_max_delay_ms: 8_000,
            send_retry_jitter_ratio: 0.0,
            ..Default::default()
        };
        assert_eq!(calc_retry_delay_ms(&config, 1), 500);
        assert_eq!(calc_retry_delay_ms(&config, 2), 1_000);
        assert_eq!(calc_retry_delay_ms(&config, 3), 2_000);
        assert_eq!(calc_retry_delay_ms(&config, 10), 8_000); // clamped to max
    }
}
