// SPDX-License-Identifier: MIT
//! Configuration schema (spec §6 "Configuration").
//!
//! Every field here mirrors a named option from spec §6 and §4.*; the
//! default is the value called out in the component section that owns it.
//! `#[serde(default = "...")]` is used wherever the default isn't the
//! type's own `Default` (a named function, not a bare literal, the same
//! way the teacher's config crate does it — `bool::default()` is `false`
//! and several flags here default to `true`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directory under which `qq_sessions/` and `tasks/` are rooted (spec
    /// §6 "Persisted layout"). Relative paths resolve against the process
    /// working directory.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// One entry per bot-protocol connection this process maintains.
    #[serde(default)]
    pub accounts: Vec<ChannelAccountConfig>,
    #[serde(default)]
    pub automation: Vec<AutomationTarget>,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    #[serde(default)]
    pub relay: MediaRelayConfig,
}

fn default_workspace() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptPolicy {
    Preempt,
    QueueLatest,
    Adaptive,
}

impl Default for InterruptPolicy {
    fn default() -> Self {
        InterruptPolicy::Adaptive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamTransportPrefer {
    StreamFirst,
    HttpFirst,
}

impl Default for StreamTransportPrefer {
    fn default() -> Self {
        StreamTransportPrefer::StreamFirst
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboundMediaResolvePrefer {
    NapcatFirst,
    DirectFirst,
}

impl Default for InboundMediaResolvePrefer {
    fn default() -> Self {
        InboundMediaResolvePrefer::NapcatFirst
    }
}

/// One OneBot v11 account connection (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAccountConfig {
    /// Identifies this connection in logs and in the session-key prefix
    /// (§3 "Session key"). Defaults to the account's position in the
    /// `accounts` list when omitted (`account-0`, `account-1`, ...).
    pub id: Option<String>,
    pub ws_url: String,
    pub access_token: String,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub blocked_users: Vec<String>,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub enable_guilds: bool,
    #[serde(default = "default_true")]
    pub enable_deduplication: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
    #[serde(default)]
    pub require_mention: bool,
    #[serde(default)]
    pub keyword_triggers: Vec<String>,

    // ── Aggregation (spec §4.5) ──────────────────────────────────────────────
    #[serde(default = "default_aggregate_window_ms")]
    pub aggregate_window_ms: u64,
    pub dm_aggregate_window_ms: Option<u64>,
    pub group_aggregate_window_ms: Option<u64>,

    // ── Dispatch engine (spec §4.7) ──────────────────────────────────────────
    #[serde(default = "default_reply_run_timeout_ms")]
    pub reply_run_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub reply_abort_on_timeout: bool,
    #[serde(default = "default_true")]
    pub route_preempt_old_run: bool,
    #[serde(default)]
    pub interrupt_policy: InterruptPolicy,
    pub interrupt_window_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub interrupt_coalesce_enabled: bool,
    #[serde(default = "default_adaptive_timeout_degrade_window_ms")]
    pub adaptive_timeout_degrade_window_ms: u64,
    #[serde(default)]
    pub media_interrupt_policy: Option<InterruptPolicy>,
    #[serde(default = "default_file_task_lock_ms")]
    pub file_task_lock_ms: u64,

    // ── Delivery queue (spec §4.9) ───────────────────────────────────────────
    #[serde(default = "default_send_queue_max_retries")]
    pub send_queue_max_retries: u32,
    #[serde(default = "default_send_queue_base_delay_ms")]
    pub send_queue_base_delay_ms: u64,
    #[serde(default = "default_send_queue_jitter_ms")]
    pub send_queue_jitter_ms: u64,
    #[serde(default = "default_send_retry_min_delay_ms")]
    pub send_retry_min_delay_ms: u64,
    #[serde(default = "default_send_retry_max_delay_ms")]
    pub send_retry_max_delay_ms: u64,
    #[serde(default = "default_send_retry_jitter_ratio")]
    pub send_retry_jitter_ratio: f64,
    #[serde(default = "default_send_wait_for_reconnect_ms")]
    pub send_wait_for_reconnect_ms: u64,
    pub rate_limit_ms: Option<u64>,

    // ── Outbound normalizer (spec §4.10) ─────────────────────────────────────
    #[serde(default = "default_outbound_text_dedup_window_ms")]
    pub outbound_text_dedup_window_ms: u64,
    #[serde(default = "default_outbound_repeat_guard_window_ms")]
    pub outbound_repeat_guard_window_ms: u64,
    #[serde(default)]
    pub outbound_abort_pattern_strict: bool,
    #[serde(default = "default_true")]
    pub outbound_fallback_on_drop: bool,
    #[serde(default = "default_outbound_fallback_cooldown_ms")]
    pub outbound_fallback_cooldown_ms: u64,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    // ── Inbound media resolver / materializer (spec §4.3, §4.4) ──────────────
    #[serde(default)]
    pub inbound_media_resolve_prefer: InboundMediaResolvePrefer,
    #[serde(default = "default_inbound_media_http_timeout_ms")]
    pub inbound_media_http_timeout_ms: u64,
    #[serde(default = "default_inbound_media_http_retries")]
    pub inbound_media_http_retries: u32,
    #[serde(default = "default_true")]
    pub inbound_media_use_stream: bool,
    #[serde(default = "default_true")]
    pub inbound_media_fallback_get_msg: bool,
    #[serde(default = "default_inbound_media_max_per_message")]
    pub inbound_media_max_per_message: usize,

    // ── Media sender (spec §4.11) ─────────────────────────────────────────────
    #[serde(default)]
    pub stream_transport_enabled: bool,
    #[serde(default)]
    pub stream_transport_prefer: StreamTransportPrefer,
    #[serde(default)]
    pub media_proxy_enabled: bool,
    pub media_proxy_host: Option<String>,
    pub media_proxy_port: Option<u16>,
    #[serde(default = "default_media_proxy_path")]
    pub media_proxy_path: String,
    pub media_proxy_token: Option<String>,
    #[serde(default = "default_media_proxy_ttl_sec")]
    pub media_proxy_ttl_sec: u64,
    #[serde(default)]
    pub media_path_allowlist: Vec<String>,
    pub voice_base_path: Option<String>,

    // ── Task units (spec §4.8) ────────────────────────────────────────────────
    #[serde(default = "default_task_max_runtime_ms")]
    pub task_max_runtime_ms: u64,
    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: u32,
    #[serde(default = "default_task_max_concurrency")]
    pub task_max_concurrency: u32,
    #[serde(default = "default_true")]
    pub task_idempotency_enabled: bool,

    // ── Proactive nudge (spec §4.15) ──────────────────────────────────────────
    #[serde(default)]
    pub proactive_dm_enabled: bool,
    pub proactive_dm_route: Option<String>,
    #[serde(default = "default_proactive_dm_min_silence_ms")]
    pub proactive_dm_min_silence_ms: u64,
    #[serde(default = "default_proactive_dm_min_interval_ms")]
    pub proactive_dm_min_interval_ms: u64,
    #[serde(default)]
    pub proactive_dm_log_verbose: bool,

    #[serde(default)]
    pub enable_error_notify: bool,
}

fn default_history_limit() -> u32 {
    20
}
fn default_aggregate_window_ms() -> u64 {
    900
}
fn default_reply_run_timeout_ms() -> u64 {
    600_000
}
fn default_adaptive_timeout_degrade_window_ms() -> u64 {
    120_000
}
fn default_file_task_lock_ms() -> u64 {
    60_000
}
fn default_send_queue_max_retries() -> u32 {
    3
}
fn default_send_queue_base_delay_ms() -> u64 {
    1000
}
fn default_send_queue_jitter_ms() -> u64 {
    400
}
fn default_send_retry_min_delay_ms() -> u64 {
    500
}
fn default_send_retry_max_delay_ms() -> u64 {
    8000
}
fn default_send_retry_jitter_ratio() -> f64 {
    0.15
}
fn default_send_wait_for_reconnect_ms() -> u64 {
    5000
}
fn default_outbound_text_dedup_window_ms() -> u64 {
    12_000
}
fn default_outbound_repeat_guard_window_ms() -> u64 {
    12_000
}
fn default_outbound_fallback_cooldown_ms() -> u64 {
    30_000
}
fn default_max_message_length() -> usize {
    4000
}
fn default_inbound_media_http_timeout_ms() -> u64 {
    8000
}
fn default_inbound_media_http_retries() -> u32 {
    2
}
fn default_inbound_media_max_per_message() -> usize {
    8
}
fn default_media_proxy_path() -> String {
    "/media".into()
}
fn default_media_proxy_ttl_sec() -> u64 {
    300
}
fn default_task_max_runtime_ms() -> u64 {
    120_000
}
fn default_task_max_retries() -> u32 {
    1
}
fn default_task_max_concurrency() -> u32 {
    1
}
fn default_proactive_dm_min_silence_ms() -> u64 {
    6 * 60 * 60 * 1000
}
fn default_proactive_dm_min_interval_ms() -> u64 {
    12 * 60 * 60 * 1000
}

impl ChannelAccountConfig {
    /// `interruptWindowMs`, falling back to the aggregate window (spec §4.7).
    pub fn interrupt_window_ms(&self) -> u64 {
        self.interrupt_window_ms.unwrap_or(self.aggregate_window_ms)
    }

    pub fn aggregate_window_ms_for(&self, is_private: bool) -> u64 {
        if is_private {
            self.dm_aggregate_window_ms.unwrap_or(self.aggregate_window_ms)
        } else {
            self.group_aggregate_window_ms.unwrap_or(self.aggregate_window_ms)
        }
    }
}

/// Clamp helper applied at load time (guardrail bounds, spec §4.8).
pub fn clamp_task_max_runtime_ms(v: u64) -> u64 {
    v.clamp(5_000, 600_000)
}
pub fn clamp_task_max_retries(v: u32) -> u32 {
    v.clamp(0, 5)
}
pub fn clamp_task_max_concurrency(v: u32) -> u32 {
    v.clamp(1, 8)
}

// ── Automation (spec §4.13, §6) ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationTarget {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub route: String,
    pub execution_mode: ExecutionMode,
    pub job: AutomationJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    AgentOnly,
    LegacyDeliver,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationJob {
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: String,
    pub schedule: Schedule,
    pub message: String,
    pub thinking: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub smart: Option<SmartThrottle>,
}

fn default_job_type() -> String {
    "cron-agent-turn".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Schedule {
    Cron {
        expr: String,
        tz: Option<String>,
    },
    Every {
        every_ms: u64,
    },
    At {
        at: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartThrottle {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_silence_minutes")]
    pub min_silence_minutes: u64,
    #[serde(default = "default_active_conversation_minutes")]
    pub active_conversation_minutes: u64,
    #[serde(default = "default_random_interval_min_minutes")]
    pub random_interval_min_minutes: u64,
    #[serde(default = "default_random_interval_max_minutes")]
    pub random_interval_max_minutes: u64,
    #[serde(default = "default_max_chars")]
    pub max_chars: u32,
}

fn default_min_silence_minutes() -> u64 {
    30
}
fn default_active_conversation_minutes() -> u64 {
    25
}
fn default_random_interval_min_minutes() -> u64 {
    60
}
fn default_random_interval_max_minutes() -> u64 {
    180
}
fn default_max_chars() -> u32 {
    120
}

impl Default for SmartThrottle {
    fn default() -> Self {
        Self {
            enabled: true,
            min_silence_minutes: default_min_silence_minutes(),
            active_conversation_minutes: default_active_conversation_minutes(),
            random_interval_min_minutes: default_random_interval_min_minutes(),
            random_interval_max_minutes: default_random_interval_max_minutes(),
            max_chars: default_max_chars(),
        }
    }
}

/// `maxChars` must fall within `(8..200)` per spec §6.
pub fn clamp_max_chars(v: u32) -> u32 {
    v.clamp(8, 200)
}

/// Reconcile cadence floor (spec §4.13: `≥ 15s, default 120s`).
pub fn clamp_reconcile_interval_ms(v: u64) -> u64 {
    v.max(15_000)
}
pub fn default_reconcile_interval_ms() -> u64 {
    120_000
}

// ── Media relay (spec §4.11, §6) ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRelayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_relay_host")]
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    #[serde(default = "default_media_proxy_path")]
    pub path: String,
    pub token: Option<String>,
    #[serde(default = "default_media_proxy_ttl_sec")]
    pub ttl_sec: u64,
}

fn default_relay_host() -> String {
    "127.0.0.1".into()
}
fn default_relay_port() -> u16 {
    8765
}

impl Default for MediaRelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_relay_host(),
            port: default_relay_port(),
            path: default_media_proxy_path(),
            token: None,
            ttl_sec: default_media_proxy_ttl_sec(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_config_parses_minimal_yaml_with_defaults() {
        let yaml = "ws_url: ws://localhost:6700\naccess_token: secret\n";
        let cfg: ChannelAccountConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.aggregate_window_ms, 900);
        assert_eq!(cfg.reply_run_timeout_ms, 600_000);
        assert!(cfg.enable_deduplication);
        assert!(!cfg.enable_guilds);
        assert_eq!(cfg.interrupt_policy, InterruptPolicy::Adaptive);
    }

    #[test]
    fn interrupt_window_falls_back_to_aggregate_window() {
        let yaml = "ws_url: ws://x\naccess_token: t\naggregate_window_ms: 500\n";
        let cfg: ChannelAccountConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.interrupt_window_ms(), 500);
    }

    #[test]
    fn per_private_group_aggregate_window_overrides() {
        let yaml = "ws_url: ws://x\naccess_token: t\naggregate_window_ms: 900\ndm_aggregate_window_ms: 600\n";
        let cfg: ChannelAccountConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.aggregate_window_ms_for(true), 600);
        assert_eq!(cfg.aggregate_window_ms_for(false), 900);
    }

    #[test]
    fn task_guardrails_clamp_to_bounds() {
        assert_eq!(clamp_task_max_runtime_ms(1), 5_000);
        assert_eq!(clamp_task_max_runtime_ms(1_000_000), 600_000);
        assert_eq!(clamp_task_max_retries(99), 5);
        assert_eq!(clamp_task_max_concurrency(0), 1);
        assert_eq!(clamp_task_max_concurrency(99), 8);
    }

    #[test]
    fn smart_throttle_max_chars_clamps() {
        assert_eq!(clamp_max_chars(1), 8);
        assert_eq!(clamp_max_chars(999), 200);
        assert_eq!(clamp_max_chars(120), 120);
    }

    #[test]
    fn reconcile_interval_has_a_floor() {
        assert_eq!(clamp_reconcile_interval_ms(1000), 15_000);
        assert_eq!(clamp_reconcile_interval_ms(120_000), 120_000);
    }

    #[test]
    fn automation_target_parses_cron_schedule() {
        let yaml = r#"
id: nudge-1
route: "user:1001"
execution_mode: agent-only
job:
  type: cron-agent-turn
  schedule:
    kind: cron
    expr: "*/30 9-22 * * *"
    tz: "Asia/Shanghai"
  message: "check in"
  smart:
    enabled: true
    min_silence_minutes: 30
"#;
        let target: AutomationTarget = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(target.execution_mode, ExecutionMode::AgentOnly);
        match target.job.schedule {
            Schedule::Cron { expr, tz } => {
                assert_eq!(expr, "*/30 9-22 * * *");
                assert_eq!(tz.as_deref(), Some("Asia/Shanghai"));
            }
            _ => panic!("expected cron schedule"),
        }
        assert!(target.job.smart.unwrap().enabled);
    }

    #[test]
    fn automation_target_parses_every_schedule() {
        let yaml = "id: a\nroute: \"group:100001\"\nexecution_mode: legacy-deliver\njob:\n  schedule:\n    kind: every\n    every_ms: 60000\n  message: hi\n";
        let target: AutomationTarget = serde_yaml::from_str(yaml).unwrap();
        match target.job.schedule {
            Schedule::Every { every_ms } => assert_eq!(every_ms, 60_000),
            _ => panic!("expected every schedule"),
        }
    }
}
