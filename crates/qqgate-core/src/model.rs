// SPDX-License-Identifier: MIT
//! Persisted per-route data model (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Dispatcher behavior flags carried in route metadata (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherRules {
    #[serde(default)]
    pub heavy_task_delegation: bool,
    #[serde(default)]
    pub ack_then_async_result: bool,
    #[serde(default)]
    pub idempotency_required: bool,
    #[serde(default)]
    pub strict_route_isolation: bool,
}

/// Per-route capability flags and send limits (spec §3, §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCapabilities {
    #[serde(default)]
    pub send_text: bool,
    #[serde(default)]
    pub send_media: bool,
    #[serde(default)]
    pub send_voice: bool,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub max_send_text: Option<u64>,
    #[serde(default)]
    pub max_send_media: Option<u64>,
    #[serde(default)]
    pub max_send_voice: Option<u64>,
}

impl RouteCapabilities {
    /// The owner's private route is always full-capability (spec §3).
    pub fn owner_full() -> Self {
        Self {
            send_text: true,
            send_media: true,
            send_voice: true,
            skills: Vec::new(),
            max_send_text: None,
            max_send_media: None,
            max_send_voice: None,
        }
    }

    pub fn default_restricted() -> Self {
        Self {
            send_text: true,
            send_media: false,
            send_voice: false,
            skills: Vec::new(),
            max_send_text: None,
            max_send_media: None,
            max_send_voice: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Text,
    Media,
    Voice,
}

impl RouteCapabilities {
    pub fn allows(&self, kind: SendKind) -> bool {
        match kind {
            SendKind::Text => self.send_text,
            SendKind::Media => self.send_media,
            SendKind::Voice => self.send_voice,
        }
    }

    pub fn limit(&self, kind: SendKind) -> Option<u64> {
        match kind {
            SendKind::Text => self.max_send_text,
            SendKind::Media => self.max_send_media,
            SendKind::Voice => self.max_send_voice,
        }
    }
}

/// `agent.json` — route metadata, created on first inbound, never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteMetadata {
    pub agent_id: String,
    pub route: String,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub bound_to_main: bool,
    #[serde(default)]
    pub orchestration_mode: String,
    #[serde(default)]
    pub dispatcher_rules: DispatcherRules,
    pub capabilities: RouteCapabilities,
}

impl RouteMetadata {
    pub fn new_owner(route: String, agent_id: String, account_id: String) -> Self {
        let ts = now();
        Self {
            agent_id,
            route,
            account_id,
            created_at: ts,
            updated_at: ts,
            bound_to_main: true,
            orchestration_mode: "agent-only".into(),
            dispatcher_rules: DispatcherRules::default(),
            capabilities: RouteCapabilities::owner_full(),
        }
    }

    pub fn new_resident(route: String, agent_id: String, account_id: String) -> Self {
        let ts = now();
        Self {
            agent_id,
            route,
            account_id,
            created_at: ts,
            updated_at: ts,
            bound_to_main: false,
            orchestration_mode: "agent-only".into(),
            dispatcher_rules: DispatcherRules::default(),
            capabilities: RouteCapabilities::default_restricted(),
        }
    }
}

/// `usage.json` — per-route usage counters, monotonically increasing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteUsage {
    #[serde(default)]
    pub dispatch_count: u64,
    #[serde(default)]
    pub send_text_count: u64,
    #[serde(default)]
    pub send_media_count: u64,
    #[serde(default)]
    pub send_voice_count: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RouteUsage {
    pub fn bump(&mut self, kind: SendKind) {
        match kind {
            SendKind::Text => self.send_text_count += 1,
            SendKind::Media => self.send_media_count += 1,
            SendKind::Voice => self.send_voice_count += 1,
        }
        self.updated_at = Some(now());
    }

    pub fn bump_dispatch(&mut self) {
        self.dispatch_count += 1;
        self.updated_at = Some(now());
    }

    pub fn used(&self, kind: SendKind) -> u64 {
        match kind {
            SendKind::Text => self.send_text_count,
            SendKind::Media => self.send_media_count,
            SendKind::Voice => self.send_voice_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMood {
    Neutral,
    Cold,
    Annoyed,
    Tired,
}

impl Default for ConversationMood {
    fn default() -> Self {
        ConversationMood::Neutral
    }
}

/// `state.json` — conversation state (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub affinity: i32,
    #[serde(default)]
    pub mood: ConversationMood,
    #[serde(default)]
    pub banter_count: u64,
    #[serde(default)]
    pub image_window_start_ms: i64,
    #[serde(default)]
    pub image_count_in_window: u32,
    pub last_updated_at: DateTime<Utc>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            affinity: 0,
            mood: ConversationMood::Neutral,
            banter_count: 0,
            image_window_start_ms: 0,
            image_count_in_window: 0,
            last_updated_at: now(),
        }
    }
}

/// Outbound images allowed per rolling window (spec §3).
pub const IMAGE_QUOTA_WINDOW_MS: i64 = 2 * 60 * 60 * 1000;
pub const IMAGE_QUOTA_PER_WINDOW: u32 = 5;

impl ConversationState {
    pub fn clamp_affinity(&mut self) {
        self.affinity = self.affinity.clamp(-100, 100);
    }

    /// Returns true and bumps the window counter if an outbound image is
    /// still allowed under the rolling 2h/5-image quota (spec §3).
    pub fn try_consume_image_quota(&mut self, now_ms: i64) -> bool {
        if now_ms - self.image_window_start_ms >= IMAGE_QUOTA_WINDOW_MS {
            self.image_window_start_ms = now_ms;
            self.image_count_in_window = 0;
        }
        if self.image_count_in_window >= IMAGE_QUOTA_PER_WINDOW {
            return false;
        }
        self.image_count_in_window += 1;
        true
    }
}

/// One candidate's field-naming source (spec §3 "Materialize result").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameSource {
    Hint,
    Url,
    Download,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtSource {
    Original,
    Url,
    Buffer,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializeResult {
    pub url: String,
    pub output_url: Option<String>,
    pub materialized: bool,
    pub error_code: Option<String>,
    pub http_status: Option<u16>,
    pub retry_count: Option<u32>,
    pub original_filename: Option<String>,
    pub final_filename: Option<String>,
    pub name_source: Option<NameSource>,
    pub ext_source: Option<ExtSource>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
