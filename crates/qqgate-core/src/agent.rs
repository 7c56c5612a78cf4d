// SPDX-License-Identifier: MIT
//! The agent-runtime collaborator boundary (spec §1 Non-goals, §4.7).
//!
//! The conversational-agent runtime itself is explicitly out of scope — it
//! is "opaque `dispatchReply(ctx, opts)` with cancellation". This module
//! defines the trait the dispatch engine calls through; a concrete
//! implementation (backed by whatever LLM orchestration lives elsewhere in
//! the deployment) is wired in at startup.

use async_trait::async_trait;
use std::fmt;

use crate::route::{Route, SessionKey};

/// One logical inbound message handed to the agent runtime for a turn.
#[derive(Debug, Clone)]
pub struct AgentReplyOptions {
    pub route: Route,
    pub session_key: SessionKey,
    pub msg_id: Option<String>,
    pub dispatch_id: String,
    pub text: String,
    pub media_urls: Vec<String>,
    pub media_items_total: usize,
    /// True when the dispatch engine already sent a fast-ack (spec §4.7)
    /// before invoking the agent, so the runtime need not repeat one.
    pub fast_ack_sent: bool,
}

/// A reply segment the agent runtime hands back to the dispatch engine for
/// delivery. The engine forwards each one to the delivery queue tagged with
/// the originating dispatch-id (spec §4.7, §4.9).
#[derive(Debug, Clone)]
pub enum AgentReplySegment {
    Text(String),
    Media { url: String, kind: MediaSegmentKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSegmentKind {
    Image,
    Record,
    Video,
    File,
}

/// Callback the dispatch engine passes into the agent runtime so it can
/// stream replies out as they're produced, rather than buffering an entire
/// turn before any delivery starts.
#[async_trait]
pub trait DeliverReply: Send + Sync {
    async fn deliver(&self, segment: AgentReplySegment);
}

/// Outcome of one agent-runtime invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRunOutcome {
    /// The agent produced at least one reply segment and returned normally.
    Completed,
    /// The agent returned without producing any reply segment.
    CompletedEmpty,
    /// The run was aborted cooperatively via the cancellation token.
    Aborted,
}

#[derive(Debug)]
pub struct AgentRunError(pub String);

impl fmt::Display for AgentRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent run failed: {}", self.0)
    }
}

impl std::error::Error for AgentRunError {}

/// The opaque collaborator. Implementations must be cooperative: once
/// `cancel` is signalled they should stop producing new reply segments and
/// return `Aborted` promptly (spec §5 "Cancellation and timeouts").
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run(
        &self,
        opts: AgentReplyOptions,
        deliver: &(dyn DeliverReply),
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<AgentRunOutcome, AgentRunError>;

    /// Ensure the resident agent for this session is registered / resolvable.
    /// Rate-limited upstream to at most one attempt per 60s per agent-id
    /// (spec §5 "ensure agent visible").
    async fn ensure_agent(&self, session_key: &SessionKey) -> Result<(), AgentRunError>;
}
