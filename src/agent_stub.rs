// SPDX-License-Identifier: MIT
//! Built-in [`AgentRuntime`] (spec §1 "Out of scope: the agent runtime").
//!
//! The real conversational-agent orchestration this gateway dispatches into
//! is explicitly a collaborator the spec does not redesign — "opaque
//! `dispatchReply(ctx, opts)` with cancellation". This module supplies the
//! minimal concrete implementation the binary needs to be runnable on its
//! own: it echoes the inbound text back, honoring cancellation and the
//! fast-ack/media-present distinctions the trait models. A real deployment
//! swaps this out for its own [`AgentRuntime`] at the construction site in
//! [`crate::gateway`] — there is no plugin boundary beyond the trait itself.

use async_trait::async_trait;
use qqgate_core::{
    AgentReplyOptions, AgentReplySegment, AgentRunError, AgentRunOutcome, AgentRuntime,
    DeliverReply, SessionKey,
};
use tokio_util::sync::CancellationToken;

pub struct EchoAgentRuntime;

#[async_trait]
impl AgentRuntime for EchoAgentRuntime {
    async fn run(
        &self,
        opts: AgentReplyOptions,
        deliver: &(dyn DeliverReply),
        cancel: CancellationToken,
    ) -> Result<AgentRunOutcome, AgentRunError> {
        if opts.text.trim().is_empty() && opts.media_urls.is_empty() {
            return Ok(AgentRunOutcome::CompletedEmpty);
        }
        tokio::select! {
            _ = cancel.cancelled() => Ok(AgentRunOutcome::Aborted),
            _ = async {
                let reply = if opts.media_urls.is_empty() {
                    format!("echo: {}", opts.text)
                } else {
                    format!("echo: {} (+{} media)", opts.text, opts.media_urls.len())
                };
                deliver.deliver(AgentReplySegment::Text(reply)).await;
            } => Ok(AgentRunOutcome::Completed),
        }
    }

    async fn ensure_agent(&self, _session_key: &SessionKey) -> Result<(), AgentRunError> {
        Ok(())
    }
}
