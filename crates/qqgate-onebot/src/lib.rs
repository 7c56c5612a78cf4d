// SPDX-License-Identifier: MIT
//! OneBot v11 transport, route-scoped dispatch engine, media resolution and
//! materialization, outbound delivery, task offload, and automation policy.
//!
//! This crate has no knowledge of the agent runtime it bridges to (that
//! boundary is [`qqgate_core::AgentRuntime`]) or of the chat platform's
//! HTTP/websocket transport framing beyond OneBot's own JSON wire shape.

pub mod aggregator;
pub mod delivery;
pub mod diagnostics;
pub mod dispatch;
pub mod media;
pub mod normalizer;
pub mod policy;
pub mod proactive;
pub mod protocol;
pub mod route_runtime;
pub mod sender;
pub mod tasks;

use qqgate_core::{session_key as core_session_key, Route, SessionKey};

/// Session key for a route with no owner-user context available.
///
/// The dispatch engine's pending-latest drain path doesn't carry the
/// configured owner's user id (it only ever sees routes, not account
/// config), so it can't distinguish the owner's private route from an
/// ordinary one here. That only matters for [`qqgate_core::ResidentAgentId`]
/// resolution, which this helper doesn't need — it exists purely to key
/// per-session dispatcher state, and a route alone is already unique for
/// that purpose, since two different owners never share a `DispatchEngine`.
pub fn session_key_for(route: &Route) -> SessionKey {
    core_session_key(route, None)
}
