// SPDX-License-Identifier: MIT
mod agent;
mod error;
mod model;
mod redact;
mod route;
mod store;

pub use agent::{
    AgentReplyOptions, AgentReplySegment, AgentRunError, AgentRunOutcome, AgentRuntime,
    DeliverReply, MediaSegmentKind,
};
pub use error::DropReason;
pub use model::{
    ConversationMood, ConversationState, DispatcherRules, MaterializeResult, RouteCapabilities,
    RouteMetadata, RouteUsage, SendKind,
};
pub use redact::redact_text;
pub use route::{parse_target, route_dir_name, session_key, ResidentAgentId, Route, SessionKey};
pub use store::RouteStore;
