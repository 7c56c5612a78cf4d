// SPDX-License-Identifier: MIT
//! The closed error/drop-reason taxonomy (spec §7).
//!
//! Every drop or failure surfaced to diagnostics, delivery, or the fallback
//! policy carries one of these codes — nothing in this workspace invents a
//! stringly-typed reason at a call site.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    DispatchAborted,
    DispatchIdMismatch,
    AbortTextSuppressed,
    DuplicateTextSuppressed,
    PolicyBlocked,
    QuotaExceeded,
    AutomationMetaLeakGuard,
    DispatchTimeout,
    TransportUnavailable,
    ResolveActionFailed,
    MaterializeHttpFailed,
    MaterializeEmptyPayload,
    FileNotFound,
    ContainerLocalUnreadable,
    DuplicatePayload,
    UnsupportedSource,
    PathOutsideAllowlist,
    MigrationIoFailed,
    GroupMemberLookupFailed,
    QueuedSupersededByNewerInbound,
    MergedIntoNewerInbound,
    RouteGenerationStale,
    UnknownError,
}

impl DropReason {
    /// spec §7: reasons eligible for the bounded fallback message, i.e. a
    /// dispatch that delivered nothing may still speak once.
    pub fn is_fallback_eligible(self) -> bool {
        !matches!(
            self,
            DropReason::DuplicateTextSuppressed
                | DropReason::AbortTextSuppressed
                | DropReason::AutomationMetaLeakGuard
                | DropReason::DispatchAborted
                | DropReason::DispatchIdMismatch
                | DropReason::PolicyBlocked
                | DropReason::QuotaExceeded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::DispatchAborted => "dispatch_aborted",
            DropReason::DispatchIdMismatch => "dispatch_id_mismatch",
            DropReason::AbortTextSuppressed => "abort_text_suppressed",
            DropReason::DuplicateTextSuppressed => "duplicate_text_suppressed",
            DropReason::PolicyBlocked => "policy_blocked",
            DropReason::QuotaExceeded => "quota_exceeded",
            DropReason::AutomationMetaLeakGuard => "automation_meta_leak_guard",
            DropReason::DispatchTimeout => "dispatch_timeout",
            DropReason::TransportUnavailable => "transport_unavailable",
            DropReason::ResolveActionFailed => "resolve_action_failed",
            DropReason::MaterializeHttpFailed => "materialize_http_failed",
            DropReason::MaterializeEmptyPayload => "materialize_empty_payload",
            DropReason::FileNotFound => "file_not_found",
            DropReason::ContainerLocalUnreadable => "container_local_unreadable",
            DropReason::DuplicatePayload => "duplicate_payload",
            DropReason::UnsupportedSource => "unsupported_source",
            DropReason::PathOutsideAllowlist => "path_outside_allowlist",
            DropReason::MigrationIoFailed => "migration_io_failed",
            DropReason::GroupMemberLookupFailed => "group_member_lookup_failed",
            DropReason::QueuedSupersededByNewerInbound => "queued_superseded_by_newer_inbound",
            DropReason::MergedIntoNewerInbound => "merged_into_newer_inbound",
            DropReason::RouteGenerationStale => "route_generation_stale",
            DropReason::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
