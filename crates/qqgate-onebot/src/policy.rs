// SPDX-License-Identifier: MIT
//! Policy & quota (spec §4.12): route capability gates and usage-counter
//! quota checks, applied before dispatch and before each outbound send.

use qqgate_core::{DropReason, Route, RouteCapabilities, RouteUsage, SendKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStage {
    BeforeDispatch,
    BeforeOutbound,
}

/// Per-route policy state handed in by the caller at check time — kept
/// outside this module since route metadata/usage persistence belongs to
/// the caller's session store.
pub struct PolicyInputs<'a> {
    pub route: &'a Route,
    pub is_owner_private_route: bool,
    pub capabilities: &'a RouteCapabilities,
    pub usage: &'a RouteUsage,
}

/// `checkConversationPolicyHook` (spec §4.12). `beforeDispatch` requires
/// `sendText`; `beforeOutbound` with an action enforces the matching
/// capability flag and then the usage quota. The owner's private route
/// bypasses both checks.
pub fn check_policy(
    stage: PolicyStage,
    action: Option<SendKind>,
    inputs: &PolicyInputs,
) -> Result<(), DropReason> {
    if inputs.is_owner_private_route {
        return Ok(());
    }

    match stage {
        PolicyStage::BeforeDispatch => {
            if !inputs.capabilities.allows(SendKind::Text) {
                return Err(DropReason::PolicyBlocked);
            }
        }
        PolicyStage::BeforeOutbound => {
            let Some(kind) = action else { return Ok(()) };
            if !inputs.capabilities.allows(kind) {
                return Err(DropReason::PolicyBlocked);
            }
            if let Some(limit) = inputs.capabilities.limit(kind) {
                if inputs.usage.used(kind) >= limit {
                    return Err(DropReason::QuotaExceeded);
                }
            }
        }
    }

    Ok(())
}
