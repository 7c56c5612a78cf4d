// SPDX-License-Identifier: MIT
//! Smart-throttle guard (spec §4.13): skip an otherwise-due automation
//! target when the conversation doesn't actually look like it wants one.

use qqgate_config::SmartThrottle;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoInboundYet,
    SilenceNotReached,
    ActiveConversation,
    IntervalNotReached,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NoInboundYet => "no_inbound_yet",
            SkipReason::SilenceNotReached => "silence_not_reached",
            SkipReason::ActiveConversation => "active_conversation",
            SkipReason::IntervalNotReached => "interval_not_reached",
        }
    }
}

/// What the smart guard needs to know about a route's recent activity and
/// this target's last successful send.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivitySnapshot {
    pub last_inbound_at_ms: Option<i64>,
    /// Last inbound OR outbound activity, whichever is more recent.
    pub last_activity_at_ms: Option<i64>,
    pub last_sent_at_ms: Option<i64>,
}

/// Evaluate the smart-throttle guard for one due target. `random_interval_ms`
/// is drawn once per evaluation from `[min, max]` minutes (spec §4.13
/// `interval_not_reached`) — the caller supplies it so the draw itself stays
/// testable and isn't hidden inside this function.
pub fn evaluate(
    throttle: &SmartThrottle,
    activity: ActivitySnapshot,
    now_ms: i64,
    random_interval_ms: i64,
) -> Option<SkipReason> {
    if !throttle.enabled {
        return None;
    }

    let Some(last_inbound) = activity.last_inbound_at_ms else {
        return Some(SkipReason::NoInboundYet);
    };

    let min_silence_ms = (throttle.min_silence_minutes as i64) * 60_000;
    if now_ms - last_inbound < min_silence_ms {
        return Some(SkipReason::SilenceNotReached);
    }

    let active_ms = (throttle.active_conversation_minutes as i64) * 60_000;
    if let Some(last_activity) = activity.last_activity_at_ms {
        if now_ms - last_activity < active_ms {
            return Some(SkipReason::ActiveConversation);
        }
    }

    if let Some(last_sent) = activity.last_sent_at_ms {
        if now_ms - last_sent < random_interval_ms {
            return Some(SkipReason::IntervalNotReached);
        }
    }

    None
}

/// Draws a millisecond interval uniformly from
/// `[randomIntervalMinMinutes, randomIntervalMaxMinutes]` (spec §4.13).
pub fn draw_random_interval_ms(throttle: &SmartThrottle) -> i64 {
    let lo = throttle.random_interval_min_minutes.min(throttle.random_interval_max_minutes);
    let hi = throttle.random_interval_min_minutes.max(throttle.random_interval_max_minutes);
    let minutes = if lo == hi { lo } else { rand::thread_rng().gen_range(lo..=hi) };
    (minutes as i64) * 60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> SmartThrottle {
        SmartThrottle {
            enabled: true,
            min_silence_minutes: 30,
            active_conversation_minutes: 25,
            random_interval_min_minutes: 60,
            random_interval_max_minutes: 60,
            max_chars: 120,
        }
    }

    #[test]
    fn disabled_throttle_never_skips() {
        let t = SmartThrottle { enabled: false, ..throttle() };
        assert_eq!(evaluate(&t, ActivitySnapshot::default(), 1_000_000, 0), None);
    }

    #[test]
    fn no_inbound_ever_skips() {
        assert_eq!(
            evaluate(&throttle(), ActivitySnapshot::default(), 1_000_000, 0),
            Some(SkipReason::NoInboundYet)
        );
    }

    #[test]
    fn silence_window_not_elapsed_skips() {
        let activity = ActivitySnapshot { last_inbound_at_ms: Some(0), ..Default::default() };
        assert_eq!(evaluate(&throttle(), activity, 5 * 60_000, 0), Some(SkipReason::SilenceNotReached));
    }

    #[test]
    fn active_conversation_skips_even_after_silence_elapses() {
        let activity = ActivitySnapshot {
            last_inbound_at_ms: Some(0),
            last_activity_at_ms: Some(35 * 60_000),
            ..Default::default()
        };
        assert_eq!(evaluate(&throttle(), activity, 40 * 60_000, 0), Some(SkipReason::ActiveConversation));
    }

    #[test]
    fn interval_not_reached_skips_when_sent_recently() {
        let activity = ActivitySnapshot {
            last_inbound_at_ms: Some(0),
            last_activity_at_ms: Some(0),
            last_sent_at_ms: Some(40 * 60_000),
        };
        assert_eq!(
            evaluate(&throttle(), activity, 50 * 60_000, 60 * 60_000),
            Some(SkipReason::IntervalNotReached)
        );
    }

    #[test]
    fn fires_when_every_guard_clears() {
        let activity = ActivitySnapshot {
            last_inbound_at_ms: Some(0),
            last_activity_at_ms: Some(0),
            last_sent_at_ms: Some(0),
        };
        assert_eq!(evaluate(&throttle(), activity, 120 * 60_000, 60 * 60_000), None);
    }
}
