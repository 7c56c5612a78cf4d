// SPDX-License-Identifier: MIT
//! Fail-fast config validation (SPEC_FULL §A.3): route shapes, cron
//! expressions, and the `every` schedule's lower bound are checked once at
//! load time rather than at first use.

use std::str::FromStr;

use crate::schema::{Config, Schedule};
use qqgate_core::Route;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("account[{index}]: ws_url must not be empty")]
    EmptyWsUrl { index: usize },
    #[error("account[{index}]: access_token must not be empty")]
    EmptyAccessToken { index: usize },
    #[error("automation[{id}]: invalid route {route:?}")]
    InvalidRoute { id: String, route: String },
    #[error("automation[{id}]: invalid cron expression {expr:?}: {reason}")]
    InvalidCron {
        id: String,
        expr: String,
        reason: String,
    },
    #[error("automation[{id}]: `every` schedule must be at least 60000ms, got {every_ms}")]
    EveryTooShort { id: String, every_ms: u64 },
    #[error("automation[{id}]: `at` timestamp {at:?} is not a valid RFC3339 datetime")]
    InvalidAt { id: String, at: String },
}

/// Validate a fully-merged [`Config`]. Errors surface at startup rather
/// than the first time a bad target or account would have been used.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    for (index, account) in config.accounts.iter().enumerate() {
        if account.ws_url.trim().is_empty() {
            return Err(ConfigError::EmptyWsUrl { index });
        }
        if account.access_token.trim().is_empty() {
            return Err(ConfigError::EmptyAccessToken { index });
        }
    }

    for target in &config.automation {
        if !Route::is_valid(&target.route) {
            return Err(ConfigError::InvalidRoute {
                id: target.id.clone(),
                route: target.route.clone(),
            });
        }
        match &target.job.schedule {
            Schedule::Cron { expr, .. } => {
                validate_cron_expr(expr).map_err(|reason| ConfigError::InvalidCron {
                    id: target.id.clone(),
                    expr: expr.clone(),
                    reason,
                })?;
            }
            Schedule::Every { every_ms } => {
                if *every_ms < 60_000 {
                    return Err(ConfigError::EveryTooShort {
                        id: target.id.clone(),
                        every_ms: *every_ms,
                    });
                }
            }
            Schedule::At { at } => {
                if chrono::DateTime::parse_from_rfc3339(at).is_err() {
                    return Err(ConfigError::InvalidAt {
                        id: target.id.clone(),
                        at: at.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Validate a 5-field cron expression (`minute hour day-of-month month
/// day-of-week`) by delegating to the `cron` crate, which expects a leading
/// seconds field — we pin it to `0`.
fn validate_cron_expr(expr: &str) -> Result<(), String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    }
    let six_field = format!("0 {expr}");
    cron::Schedule::from_str(&six_field)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AutomationJob, AutomationTarget, ChannelAccountConfig, ExecutionMode};

    fn base_config() -> Config {
        Config::default()
    }

    #[test]
    fn rejects_empty_ws_url() {
        let mut cfg = base_config();
        cfg.accounts.push(ChannelAccountConfig {
            ws_url: "".into(),
            ..minimal_account()
        });
        assert!(matches!(validate(&cfg), Err(ConfigError::EmptyWsUrl { .. })));
    }

    fn minimal_account() -> ChannelAccountConfig {
        serde_yaml::from_str("ws_url: ws://x\naccess_token: t\n").unwrap()
    }

    #[test]
    fn rejects_invalid_automation_route() {
        let mut cfg = base_config();
        cfg.automation.push(AutomationTarget {
            id: "a".into(),
            enabled: true,
            route: "not-a-route".into(),
            execution_mode: ExecutionMode::AgentOnly,
            job: AutomationJob {
                job_type: "cron-agent-turn".into(),
                schedule: Schedule::Every { every_ms: 60_000 },
                message: "hi".into(),
                thinking: None,
                model: None,
                timeout_seconds: None,
                smart: None,
            },
        });
        assert!(matches!(validate(&cfg), Err(ConfigError::InvalidRoute { .. })));
    }

    #[test]
    fn rejects_every_below_60s() {
        let mut cfg = base_config();
        cfg.automation.push(AutomationTarget {
            id: "a".into(),
            enabled: true,
            route: "user:12345".into(),
            execution_mode: ExecutionMode::AgentOnly,
            job: AutomationJob {
                job_type: "cron-agent-turn".into(),
                schedule: Schedule::Every { every_ms: 1000 },
                message: "hi".into(),
                thinking: None,
                model: None,
                timeout_seconds: None,
                smart: None,
            },
        });
        assert!(matches!(validate(&cfg), Err(ConfigError::EveryTooShort { .. })));
    }

    #[test]
    fn accepts_valid_cron_expr() {
        assert!(validate_cron_expr("*/30 9-22 * * *").is_ok());
    }

    #[test]
    fn rejects_malformed_cron_expr() {
        assert!(validate_cron_expr("not a cron").is_err());
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(validate_cron_expr("* * *").is_err());
    }
}
