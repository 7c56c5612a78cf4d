// SPDX-License-Identifier: MIT
//! Cron expression matching (spec §4.13: `minute hour dom month dow`,
//! optional IANA timezone).
//!
//! The `cron` crate parses six-field expressions with a leading seconds
//! field; the spec's targets are the conventional five-field unix form, so
//! every expression gets `0` prepended before handing it to `Schedule`.

use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidExpr { expr: String, source: cron::error::Error },
    #[error("unknown timezone {0:?}")]
    UnknownTz(String),
}

pub struct CronMatcher {
    schedule: Schedule,
    tz: Tz,
}

impl CronMatcher {
    pub fn parse(expr: &str, tz: Option<&str>) -> Result<Self, CronError> {
        let six_field = format!("0 {expr}");
        let schedule = Schedule::from_str(&six_field)
            .map_err(|source| CronError::InvalidExpr { expr: expr.to_string(), source })?;
        let tz = match tz {
            Some(name) => Tz::from_str(name).map_err(|_| CronError::UnknownTz(name.to_string()))?,
            None => Tz::UTC,
        };
        Ok(Self { schedule, tz })
    }

    /// True if `now` falls within the current due minute for this schedule,
    /// evaluated in the schedule's timezone.
    ///
    /// `Schedule::includes` checks the seconds field too, and every
    /// expression here is parsed with a fixed `0` seconds field (see
    /// `parse`). The reconcile loop ticks at an arbitrary second, so this
    /// truncates `now` to the start of its minute before asking `cron`
    /// whether that minute is due, instead of asking about the exact
    /// instant (which would only ever be true at `:00`).
    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        let at_tz = now.with_timezone(&self.tz);
        let minute_start = at_tz
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))
            .unwrap_or(at_tz);
        self.schedule.includes(minute_start)
    }

    /// `YYYYMMDDHHMM` in the schedule's timezone — the double-fire guard
    /// bucket key (spec §4.13).
    pub fn bucket_key(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&self.tz).format("%Y%m%d%H%M").to_string()
    }
}
