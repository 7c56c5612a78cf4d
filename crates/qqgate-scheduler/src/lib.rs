// SPDX-License-Identifier: MIT
//! Automation scheduler (spec §4.13): periodic reconcile of cron/every/at
//! targets, smart-silence throttling, and the on-disk run-state trail that
//! survives a restart.

pub mod cron;
pub mod reconciler;
pub mod smart;
pub mod state;

pub use cron::{CronError, CronMatcher};
pub use reconciler::{ActivityLookup, Reconciler, ReconcilerConfig, TriggerSink};
pub use smart::{ActivitySnapshot, SkipReason};
pub use state::{RunResult, StateStore, TargetState};
