// SPDX-License-Identifier: MIT
//! Per-target run state, persisted under the route's meta directory (spec
//! §4.13, §6: `meta/automation-latest.json` + `meta/automation-state.ndjson`).

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use qqgate_core::{route_dir_name, Route};
use serde::{Deserialize, Serialize};

use crate::smart::SkipReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Triggered,
    Skipped,
    Error,
}

/// `meta/automation-latest.json` — the last outcome for one target, reloaded
/// at startup so a restart doesn't immediately re-fire a target that just
/// ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetState {
    pub target_id: String,
    pub last_triggered_at_ms: Option<i64>,
    pub last_sent_at_ms: Option<i64>,
    pub next_eligible_at_ms: Option<i64>,
    pub last_run_result: RunResult,
    pub last_skip_reason: Option<SkipReason>,
    pub last_error: Option<String>,
    /// Cron double-fire guard: the `YYYYMMDDHHMM` bucket this target last
    /// fired in, so a reconcile tick landing twice in the same minute
    /// doesn't trigger twice.
    pub last_fired_bucket: Option<String>,
}

impl TargetState {
    pub fn fresh(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            last_triggered_at_ms: None,
            last_sent_at_ms: None,
            next_eligible_at_ms: None,
            last_run_result: RunResult::Skipped,
            last_skip_reason: None,
            last_error: None,
            last_fired_bucket: None,
        }
    }
}

/// One line of the append-only `automation-state.ndjson` audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct StateEvent<'a> {
    pub ts_ms: i64,
    pub target_id: &'a str,
    pub triggered: bool,
    pub produced: bool,
    pub skipped: bool,
    pub note: String,
}

pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn meta_dir(&self, route: &Route) -> PathBuf {
        self.root.join(route_dir_name(route)).join("meta")
    }

    pub fn load_latest(&self, route: &Route, target_id: &str) -> TargetState {
        let path = self.meta_dir(route).join("automation-latest.json");
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<TargetState>(&s).ok())
            .filter(|s| s.target_id == target_id)
            .unwrap_or_else(|| TargetState::fresh(target_id))
    }

    pub fn save_latest(&self, route: &Route, state: &TargetState) -> std::io::Result<()> {
        let dir = self.meta_dir(route);
        std::fs::create_dir_all(&dir)?;
        let body = serde_json::to_string_pretty(state).expect("TargetState always serializes");
        atomic_write(&dir.join("automation-latest.json"), body.as_bytes())
    }

    pub fn append_event(&self, route: &Route, event: &StateEvent<'_>) -> std::io::Result<()> {
        let dir = self.meta_dir(route);
        std::fs::create_dir_all(&dir)?;
        let mut line = serde_json::to_string(event).expect("StateEvent always serializes");
        line.push('\n');
        let mut file =
            OpenOptions::new().create(true).append(true).open(dir.join("automation-state.ndjson"))?;
        file.write_all(line.as_bytes())
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_latest_defaults_to_fresh_when_absent() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let route = Route::User("2151539153".into());
        let state = store.load_latest(&route, "t1");
        assert_eq!(state.target_id, "t1");
        assert!(state.last_triggered_at_ms.is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let route = Route::Group("100001".into());
        let mut state = TargetState::fresh("t1");
        state.last_triggered_at_ms = Some(42);
        state.last_run_result = RunResult::Triggered;
        store.save_latest(&route, &state).unwrap();

        let reloaded = store.load_latest(&route, "t1");
        assert_eq!(reloaded.last_triggered_at_ms, Some(42));
        assert_eq!(reloaded.last_run_result, RunResult::Triggered);
    }

    #[test]
    fn stale_state_for_a_different_target_id_is_discarded() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let route = Route::User("2151539153".into());
        store.save_latest(&route, &TargetState::fresh("old-target")).unwrap();
        let state = store.load_latest(&route, "new-target");
        assert_eq!(state.target_id, "new-target");
    }

    #[test]
    fn append_event_writes_ndjson_lines() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let route = Route::User("2151539153".into());
        store
            .append_event(
                &route,
                &StateEvent {
                    ts_ms: 0,
                    target_id: "t1",
                    triggered: true,
                    produced: false,
                    skipped: true,
                    note: "skip:active_conversation".into(),
                },
            )
            .unwrap();
        let content =
            std::fs::read_to_string(store.meta_dir(&route).join("automation-state.ndjson")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("active_conversation"));
    }
}
