// SPDX-License-Identifier: MIT
//! On-disk per-route metadata store (spec §3, §6 "Persisted layout"): the
//! `agent.json` / `state.json` / `usage.json` triad that lives directly
//! under `<workspace>/qq_sessions/<route-dir>/`, distinct from the `meta/`
//! subdirectory the task-unit and automation subsystems own.
//!
//! Writes are write-then-rename so a crash mid-write never leaves a
//! truncated file behind; reads fall back to a fresh default rather than
//! erroring; a route's files are created lazily on first inbound.

use std::path::{Path, PathBuf};

use crate::model::{ConversationState, RouteMetadata, RouteUsage};
use crate::route::{route_dir_name, Route};

pub struct RouteStore {
    root: PathBuf,
}

impl RouteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn route_dir(&self, route: &Route) -> PathBuf {
        self.root.join(route_dir_name(route))
    }

    /// Loads `agent.json`, creating it (as owner or resident per
    /// `is_owner`) if this route has never been seen before.
    pub fn load_or_init_metadata(
        &self,
        route: &Route,
        is_owner: bool,
        agent_id: &str,
        account_id: &str,
    ) -> std::io::Result<RouteMetadata> {
        let path = self.route_dir(route).join("agent.json");
        if let Some(existing) = read_json::<RouteMetadata>(&path) {
            return Ok(existing);
        }
        let fresh = if is_owner {
            RouteMetadata::new_owner(route.to_string(), agent_id.to_string(), account_id.to_string())
        } else {
            RouteMetadata::new_resident(route.to_string(), agent_id.to_string(), account_id.to_string())
        };
        self.save_metadata(route, &fresh)?;
        Ok(fresh)
    }

    pub fn save_metadata(&self, route: &Route, metadata: &RouteMetadata) -> std::io::Result<()> {
        self.write(route, "agent.json", metadata)
    }

    pub fn load_state(&self, route: &Route) -> ConversationState {
        read_json(&self.route_dir(route).join("state.json")).unwrap_or_default()
    }

    pub fn save_state(&self, route: &Route, state: &ConversationState) -> std::io::Result<()> {
        self.write(route, "state.json", state)
    }

    pub fn load_usage(&self, route: &Route) -> RouteUsage {
        read_json(&self.route_dir(route).join("usage.json")).unwrap_or_default()
    }

    pub fn save_usage(&self, route: &Route, usage: &RouteUsage) -> std::io::Result<()> {
        self.write(route, "usage.json", usage)
    }

    fn write(&self, route: &Route, file_name: &str, value: &impl serde::Serialize) -> std::io::Result<()> {
        let dir = self.route_dir(route);
        std::fs::create_dir_all(&dir)?;
        let body = serde_json::to_string_pretty(value).expect("route metadata always serializes");
        atomic_write(&dir.join(file_name), body.as_bytes())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    std::fs::read_to_string(path).ok().and_then(|s| serde_json::from_str(&s).ok())
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
    fn first_load_for_owner_creates_full_capabilities() {
        let dir = tempdir().unwrap();
        let store = RouteStore::new(dir.path());
        let route = Route::User("2151539153".into());
        let meta = store.load_or_init_metadata(&route, true, "agent-1", "acc-1").unwrap();
        assert!(meta.capabilities.send_media);
        assert!(dir.path().join(route_dir_name(&route)).join("agent.json").is_file());
    }

    #[test]
    fn first_load_for_resident_creates_restricted_capabilities() {
        let dir = tempdir().unwrap();
        let store = RouteStore::new(dir.path());
        let route = Route::Group("100001".into());
        let meta = store.load_or_init_metadata(&route, false, "agent-1", "acc-1").unwrap();
        assert!(!meta.capabilities.send_media);
    }

    #[test]
    fn second_load_reuses_the_persisted_file() {
        let dir = tempdir().unwrap();
        let store = RouteStore::new(dir.path());
        let route = Route::User("2151539153".into());
        let first = store.load_or_init_metadata(&route, true, "agent-1", "acc-1").unwrap();
        let created_at = first.created_at;
        let second = store.load_or_init_metadata(&route, true, "agent-1", "acc-1").unwrap();
        assert_eq!(second.created_at, created_at);
    }

    #[test]
    fn usage_round_trips() {
        let dir = tempdir().unwrap();
        let store = RouteStore::new(dir.path());
        let route = Route::Group("100002".into());
        let mut usage = store.load_usage(&route);
        usage.bump_dispatch();
        store.save_usage(&route, &usage).unwrap();
        let reloaded = store.load_usage(&route);
        assert_eq!(reloaded.dispatch_count, 1);
    }

    #[test]
    fn state_missing_file_yields_default() {
        let dir = tempdir().unwrap();
        let store = RouteStore::new(dir.path());
        let route = Route::User("2151539153".into());
        let state = store.load_state(&route);
        assert_eq!(state.affinity, 0);
    }
}
