// SPDX-License-Identifier: MIT
//! In-memory id→path registry. The relay never puts a filesystem path in a
//! URL — only an opaque id — so the signed token can't be used to probe
//! arbitrary paths even if the signature were somehow forged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

struct Entry {
    path: PathBuf,
    expires_at: i64,
}

#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, id: String, path: PathBuf, expires_at: i64) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries.insert(id, Entry { path, expires_at });
    }

    /// Returns the registered path if `id` exists and hasn't expired.
    pub fn resolve(&self, id: &str, now: i64) -> Option<PathBuf> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.get(id).filter(|e| e.expires_at >= now).map(|e| e.path.clone())
    }

    /// Drops every entry that expired before `now`. Run periodically so a
    /// long-lived relay doesn't accumulate one entry per ever-sent file.
    pub fn sweep_expired(&self, now: i64) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries.retain(|_, e| e.expires_at >= now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
