// SPDX-License-Identifier: MIT
//! Inbound aggregator (spec §4.5): short time-window coalescing of
//! same-route inbound fragments into a single logical message.
//!
//! `push` records a fragment and returns a generation token. The caller
//! sleeps the window, then calls `finalize` with that token — it only
//! produces a result if no newer fragment arrived for the route in the
//! meantime (seq match); otherwise this invocation is a superseded
//! duplicate and the newer caller will finalize instead.

use std::collections::HashMap;
use std::sync::Mutex;

use qqgate_core::Route;

#[derive(Debug, Clone, Default)]
struct AggregationState {
    seq: u64,
    texts: Vec<String>,
    media_urls: Vec<String>,
    media_items_total: usize,
    has_inbound_media_like: bool,
}

#[derive(Debug, Clone)]
pub struct FinalizedAggregate {
    pub seq: u64,
    pub text: String,
    pub media_urls: Vec<String>,
    pub media_items_total: usize,
    pub has_inbound_media_like: bool,
}

#[derive(Default)]
pub struct Aggregator {
    states: Mutex<HashMap<Route, AggregationState>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one inbound fragment onto the route's aggregation state and
    /// return the generation token (current seq) to finalize against.
    pub fn push(
        &self,
        route: &Route,
        text: &str,
        media_urls: &[String],
        media_items_total: usize,
        has_inbound_media_like: bool,
    ) -> u64 {
        let mut guard = self.states.lock().expect("aggregator mutex poisoned");
        let state = guard.entry(route.clone()).or_default();
        state.seq += 1;
        if !text.is_empty() {
            state.texts.push(text.to_string());
        }
        for url in media_urls {
            if !state.media_urls.contains(url) {
                state.media_urls.push(url.clone());
            }
        }
        state.media_items_total += media_items_total;
        state.has_inbound_media_like |= has_inbound_media_like;
        state.seq
    }

    /// Finalize the route's aggregation iff `seq` is still the latest
    /// generation (spec §4.5 "route-generation guards"). Older generations
    /// no-op with `None`.
    pub fn finalize(&self, route: &Route, seq: u64) -> Option<FinalizedAggregate> {
        let mut guard = self.states.lock().expect("aggregator mutex poisoned");
        let is_current = matches!(guard.get(route), Some(s) if s.seq == seq);
        if !is_current {
            return None;
        }
        let state = guard.remove(route).expect("checked present above");
        Some(FinalizedAggregate {
            seq: state.seq,
            text: state.texts.join("\n").trim().to_string(),
            media_urls: state.media_urls,
            media_items_total: state.media_items_total,
            has_inbound_media_like: state.has_inbound_media_like,
        })
    }
}
