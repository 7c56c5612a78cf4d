// SPDX-License-Identifier: MIT
//! Inbound media resolver (spec §4.3).
//!
//! For each media-bearing segment, builds an [`InboundMediaRef`] and
//! resolves it through an ordered sequence of protocol actions keyed by
//! kind, unioned with the segment's own duck-typed fields. Falls back to a
//! full `get_msg` reload when a segment's candidate set is empty or
//! entirely `file://` (likely unreadable from this process).

use qqgate_config::InboundMediaResolvePrefer;
use serde_json::{json, Value};
use tracing::debug;

use crate::protocol::{actions, ActionClient, InboundEvent, MediaSegmentData, Segment};

/// Duck-typed candidate source, tagged by kind rather than probed ad hoc
/// at every call site (SPEC_FULL "Duck-typed action results → tagged
/// candidate records").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCandidate {
    Http(String),
    File(String),
    Base64(String),
    Data(String),
    /// `stream://` — a streaming download action result (spec §4.3).
    Stream(String),
    Unknown(String),
}

impl ResolvedCandidate {
    pub fn is_file_like(&self) -> bool {
        matches!(self, ResolvedCandidate::File(_))
    }

    pub fn value(&self) -> &str {
        match self {
            ResolvedCandidate::Http(v)
            | ResolvedCandidate::File(v)
            | ResolvedCandidate::Base64(v)
            | ResolvedCandidate::Data(v)
            | ResolvedCandidate::Stream(v)
            | ResolvedCandidate::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSegmentKind {
    Image,
    Record,
    Video,
    File,
}

impl MediaSegmentKind {
    fn get_action(self) -> &'static str {
        match self {
            MediaSegmentKind::Image => actions::GET_IMAGE,
            MediaSegmentKind::Record => actions::GET_RECORD,
            MediaSegmentKind::Video => actions::GET_FILE,
            MediaSegmentKind::File => actions::GET_FILE,
        }
    }
}

/// One resolved inbound media reference, ready for materialization.
#[derive(Debug, Clone)]
pub struct InboundMediaRef {
    pub kind: MediaSegmentKind,
    /// Position of the originating segment within the message, used to
    /// re-match against reloaded segments during the `get_msg` fallback.
    pub position: usize,
    pub name_hint: Option<String>,
    pub candidates: Vec<ResolvedCandidate>,
}

impl InboundMediaRef {
    pub fn is_unreadable(&self) -> bool {
        self.candidates.is_empty() || self.candidates.iter().all(|c| c.is_file_like())
    }
}

/// Normalize a segment's own fields into candidates, without consulting any
/// protocol action (spec §4.3 "segment fields").
pub fn segment_candidates(data: &MediaSegmentData) -> Vec<ResolvedCandidate> {
    let mut out = Vec::new();

    if let Some(b64) = &data.base64 {
        out.push(ResolvedCandidate::Base64(b64.clone()));
    }
    for field in [&data.url, &data.src, &data.download_url] {
        if let Some(v) = field {
            out.push(classify_url_like(v));
        }
    }
    for field in [&data.file, &data.path, &data.file_path, &data.local_path, &data.temp_file] {
        if let Some(v) = field {
            out.push(classify_url_like(v));
        }
    }

    out
}

fn classify_url_like(v: &str) -> ResolvedCandidate {
    if let Some(rest) = v.strip_prefix("base64://") {
        ResolvedCandidate::Base64(rest.to_string())
    } else if v.starts_with("data:") {
        ResolvedCandidate::Data(v.to_string())
    } else if let Some(rest) = v.strip_prefix("stream://") {
        ResolvedCandidate::Stream(rest.to_string())
    } else if v.starts_with("http://") || v.starts_with("https://") {
        ResolvedCandidate::Http(v.to_string())
    } else if let Some(rest) = v.strip_prefix("file://") {
        ResolvedCandidate::File(rest.to_string())
    } else {
        // Bare filesystem paths / opaque file ids are treated as file://.
        ResolvedCandidate::File(v.to_string())
    }
}

/// Probe the protocol action for this segment kind. Missing support for the
/// action is recovered locally (spec §7): the resolver just returns no
/// candidate and falls through to segment fields.
async fn action_candidates(
    client: &dyn ActionClient,
    kind: MediaSegmentKind,
    file_hint: &str,
) -> Vec<ResolvedCandidate> {
    let resp = match client.send_action(kind.get_action(), json!({ "file": file_hint })).await {
        Ok(r) if r.is_ok() => r,
        _ => return Vec::new(),
    };
    let Some(data) = resp.data else { return Vec::new() };
    extract_action_candidate(&data).into_iter().collect()
}

fn extract_action_candidate(data: &Value) -> Option<ResolvedCandidate> {
    if let Some(url) = data.get("url").and_then(Value::as_str) {
        return Some(classify_url_like(url));
    }
    if let Some(file) = data.get("file").and_then(Value::as_str) {
        return Some(classify_url_like(file));
    }
    if let Some(b64) = data.get("base64").and_then(Value::as_str) {
        return Some(ResolvedCandidate::Base64(b64.to_string()));
    }
    None
}

/// Resolve one segment into an [`InboundMediaRef`], combining action probes
/// and segment fields in the configured preference order (spec §4.3).
pub async fn resolve_segment(
    client: &dyn ActionClient,
    kind: MediaSegmentKind,
    position: usize,
    data: &MediaSegmentData,
    prefer: InboundMediaResolvePrefer,
) -> InboundMediaRef {
    let seg_candidates = segment_candidates(data);
    let file_hint = data
        .file
        .clone()
        .or_else(|| data.path.clone())
        .or_else(|| data.file_path.clone())
        .unwrap_or_default();

    let action_first = matches!(prefer, InboundMediaResolvePrefer::NapcatFirst);
    let action_cands = if file_hint.is_empty() {
        Vec::new()
    } else {
        action_candidates(client, kind, &file_hint).await
    };

    let mut candidates = if action_first {
        let mut v = action_cands;
        v.extend(seg_candidates);
        v
    } else {
        let mut v = seg_candidates;
        v.extend(action_cands);
        v
    };
    dedup_candidates(&mut candidates);

    InboundMediaRef {
        kind,
        position,
        name_hint: data.name.clone().or_else(|| data.file.clone()),
        candidates,
    }
}

fn dedup_candidates(candidates: &mut Vec<ResolvedCandidate>) {
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| seen.insert(c.clone()));
}

fn segment_kind_and_data(seg: &Segment) -> Option<(MediaSegmentKind, &MediaSegmentData)> {
    match seg {
        Segment::Image(d) => Some((MediaSegmentKind::Image, d)),
        Segment::Record(d) => Some((MediaSegmentKind::Record, d)),
        Segment::Video(d) => Some((MediaSegmentKind::Video, d)),
        Segment::File(d) => Some((MediaSegmentKind::File, d)),
        _ => None,
    }
}

/// Collect and resolve every media-bearing segment of a message, applying
/// the `get_msg` fallback for segments that resolved to nothing usable, and
/// capping the result at `max_per_message` (spec §4.3).
pub async fn resolve_message_media(
    client: &dyn ActionClient,
    segments: &[Segment],
    message_id: Option<&str>,
    prefer: InboundMediaResolvePrefer,
    fallback_get_msg_enabled: bool,
    max_per_message: usize,
) -> Vec<InboundMediaRef> {
    let mut refs = Vec::new();

    for (position, seg) in segments.iter().enumerate() {
        if refs.len() >= max_per_message {
            break;
        }
        let Some((kind, data)) = segment_kind_and_data(seg) else { continue };
        refs.push(resolve_segment(client, kind, position, data, prefer).await);
    }

    if fallback_get_msg_enabled && message_id.is_some() && refs.iter().any(|r| r.is_unreadable()) {
        if let Some(reloaded) = reload_message(client, message_id.unwrap()).await {
            for r in refs.iter_mut() {
                if !r.is_unreadable() {
                    continue;
                }
                if let Some(Some((_, data))) =
                    reloaded.get(r.position).map(segment_kind_and_data)
                {
                    let reloaded_candidates = segment_candidates(data);
                    if !reloaded_candidates.is_empty() {
                        r.candidates = reloaded_candidates;
                        debug!(position = r.position, "resolved via get_msg fallback");
                    }
                }
            }
        }
    }

    refs
}

async fn reload_message(client: &dyn ActionClient, message_id: &str) -> Option<Vec<Segment>> {
    let resp = client
        .send_action(actions::GET_MSG, json!({ "message_id": message_id }))
        .await
        .ok()?;
    if !resp.is_ok() {
        return None;
    }
    let data = resp.data?;
    let message = data.get("message")?;
    serde_json::from_value(message.clone()).ok()
}
