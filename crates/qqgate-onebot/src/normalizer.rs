// SPDX-License-Identifier: MIT
//! Outbound normalizer (spec §4.10): turns an agent reply segment into the
//! OneBot `send_msg` action params for a route, enforcing the max-chars
//! clamp and splitting long text into multiple sends rather than truncating
//! silently.

use qqgate_core::{AgentReplySegment, MediaSegmentKind as CoreMediaKind, Route};
use serde_json::{json, Value};

use crate::media::MediaSegmentKind;

fn core_to_local_kind(kind: CoreMediaKind) -> MediaSegmentKind {
    match kind {
        CoreMediaKind::Image => MediaSegmentKind::Image,
        CoreMediaKind::Record => MediaSegmentKind::Record,
        CoreMediaKind::Video => MediaSegmentKind::Video,
        CoreMediaKind::File => MediaSegmentKind::File,
    }
}

/// One outbound OneBot `send_msg` call, already split/clamped.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub action: &'static str,
    pub params: Value,
    pub media_kind: Option<MediaSegmentKind>,
}

fn message_type_params(route: &Route) -> (Value, Value) {
    match route {
        Route::User(id) => ("private".into(), json!(id)),
        Route::Group(id) => ("group".into(), json!(id)),
        Route::Guild(guild_id, channel_id) => {
            ("guild".into(), json!({ "guild_id": guild_id, "channel_id": channel_id }))
        }
    }
}

/// Split `text` into chunks of at most `max_chars` UTF-8 scalar values,
/// never splitting inside a multi-byte char (spec §4.10 "never truncate
/// mid-character").
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn media_action(kind: MediaSegmentKind) -> &'static str {
    match kind {
        MediaSegmentKind::Image | MediaSegmentKind::Record | MediaSegmentKind::Video | MediaSegmentKind::File => {
            "send_msg"
        }
    }
}

fn media_segment_type(kind: MediaSegmentKind) -> &'static str {
    match kind {
        MediaSegmentKind::Image => "image",
        MediaSegmentKind::Record => "record",
        MediaSegmentKind::Video => "video",
        MediaSegmentKind::File => "file",
    }
}

/// Normalize one agent reply segment into zero or more outbound calls.
/// Text segments longer than `max_chars` become multiple `send_msg` calls;
/// media segments become one call carrying an array-format message segment
/// referencing the already-resolved URL (materialization/relay happens
/// upstream in the media sender).
pub fn normalize_segment(route: &Route, segment: &AgentReplySegment, max_chars: usize) -> Vec<OutboundCall> {
    let (message_type, target) = message_type_params(route);
    match segment {
        AgentReplySegment::Text(text) => split_text(text, max_chars)
            .into_iter()
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| OutboundCall {
                action: "send_msg",
                params: json!({
                    "message_type": message_type,
                    "target": target,
                    "message": [{ "type": "text", "data": { "text": chunk } }],
                }),
                media_kind: None,
            })
            .collect(),
        AgentReplySegment::Media { url, kind } => {
            let local_kind = core_to_local_kind(*kind);
            vec![OutboundCall {
                action: media_action(local_kind),
                params: json!({
                    "message_type": message_type,
                    "target": target,
                    "message": [{ "type": media_segment_type(local_kind), "data": { "file": url } }],
                }),
                media_kind: Some(local_kind),
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_not_split() {
        assert_eq!(split_text("hello", 800), vec!["hello".to_string()]);
    }

    #[test]
    fn long_text_splits_on_char_boundary() {
        let text = "a".repeat(10);
        let chunks = split_text(&text, 3);
        assert_eq!(chunks, vec!["aaa", "aaa", "aaa", "a"]);
    }

    #[test]
    fn zero_max_chars_disables_splitting() {
        let chunks = split_text("hello world", 0);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn unicode_text_counts_scalar_values_not_bytes() {
        let text = "你好世界";
        let chunks = split_text(text, 2);
        assert_eq!(chunks, vec!["你好", "世界"]);
    }

    #[test]
    fn normalize_text_segment_for_group_route() {
        let route = Route::Group("100001".into());
        let calls = normalize_segment(&route, &AgentReplySegment::Text("hi".into()), 800);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params["message_type"], "group");
    }

    #[test]
    fn empty_chunks_are_filtered_out() {
        let route = Route::User("2151539153".into());
        let calls = normalize_segment(&route, &AgentReplySegment::Text(String::new()), 800);
        assert!(calls.is_empty());
    }

    #[test]
    fn media_segment_carries_url_and_kind() {
        let route = Route::User("2151539153".into());
        let segment = AgentReplySegment::Media { url: "https://x/a.jpg".into(), kind: qqgate_core::MediaSegmentKind::Image };
        let calls = normalize_segment(&route, &segment, 800);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].media_kind, Some(MediaSegmentKind::Image));
    }
}
