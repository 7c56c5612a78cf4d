// SPDX-License-Identifier: MIT
mod materializer;
mod resolver;

pub use materializer::{
    build_filename, fetch_candidate_bytes, infer_extension, materialize_one, sanitize_filename,
    sniff_extension, DedupGuard, MaterializeError, MaterializeOptions,
};
pub use resolver::{
    resolve_message_media, resolve_segment, segment_candidates, InboundMediaRef,
    MediaSegmentKind, ResolvedCandidate,
};
