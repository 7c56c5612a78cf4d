// SPDX-License-Identifier: MIT
//! Media sender (spec §4.11): turns a materialized local file into the
//! value a OneBot implementation will accept in a `send_msg` media
//! segment, trying candidates in preference order: stream handle (if the
//! implementation already has one), HTTP URL (via the local relay), base64
//! inline, then a bare local path as a last resort.

use std::path::{Path, PathBuf};

use qqgate_config::StreamTransportPrefer;
use qqgate_core::DropReason;

/// Only files under one of these roots may be offered to a OneBot
/// implementation, whether directly or via the relay (spec §4.11 "path
/// policy allowlist").
#[derive(Debug, Clone)]
pub struct PathPolicy {
    pub allowed_roots: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn new(allowed_roots: Vec<PathBuf>) -> Self {
        Self { allowed_roots }
    }

    pub fn is_allowed(&self, path: &Path) -> bool {
        let Ok(canonical) = path.canonicalize() else { return false };
        self.allowed_roots.iter().any(|root| {
            root.canonicalize().map(|r| canonical.starts_with(&r)).unwrap_or(false)
        })
    }
}

/// A signed, TTL'd relay URL issuer — implemented by `qqgate-relay`'s HMAC
/// token scheme (spec §4.11). Kept as a trait here so the sender can be
/// tested without a live relay server.
pub trait RelayUrlIssuer: Send + Sync {
    fn issue_url(&self, local_path: &Path, ttl_secs: u64) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCandidateKind {
    Stream,
    Http,
    Base64,
    Local,
}

#[derive(Debug, Clone)]
pub struct SendCandidate {
    pub kind: SendCandidateKind,
    pub value: String,
}

/// Builds the ordered candidate list for one materialized file (spec §4.11
/// "candidate ordering: stream → http → base64 → local"). `stream_handle`
/// is `Some` only when the original inbound segment already carried one
/// the implementation is known to accept back verbatim.
pub fn build_candidates(
    local_path: &Path,
    stream_handle: Option<&str>,
    relay: Option<&dyn RelayUrlIssuer>,
    relay_ttl_secs: u64,
    path_policy: &PathPolicy,
    prefer: StreamTransportPrefer,
) -> Result<Vec<SendCandidate>, DropReason> {
    if !path_policy.is_allowed(local_path) {
        return Err(DropReason::PathOutsideAllowlist);
    }

    let mut candidates = Vec::new();

    let push_stream = |candidates: &mut Vec<SendCandidate>| {
        if let Some(handle) = stream_handle {
            candidates.push(SendCandidate { kind: SendCandidateKind::Stream, value: handle.to_string() });
        }
    };
    let push_http = |candidates: &mut Vec<SendCandidate>| {
        if let Some(issuer) = relay {
            if let Some(url) = issuer.issue_url(local_path, relay_ttl_secs) {
                candidates.push(SendCandidate { kind: SendCandidateKind::Http, value: url });
            }
        }
    };

    match prefer {
        StreamTransportPrefer::StreamFirst => {
            push_stream(&mut candidates);
            push_http(&mut candidates);
        }
        StreamTransportPrefer::HttpFirst => {
            push_http(&mut candidates);
            push_stream(&mut candidates);
        }
    }

    if let Ok(bytes) = std::fs::read(local_path) {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        candidates.push(SendCandidate { kind: SendCandidateKind::Base64, value: format!("base64://{encoded}") });
    }

    candidates.push(SendCandidate {
        kind: SendCandidateKind::Local,
        value: local_path.to_string_lossy().to_string(),
    });

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    struct FakeRelay;
    impl RelayUrlIssuer for FakeRelay {
        fn issue_url(&self, local_path: &Path, _ttl_secs: u64) -> Option<String> {
            Some(format!("https://relay.local/{}", local_path.file_name()?.to_string_lossy()))
        }
    }

    #[test]
    fn path_outside_allowlist_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"x").unwrap();
        let other = tempdir().unwrap();
        let policy = PathPolicy::new(vec![other.path().to_path_buf()]);
        let err = build_candidates(&file, None, None, 60, &policy, StreamTransportPrefer::HttpFirst).unwrap_err();
        assert_eq!(err, DropReason::PathOutsideAllowlist);
    }

    #[test]
    fn candidate_order_http_first_then_base64_then_local() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        let mut f = std::fs::File::create(&file).unwrap();
        f.write_all(b"hello").unwrap();
        let policy = PathPolicy::new(vec![dir.path().to_path_buf()]);
        let relay = FakeRelay;
        let candidates =
            build_candidates(&file, None, Some(&relay), 60, &policy, StreamTransportPrefer::HttpFirst).unwrap();
        let kinds: Vec<_> = candidates.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![SendCandidateKind::Http, SendCandidateKind::Base64, SendCandidateKind::Local]);
    }

    #[test]
    fn stream_first_preference_orders_stream_before_http() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"hello").unwrap();
        let policy = PathPolicy::new(vec![dir.path().to_path_buf()]);
        let relay = FakeRelay;
        let candidates = build_candidates(
            &file,
            Some("stream-handle-1"),
            Some(&relay),
            60,
            &policy,
            StreamTransportPrefer::StreamFirst,
        )
        .unwrap();
        assert_eq!(candidates[0].kind, SendCandidateKind::Stream);
        assert_eq!(candidates[1].kind, SendCandidateKind::Http);
    }

    #[test]
    fn no_relay_skips_http_candidate() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"hello").unwrap();
        let policy = PathPolicy::new(vec![dir.path().to_path_buf()]);
        let candidates = build_candidates(&file, None, None, 60, &policy, StreamTransportPrefer::HttpFirst).unwrap();
        assert!(!candidates.iter().any(|c| c.kind == SendCandidateKind::Http));
    }
}
