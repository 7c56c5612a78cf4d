// SPDX-License-Identifier: MIT
//! Materializer (spec §4.4): fetch candidate bytes, content-hash dedup,
//! sniff MIME/extension, sanitize and persist with a deterministic name.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use qqgate_core::{ExtSource, MaterializeResult, NameSource};
use sha1::{Digest, Sha1};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use super::resolver::ResolvedCandidate;

#[derive(Debug, Clone)]
pub struct MaterializeOptions {
    pub http_timeout: Duration,
    pub http_retries: u32,
    pub out_dir: PathBuf,
}

/// Dedup set shared across one resolve batch — content hashes already
/// written this batch are skipped with `duplicate_payload` (spec §4.4).
#[derive(Default)]
pub struct DedupGuard {
    seen: HashSet<[u8; 20]>,
}

impl DedupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_and_insert(&mut self, bytes: &[u8]) -> bool {
        let hash = Sha1::digest(bytes);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&hash);
        self.seen.insert(arr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("file_not_found")]
    FileNotFound,
    #[error("container_local_unreadable")]
    LocalUnreadable,
    #[error("materialize_empty_payload")]
    EmptyPayload,
    #[error("materialize_http_failed")]
    HttpFailed,
    #[error("unsupported_source")]
    UnsupportedSource,
    #[error("duplicate_payload")]
    DuplicatePayload,
}

/// Fetch the bytes behind one candidate, honoring the HTTP retry policy
/// (spec §4.4 `150ms × attempt` linear backoff).
pub async fn fetch_candidate_bytes(
    candidate: &ResolvedCandidate,
    opts: &MaterializeOptions,
) -> Result<Vec<u8>, (MaterializeError, Option<u16>, u32)> {
    match candidate {
        ResolvedCandidate::File(path) => read_local_file(path),
        ResolvedCandidate::Base64(b64) => decode_base64(b64),
        ResolvedCandidate::Data(data_url) => decode_data_url(data_url),
        ResolvedCandidate::Stream(path) => read_local_file(path),
        ResolvedCandidate::Http(url) => fetch_http(url, opts).await,
        ResolvedCandidate::Unknown(_) => Err((MaterializeError::UnsupportedSource, None, 0)),
    }
}

fn read_local_file(path: &str) -> Result<Vec<u8>, (MaterializeError, Option<u16>, u32)> {
    let p = Path::new(path);
    match std::fs::read(p) {
        Ok(bytes) if bytes.is_empty() => Err((MaterializeError::EmptyPayload, None, 0)),
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            use std::io::ErrorKind::*;
            let err = match e.kind() {
                NotFound => MaterializeError::FileNotFound,
                PermissionDenied => MaterializeError::LocalUnreadable,
                _ if p.is_absolute() => MaterializeError::LocalUnreadable,
                _ => MaterializeError::FileNotFound,
            };
            Err((err, None, 0))
        }
    }
}

fn decode_base64(b64: &str) -> Result<Vec<u8>, (MaterializeError, Option<u16>, u32)> {
    use base64::Engine;
    let cleaned = b64.split(',').next_back().unwrap_or(b64);
    base64::engine::general_purpose::STANDARD
        .decode(cleaned.trim())
        .map_err(|_| (MaterializeError::UnsupportedSource, None, 0))
        .and_then(|bytes| {
            if bytes.is_empty() {
                Err((MaterializeError::EmptyPayload, None, 0))
            } else {
                Ok(bytes)
            }
        })
}

fn decode_data_url(data_url: &str) -> Result<Vec<u8>, (MaterializeError, Option<u16>, u32)> {
    let after = data_url.strip_prefix("data:").unwrap_or(data_url);
    let payload = after.split(',').nth(1).unwrap_or("");
    decode_base64(payload)
}

async fn fetch_http(
    url: &str,
    opts: &MaterializeOptions,
) -> Result<Vec<u8>, (MaterializeError, Option<u16>, u32)> {
    let client = reqwest::Client::builder()
        .timeout(opts.http_timeout)
        .build()
        .map_err(|_| (MaterializeError::HttpFailed, None, 0))?;

    let mut last_status = None;
    for attempt in 0..=opts.http_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(150 * attempt as u64)).await;
        }
        match client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                last_status = Some(status.as_u16());
                if !status.is_success() {
                    continue;
                }
                match resp.bytes().await {
                    Ok(bytes) if bytes.is_empty() => {
                        return Err((MaterializeError::EmptyPayload, last_status, attempt));
                    }
                    Ok(bytes) => return Ok(bytes.to_vec()),
                    Err(_) => continue,
                }
            }
            Err(_) => continue,
        }
    }
    Err((MaterializeError::HttpFailed, last_status, opts.http_retries))
}

// ── Extension inference (spec §4.4) ────────────────────────────────────────

const MAGIC_SNIFFERS: &[(&[u8], &str)] = &[
    (b"\xFF\xD8\xFF", "jpg"),
    (b"\x89PNG\r\n\x1a\n", "png"),
    (b"GIF87a", "gif"),
    (b"GIF89a", "gif"),
    (b"RIFF", "wav"), // refined below (WAV vs other RIFF containers)
    (b"#!AMR", "amr"),
    (b"OggS", "ogg"),
    (b"ID3", "mp3"),
];

/// Sniff a buffer's magic bytes, then fall back to printable-text shape
/// hints (JSON/YAML/Markdown/CSV/XML) over the first 2KB, per spec §4.4.
pub fn sniff_extension(buf: &[u8]) -> Option<&'static str> {
    for (magic, ext) in MAGIC_SNIFFERS {
        if buf.starts_with(magic) {
            if *ext == "wav" && !(buf.len() > 12 && &buf[8..12] == b"WAVE") {
                continue;
            }
            return Some(ext);
        }
    }
    if buf.len() > 4 && &buf[4..8] == b"ftyp" {
        return Some("mp4");
    }
    sniff_text_shape(buf)
}

fn sniff_text_shape(buf: &[u8]) -> Option<&'static str> {
    let head = &buf[..buf.len().min(2048)];
    let text = std::str::from_utf8(head).ok()?;
    if !text.chars().all(|c| !c.is_control() || c.is_whitespace()) {
        return None;
    }
    let trimmed = text.trim_start();
    if trimmed.starts_with("<?xml") || (trimmed.starts_with('<') && trimmed.contains('>')) {
        return Some("xml");
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some("json");
    }
    if trimmed.starts_with("---") {
        return Some("yaml");
    }
    if trimmed.starts_with('#') || trimmed.contains("```") {
        return Some("md");
    }
    let first_line = trimmed.lines().next().unwrap_or("");
    if first_line.matches(',').count() >= 1 && first_line.matches(',').count() == text
        .lines()
        .nth(1)
        .map(|l| l.matches(',').count())
        .unwrap_or(usize::MAX)
    {
        return Some("csv");
    }
    if first_line.matches('\t').count() >= 1 {
        return Some("tsv");
    }
    Some("txt")
}

/// Infer the extension for a materialized payload in priority order:
/// explicit original-name extension, URL-inferred extension, buffer magic
/// sniffing, fallback `.bin` (spec §4.4).
pub fn infer_extension(
    original_name: Option<&str>,
    url: Option<&str>,
    buf: &[u8],
) -> (&'static str, ExtSource) {
    if let Some(ext) = original_name.and_then(ext_of) {
        return (ext, ExtSource::Original);
    }
    if let Some(ext) = url.and_then(ext_of) {
        return (ext, ExtSource::Url);
    }
    if let Some(ext) = sniff_extension(buf) {
        return (ext, ExtSource::Buffer);
    }
    ("bin", ExtSource::Fallback)
}

fn ext_of(name: &str) -> Option<&'static str> {
    let name = name.split(['?', '#']).next().unwrap_or(name);
    let ext = Path::new(name).extension()?.to_str()?.to_lowercase();
    // Leak a 'static copy from a small known set; anything else passes
    // through unchanged via a owned-to-static trick is unnecessary here —
    // we only need to recognize common ones for the priority chain, the
    // actual string used for the filename comes from the raw name anyway.
    match ext.as_str() {
        "jpg" | "jpeg" => Some("jpg"),
        "png" => Some("png"),
        "gif" => Some("gif"),
        "wav" => Some("wav"),
        "amr" => Some("amr"),
        "ogg" => Some("ogg"),
        "mp3" => Some("mp3"),
        "mp4" => Some("mp4"),
        "txt" => Some("txt"),
        "json" => Some("json"),
        "yaml" | "yml" => Some("yaml"),
        "md" => Some("md"),
        "csv" => Some("csv"),
        "xml" => Some("xml"),
        "bin" => Some("bin"),
        _ => None,
    }
}

/// Sanitize a filename to NFKC, basename only, with control chars and
/// `<>:"/\|?*` replaced with `_` (spec §4.4).
pub fn sanitize_filename(name: &str) -> String {
    let normalized: String = name.nfkc().collect();
    let basename = Path::new(&normalized)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(&normalized);
    basename
        .chars()
        .map(|c| {
            if c.is_control() || "<>:\"/\\|?*".contains(c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Build the deterministic output filename: `<ts>-<index>-<sanitized-name-with-ext>`.
pub fn build_filename(ts_ms: i64, index: usize, sanitized: &str, ext: &str) -> String {
    let stem = Path::new(sanitized)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(sanitized);
    format!("{ts_ms}-{index}-{stem}.{ext}")
}

/// Materialize one candidate: fetch, dedup, sniff, persist. Does not itself
/// choose between multiple candidates for a ref — the caller iterates its
/// ordered candidate list and stops at the first success.
pub async fn materialize_one(
    candidate: &ResolvedCandidate,
    name_hint: Option<&str>,
    index: usize,
    ts_ms: i64,
    opts: &MaterializeOptions,
    dedup: &mut DedupGuard,
) -> MaterializeResult {
    let url = candidate.value().to_string();

    let fetch_result = fetch_candidate_bytes(candidate, opts).await;
    let (bytes, http_status, retry_count) = match fetch_result {
        Ok(b) => (b, None, None),
        Err((err, status, retries)) => {
            return MaterializeResult {
                url,
                output_url: None,
                materialized: false,
                error_code: Some(error_code(&err)),
                http_status: status,
                retry_count: Some(retries),
                original_filename: name_hint.map(str::to_string),
                final_filename: None,
                name_source: None,
                ext_source: None,
            };
        }
    };

    if !dedup.check_and_insert(&bytes) {
        return MaterializeResult {
            url,
            output_url: None,
            materialized: false,
            error_code: Some(error_code(&MaterializeError::DuplicatePayload)),
            http_status,
            retry_count,
            original_filename: name_hint.map(str::to_string),
            final_filename: None,
            name_source: None,
            ext_source: None,
        };
    }

    let (ext, ext_source) = infer_extension(name_hint, Some(&url), &bytes);
    let (sanitized, name_source) = match name_hint {
        Some(n) if !n.trim().is_empty() => (sanitize_filename(n), NameSource::Hint),
        None => {
            let from_url = url.rsplit('/').next().unwrap_or("download");
            (sanitize_filename(from_url), NameSource::Url)
        }
        _ => ("download".to_string(), NameSource::Fallback),
    };
    let final_name = build_filename(ts_ms, index, &sanitized, ext);

    if let Err(e) = std::fs::create_dir_all(&opts.out_dir) {
        debug!(error = %e, "failed creating materialize out_dir");
    }
    let out_path = opts.out_dir.join(&final_name);
    if let Err(e) = std::fs::write(&out_path, &bytes) {
        debug!(error = %e, path = %out_path.display(), "failed writing materialized file");
        return MaterializeResult {
            url,
            output_url: None,
            materialized: false,
            error_code: Some("container_local_unreadable".into()),
            http_status,
            retry_count,
            original_filename: name_hint.map(str::to_string),
            final_filename: None,
            name_source: Some(name_source),
            ext_source: Some(ext_source),
        };
    }

    MaterializeResult {
        url,
        output_url: Some(out_path.to_string_lossy().into_owned()),
        materialized: true,
        error_code: None,
        http_status,
        retry_count,
        original_filename: name_hint.map(str::to_string),
        final_filename: Some(final_name),
        name_source: Some(name_source),
        ext_source: Some(ext_source),
    }
}

fn error_code(e: &MaterializeError) -> String {
    match e {
        MaterializeError::FileNotFound => "file_not_found",
        MaterializeError::LocalUnreadable => "container_local_unreadable",
        MaterializeError::EmptyPayload => "materialize_empty_payload",
        MaterializeError::HttpFailed => "materialize_http_failed",
        MaterializeError::UnsupportedSource => "unsupported_source",
        MaterializeError::DuplicatePayload => "duplicate_payload",
    }
    .to_string()
}
