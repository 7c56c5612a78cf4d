// SPDX-License-Identifier: MIT
//! Outbound text redaction shared by the diagnostics logger and the
//! outbound normalizer (spec §4.10, §4.14, SPEC_FULL §A.1).

use regex::Regex;
use std::sync::OnceLock;

fn host_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bhost\.docker\.internal\b|\b(?:localhost|127\.0\.0\.1|0\.0\.0\.0|::1)\b")
            .unwrap()
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap())
}

/// Redact internal host markers and bare IPv4 addresses from outbound text
/// (spec §4.10). Idempotent — redacting an already-redacted string is a
/// fixed point.
pub fn redact_text(text: &str) -> String {
    let step1 = host_re().replace_all(text, "[redacted-host]");
    ipv4_re().replace_all(&step1, "[redacted-ip]").into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_docker_internal_host() {
        assert_eq!(redact_text("see host.docker.internal:8080"), "see [redacted-host]:8080");
    }

    #[test]
    fn redacts_loopback() {
        assert_eq!(redact_text("try 127.0.0.1/status"), "try [redacted-ip]/status");
    }

    #[test]
    fn redacts_bare_ipv4() {
        assert_eq!(redact_text("host 10.0.0.5 is up"), "host [redacted-ip] is up");
    }

    #[test]
    fn leaves_unrelated_text_untouched() {
        assert_eq!(redact_text("hello world"), "hello world");
    }

    #[test]
    fn redaction_is_a_fixed_point() {
        let once = redact_text("host.docker.internal and 127.0.0.1");
        let twice = redact_text(&once);
        assert_eq!(once, twice);
    }
}
