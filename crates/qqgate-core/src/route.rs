// SPDX-License-Identifier: MIT
//! Route parsing, normalization, and session-key derivation (spec §3, §4.2).
//!
//! A [`Route`] is the immutable identity key every per-conversation piece of
//! state hangs off: in-flight dispatch, pending-latest, usage counters,
//! on-disk `qq_sessions/<route-dir>/` layout. Nothing downstream is allowed
//! to construct one except through [`Route::parse`] / [`parse_target`].

use std::fmt;

use regex::Regex;
use std::sync::OnceLock;

fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap())
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]{5,12}$").unwrap())
}

/// A canonical conversation identifier: `user:<id>`, `group:<id>`, or
/// `guild:<guild>:<channel>`. See spec §3 "Route".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Route {
    User(String),
    Group(String),
    Guild(String, String),
}

impl Route {
    /// Parse and validate a canonical route string. Rejects anything that
    /// isn't exactly one of the three shapes spec §3 defines.
    pub fn parse(raw: &str) -> Option<Route> {
        let mut parts = raw.splitn(3, ':');
        let kind = parts.next()?;
        match kind {
            "user" => {
                let id = parts.next()?;
                (parts.next().is_none() && digits_re().is_match(id))
                    .then(|| Route::User(id.to_string()))
            }
            "group" => {
                let id = parts.next()?;
                (parts.next().is_none() && digits_re().is_match(id))
                    .then(|| Route::Group(id.to_string()))
            }
            "guild" => {
                let guild = parts.next()?;
                let channel = parts.next()?;
                (id_re().is_match(guild) && id_re().is_match(channel))
                    .then(|| Route::Guild(guild.to_string(), channel.to_string()))
            }
            _ => None,
        }
    }

    /// The sole gate for every route-typed boundary (spec §4.2 `isValidQQRoute`).
    pub fn is_valid(raw: &str) -> bool {
        Route::parse(raw).is_some()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::User(id) => write!(f, "user:{id}"),
            Route::Group(id) => write!(f, "group:{id}"),
            Route::Guild(g, c) => write!(f, "guild:{g}:{c}"),
        }
    }
}

/// Legacy forms accepted by `normalizeTarget` / `parseTarget` (spec §4.2).
///
/// `channel:private:<id>`, `session:qq:user:<id>`, and bare digits
/// (ambiguous → treated as a private user route) all collapse to the
/// canonical form before parsing.
pub fn normalize_target(raw: &str) -> String {
    let raw = raw.trim();

    if digits_re().is_match(raw) {
        return format!("user:{raw}");
    }
    if let Some(id) = raw.strip_prefix("channel:private:") {
        return format!("user:{id}");
    }
    if let Some(id) = raw.strip_prefix("channel:group:") {
        return format!("group:{id}");
    }
    if let Some(id) = raw.strip_prefix("session:qq:user:") {
        return format!("user:{id}");
    }
    if let Some(id) = raw.strip_prefix("session:qq:group:") {
        return format!("group:{id}");
    }
    raw.to_string()
}

/// Normalize then parse. Returns `None` for anything that doesn't collapse
/// to a valid canonical route.
pub fn parse_target(raw: &str) -> Option<Route> {
    Route::parse(&normalize_target(raw))
}

/// The resident agent identity a route is bound to (spec §3 "Session key").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResidentAgentId {
    /// The configured owner's private route — always `main`.
    Main,
    QqUser(String),
    QqGroup(String),
    QqGuild(String, String),
}

impl fmt::Display for ResidentAgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResidentAgentId::Main => write!(f, "main"),
            ResidentAgentId::QqUser(id) => write!(f, "qq-user-{id}"),
            ResidentAgentId::QqGroup(id) => write!(f, "qq-group-{id}"),
            ResidentAgentId::QqGuild(g, c) => write!(f, "qq-guild-{g}-{c}"),
        }
    }
}

/// Derive the resident agent id for a route, given the configured owner's
/// private user id (if any).
pub fn resident_agent_id(route: &Route, owner_user_id: Option<&str>) -> ResidentAgentId {
    match route {
        Route::User(id) if Some(id.as_str()) == owner_user_id => ResidentAgentId::Main,
        Route::User(id) => ResidentAgentId::QqUser(id.clone()),
        Route::Group(id) => ResidentAgentId::QqGroup(id.clone()),
        Route::Guild(g, c) => ResidentAgentId::QqGuild(g.clone(), c.clone()),
    }
}

/// Canonical session key: `agent:<resident-agent-id>:main` (spec §3).
pub type SessionKey = String;

pub fn session_key(route: &Route, owner_user_id: Option<&str>) -> SessionKey {
    format!("agent:{}:main", resident_agent_id(route, owner_user_id))
}

/// `<route-dir>` under `<workspace>/qq_sessions/` — `:` → `__`, everything
/// else outside `[A-Za-z0-9_.-]` → `_` (spec §6 "Persisted layout").
pub fn route_dir_name(route: &Route) -> String {
    route
        .to_string()
        .replace(':', "__")
        .chars()
        .map(|c| if id_re_char(c) { c } else { '_' })
        .collect()
}

fn id_re_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_route() {
        assert_eq!(Route::parse("user:2151539153"), Some(Route::User("2151539153".into())));
    }

    #[test]
    fn parses_group_route() {
        assert_eq!(Route::parse("group:100001"), Some(Route::Group("100001".into())));
    }

    #[test]
    fn parses_guild_route() {
        assert_eq!(
            Route::parse("guild:abc-1.2_3:chan"),
            Some(Route::Guild("abc-1.2_3".into(), "chan".into()))
        );
    }

    #[test]
    fn rejects_short_and_long_digit_ids() {
        assert!(Route::parse("user:123").is_none());
        assert!(Route::parse("user:1234567890123").is_none());
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(Route::parse("channel:100001").is_none());
    }

    #[test]
    fn rejects_guild_missing_channel() {
        assert!(Route::parse("guild:abc").is_none());
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["user:2151539153", "channel:private:2151539153", "2151539153"] {
            let once = normalize_target(raw);
            let twice = normalize_target(&once);
            assert_eq!(once, twice, "normalize_target(normalize_target(x)) == normalize_target(x)");
        }
    }

    #[test]
    fn parse_target_round_trips_valid_routes() {
        for r in ["user:2151539153", "group:100001", "guild:g1:c1"] {
            let parsed = parse_target(r).unwrap();
            assert_eq!(parsed.to_string(), r);
        }
    }

    #[test]
    fn legacy_bare_digits_become_user_route() {
        assert_eq!(parse_target("2151539153"), Some(Route::User("2151539153".into())));
    }

    #[test]
    fn legacy_channel_private_form() {
        assert_eq!(
            parse_target("channel:private:2151539153"),
            Some(Route::User("2151539153".into()))
        );
    }

    #[test]
    fn legacy_session_qq_user_form() {
        assert_eq!(
            parse_target("session:qq:user:2151539153"),
            Some(Route::User("2151539153".into()))
        );
    }

    #[test]
    fn owner_private_route_resolves_to_main() {
        let route = Route::User("42".into());
        assert_eq!(resident_agent_id(&route, Some("42")), ResidentAgentId::Main);
        assert_eq!(session_key(&route, Some("42")), "agent:main:main");
    }

    #[test]
    fn non_owner_user_route_resolves_to_qq_user() {
        let route = Route::User("99".into());
        assert_eq!(resident_agent_id(&route, Some("42")), ResidentAgentId::QqUser("99".into()));
        assert_eq!(session_key(&route, Some("42")), "agent:qq-user-99:main");
    }

    #[test]
    fn group_and_guild_session_keys() {
        assert_eq!(session_key(&Route::Group("100001".into()), None), "agent:qq-group-100001:main");
        assert_eq!(
            session_key(&Route::Guild("g".into(), "c".into()), None),
            "agent:qq-guild-g-c:main"
        );
    }

    #[test]
    fn route_dir_name_replaces_colon_and_odd_chars() {
        assert_eq!(route_dir_name(&Route::User("42".into())), "user__42");
        assert_eq!(
            route_dir_name(&Route::Guild("g 1".into(), "c#2".into())),
            "guild__g_1__c_2"
        );
    }
}
