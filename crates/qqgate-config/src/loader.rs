// SPDX-License-Identifier: MIT
//! Layered YAML configuration loader (SPEC_FULL §A.3).
//!
//! Search order, lowest to highest priority (later layers win, deep merge
//! for mappings): system (`/etc/qqgate/config.yaml`), user
//! (`~/.config/qqgate/config.yaml`), workspace-local (`.qqgate/config.yaml`,
//! `qqgate.yaml`), then an explicit `--config` path.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/qqgate/config.yaml"));
    paths.push(PathBuf::from("/etc/qqgate/config.yml"));

    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("qqgate/config.yaml"));
        paths.push(cfg.join("qqgate/config.yml"));
    }

    paths.push(PathBuf::from(".qqgate/config.yaml"));
    paths.push(PathBuf::from(".qqgate/config.yml"));
    paths.push(PathBuf::from("qqgate.yaml"));
    paths.push(PathBuf::from("qqgate.yml"));

    paths
}

/// Load configuration by merging all discovered YAML layers, then an
/// optional explicit path (e.g. `--config`). Validates the merged result
/// (route shapes, cron expressions, `every` lower bound) before returning.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("deserializing merged config")?
    };

    crate::validate::validate(&config).context("validating config")?;

    Ok(config)
}

/// Deep-merge `src` into `dst`; `src` wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("relay:\n  enabled: false\n  port: 1\n");
        let src = val("relay:\n  port: 2\n");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["relay"]["enabled"].as_bool(), Some(false));
        assert_eq!(dst["relay"]["port"].as_i64(), Some(2));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/qqgate_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert!(cfg.accounts.is_empty());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "accounts:\n  - ws_url: ws://localhost:6700\n    access_token: secret\n"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.accounts.len(), 1);
        assert_eq!(cfg.accounts[0].ws_url, "ws://localhost:6700");
    }

    #[test]
    fn load_rejects_invalid_cron_expression() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
accounts:
  - ws_url: ws://x
    access_token: t
automation:
  - id: bad
    route: "user:12345"
    execution_mode: agent-only
    job:
      schedule:
        kind: cron
        expr: "not a cron"
      message: hi
"#
        )
        .unwrap();
        assert!(load(Some(f.path())).is_err());
    }
}
