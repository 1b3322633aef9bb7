//! `discord:channel:(\d+)` extraction from the resolved session key, and a
//! flat channel-id → {cwd, extraArgs} override table read once at startup
//! from a JSON file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use kirogate_server::pool::SessionOverride;
use regex::Regex;
use serde::Deserialize;

static DISCORD_CHANNEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"discord:channel:(\d+)")
        .unwrap_or_else(|error| panic!("static regex failed to compile: {error}"))
});

/// One entry of the routes JSON file: `{"<channelId>": {"cwd": "...",
/// "kiroArgs"?: [...]}}`.
#[derive(Debug, Clone, Deserialize)]
struct RouteEntry {
    cwd: PathBuf,
    #[serde(default, rename = "kiroArgs")]
    kiro_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: HashMap<String, RouteEntry>,
}

impl Router {
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| anyhow::anyhow!("failed to read routes file {path:?}: {error}"))?;
        let routes: HashMap<String, RouteEntry> = serde_json::from_str(&raw)
            .map_err(|error| anyhow::anyhow!("failed to parse routes file {path:?}: {error}"))?;
        Ok(Self { routes })
    }

    /// Extract a `discord:channel:<id>` id from an opaque session key.
    pub fn detect_channel_id(session_key: &str) -> Option<&str> {
        DISCORD_CHANNEL_RE
            .captures(session_key)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    /// Resolve the per-session override for a key, if its channel id (if
    /// any) appears in the route table.
    pub fn resolve(&self, session_key: &str) -> SessionOverride {
        let Some(channel_id) = Self::detect_channel_id(session_key) else {
            return SessionOverride::default();
        };
        match self.routes.get(channel_id) {
            Some(entry) => SessionOverride {
                cwd: Some(entry.cwd.clone()),
                extra_args: entry.kiro_args.clone(),
            },
            None => SessionOverride::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_channel_id_extracts_numeric_id() {
        assert_eq!(
            Router::detect_channel_id("discord:channel:12345"),
            Some("12345")
        );
    }

    #[test]
    fn detect_channel_id_returns_none_for_unrelated_keys() {
        assert_eq!(Router::detect_channel_id("telegram:chat:999"), None);
        assert_eq!(Router::detect_channel_id("abc123"), None);
    }

    #[test]
    fn resolve_applies_the_override_when_the_channel_is_routed() {
        let mut routes = HashMap::new();
        routes.insert(
            "12345".to_string(),
            RouteEntry {
                cwd: PathBuf::from("/srv/channel-12345"),
                kiro_args: Some(vec!["--profile".to_string(), "discord".to_string()]),
            },
        );
        let router = Router { routes };
        let resolved = router.resolve("discord:channel:12345");
        assert_eq!(resolved.cwd, Some(PathBuf::from("/srv/channel-12345")));
        assert_eq!(
            resolved.extra_args,
            Some(vec!["--profile".to_string(), "discord".to_string()])
        );
    }

    #[test]
    fn resolve_is_the_default_override_for_an_unrouted_channel() {
        let router = Router::empty();
        let resolved = router.resolve("discord:channel:999");
        assert!(resolved.cwd.is_none());
        assert!(resolved.extra_args.is_none());
    }
}
