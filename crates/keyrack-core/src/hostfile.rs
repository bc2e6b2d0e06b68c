//! Host manifest - how this machine satisfies credential requirements
//!
//! The repo manifest says WHAT an environment needs; the host manifest says
//! HOW this particular host provides it: which vault holds each slug, via
//! which mechanism, under what duration cap. It has its own lifecycle
//! (`set` / `del` from the CLI) and is persisted outside the core.

use crate::duration::{format_duration, parse_duration};
use crate::slug::split_slug;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One host-level vault assignment for a slug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKey {
    /// Vault backend name
    pub vault: String,
    /// Acquisition mechanism
    pub mech: String,
    /// Deployment tier
    pub env: String,
    /// Owning organization
    pub org: String,
    /// External id passed through to the vault adapter (e.g. an account
    /// within a shared backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exid: Option<String>,
    /// Longest TTL this host permits for the slug, as a duration string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
}

impl HostKey {
    /// Parsed duration cap, if one is set and well-formed.
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
    }

    pub fn set_max_duration(&mut self, d: Option<Duration>) {
        self.max_duration = d.map(format_duration);
    }
}

/// Per-machine record mapping slug -> vault assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostManifest {
    #[serde(default)]
    pub keys: BTreeMap<String, HostKey>,
}

impl HostManifest {
    pub fn get(&self, slug: &str) -> Option<&HostKey> {
        self.keys.get(slug)
    }

    pub fn set(&mut self, slug: impl Into<String>, key: HostKey) {
        self.keys.insert(slug.into(), key);
    }

    pub fn del(&mut self, slug: &str) -> bool {
        self.keys.remove(slug).is_some()
    }

    /// Slugs assigned under an env on this host.
    pub fn slugs_for_env(&self, env: &str) -> Vec<&str> {
        self.keys
            .iter()
            .filter(|(_, k)| k.env == env)
            .map(|(slug, _)| slug.as_str())
            .collect()
    }

    /// Sudo-tier candidates matching a selector: either the full slug or
    /// the bare key-name suffix. Sudo keys live only in the host manifest,
    /// never in the shareable repo manifest.
    pub fn sudo_candidates(&self, selector: &str) -> Vec<&str> {
        self.keys
            .iter()
            .filter(|(slug, k)| {
                k.env == "sudo"
                    && (slug.as_str() == selector
                        || split_slug(slug).map_or(false, |(_, _, name)| name == selector))
            })
            .map(|(slug, _)| slug.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_key(env: &str) -> HostKey {
        HostKey {
            vault: "age".to_string(),
            mech: "static".to_string(),
            env: env.to_string(),
            org: "acme".to_string(),
            exid: None,
            max_duration: None,
        }
    }

    #[test]
    fn test_set_get_del() {
        let mut h = HostManifest::default();
        h.set("acme.prod.DB_URL", host_key("prod"));
        assert!(h.get("acme.prod.DB_URL").is_some());
        assert!(h.del("acme.prod.DB_URL"));
        assert!(!h.del("acme.prod.DB_URL"));
    }

    #[test]
    fn test_slugs_for_env() {
        let mut h = HostManifest::default();
        h.set("acme.prod.A", host_key("prod"));
        h.set("acme.test.B", host_key("test"));
        assert_eq!(h.slugs_for_env("prod"), vec!["acme.prod.A"]);
    }

    #[test]
    fn test_sudo_candidates_by_suffix_and_slug() {
        let mut h = HostManifest::default();
        h.set("acme.sudo.ROOT_TOKEN", host_key("sudo"));
        h.set("acme.prod.ROOT_TOKEN", host_key("prod"));
        h.set("acme.sudo.OTHER", host_key("sudo"));

        // Bare name matches only the sudo-tier entry
        assert_eq!(h.sudo_candidates("ROOT_TOKEN"), vec!["acme.sudo.ROOT_TOKEN"]);
        // Full slug matches too
        assert_eq!(h.sudo_candidates("acme.sudo.OTHER"), vec!["acme.sudo.OTHER"]);
        // Non-sudo entries never match
        assert!(h.sudo_candidates("acme.prod.ROOT_TOKEN").is_empty());
    }

    #[test]
    fn test_max_duration_round_trip() {
        let mut k = host_key("prod");
        assert!(k.max_duration().is_none());
        k.set_max_duration(Some(Duration::minutes(30)));
        assert_eq!(k.max_duration, Some("30m".to_string()));
        assert_eq!(k.max_duration(), Some(Duration::minutes(30)));
    }
}
