//! Daemon key store - an in-memory, TTL-enforcing map from slug to grant
//!
//! Expiry is enforced lazily on read: there are no background timers, so a
//! caller can never observe a grant whose TTL has elapsed, even under clock
//! or scheduler drift. The daemon wraps one store in a mutex; each command
//! runs against it as an atomic unit.

use crate::grant::KeyGrant;
use chrono::Utc;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct KeyStore {
    grants: HashMap<String, KeyGrant>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a grant. Re-unlocking a slug replaces the prior grant, which
    /// is how a TTL gets refreshed.
    pub fn set(&mut self, grant: KeyGrant) {
        self.grants.insert(grant.slug.clone(), grant);
    }

    /// Fetch a live grant. An expired grant is deleted on the spot and
    /// reported as absent.
    pub fn get(&mut self, slug: &str) -> Option<&KeyGrant> {
        let now = Utc::now();
        if self.grants.get(slug).map_or(false, |g| g.is_expired(now)) {
            self.grants.remove(slug);
        }
        self.grants.get(slug)
    }

    /// All live grants, optionally filtered by env. Purges every expired
    /// grant first so the listing is read-time consistent.
    pub fn entries(&mut self, env: Option<&str>) -> Vec<&KeyGrant> {
        let now = Utc::now();
        self.grants.retain(|_, g| !g.is_expired(now));
        let mut out: Vec<&KeyGrant> = self
            .grants
            .values()
            .filter(|g| env.map_or(true, |e| g.env == e))
            .collect();
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        out
    }

    pub fn del(&mut self, slug: &str) -> bool {
        self.grants.remove(slug).is_some()
    }

    pub fn clear(&mut self) {
        self.grants.clear();
    }

    pub fn size(&self) -> usize {
        self.grants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grade::{DurationClass, KeyGrade, Protection};
    use crate::grant::KeySource;
    use chrono::{DateTime, Duration, Utc};

    fn grant(slug: &str, env: &str, expires_at: Option<DateTime<Utc>>) -> KeyGrant {
        KeyGrant {
            slug: slug.to_string(),
            secret: "v".to_string(),
            grade: KeyGrade::new(Protection::Encrypted, DurationClass::Permanent),
            source: KeySource { vault: "age".to_string(), mech: "static".to_string() },
            env: env.to_string(),
            org: "acme".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_set_get() {
        let mut store = KeyStore::new();
        store.set(grant("acme.prod.A", "prod", None));
        assert_eq!(store.get("acme.prod.A").unwrap().env, "prod");
        assert!(store.get("acme.prod.B").is_none());
    }

    #[test]
    fn test_no_expiry_never_expires() {
        let mut store = KeyStore::new();
        store.set(grant("acme.prod.A", "prod", None));
        assert!(store.get("acme.prod.A").is_some());
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_expired_grant_purged_on_read() {
        let mut store = KeyStore::new();
        store.set(grant("acme.prod.A", "prod", Some(Utc::now() - Duration::seconds(1))));
        assert_eq!(store.size(), 1);
        assert!(store.get("acme.prod.A").is_none());
        // Lazy purge actually removed it
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_reunlock_refreshes_ttl() {
        let mut store = KeyStore::new();
        let early = Utc::now() + Duration::minutes(5);
        let late = Utc::now() + Duration::hours(9);
        store.set(grant("acme.prod.A", "prod", Some(early)));
        store.set(grant("acme.prod.A", "prod", Some(late)));
        assert_eq!(store.size(), 1);
        assert_eq!(store.get("acme.prod.A").unwrap().expires_at, Some(late));
    }

    #[test]
    fn test_entries_filters_env_and_purges() {
        let mut store = KeyStore::new();
        store.set(grant("acme.prod.A", "prod", None));
        store.set(grant("acme.test.B", "test", None));
        store.set(grant("acme.prod.C", "prod", Some(Utc::now() - Duration::seconds(1))));

        let prod: Vec<String> =
            store.entries(Some("prod")).iter().map(|g| g.slug.clone()).collect();
        assert_eq!(prod, vec!["acme.prod.A"]);

        // The expired grant is gone for good, not just filtered out
        assert_eq!(store.size(), 2);
        assert_eq!(store.entries(None).len(), 2);
    }

    #[test]
    fn test_del_and_clear() {
        let mut store = KeyStore::new();
        store.set(grant("acme.prod.A", "prod", None));
        store.set(grant("acme.prod.B", "prod", None));
        assert!(store.del("acme.prod.A"));
        assert!(!store.del("acme.prod.A"));
        store.clear();
        assert_eq!(store.size(), 0);
    }
}
