//! Grant model - the shapes shared by the daemon, the client, and the
//! unlock orchestrator
//!
//! A grant is a live, unlocked credential. It exists only in daemon memory
//! and on the wire between the orchestrator and the daemon; it is never
//! written to durable storage.

use crate::grade::KeyGrade;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a grant's secret came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySource {
    /// Vault backend name (e.g. "age", "file", "prompt")
    pub vault: String,
    /// Acquisition mechanism (e.g. "static", "sso")
    pub mech: String,
}

/// A live, unlocked credential held in daemon memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGrant {
    /// Canonical slug, `org.env.name`
    pub slug: String,
    /// The secret value (or lookup reference, for reference-grade vaults)
    pub secret: String,
    /// Grade inferred at unlock time
    pub grade: KeyGrade,
    /// Originating vault and mechanism
    pub source: KeySource,
    /// Deployment tier this grant belongs to
    pub env: String,
    /// Owning organization, or "@all"
    pub org: String,
    /// Absolute expiry; `None` means the grant never expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyGrant {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at <= now,
            None => false,
        }
    }

    /// Milliseconds until expiry, clamped at zero. `None` when the grant
    /// has no expiry.
    pub fn ttl_left_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|at| (at - now).num_milliseconds().max(0))
    }
}

/// Outcome of any code path that tries to produce a grant.
///
/// Absence, a locked vault, and a blocked mechanism are expected, frequent
/// states - not failures. Callers match exhaustively; only configuration
/// inconsistencies are surfaced as errors elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum GrantAttempt {
    /// The credential was unlocked
    Granted { grant: KeyGrant },
    /// Nothing on this host satisfies the slug
    Absent {
        slug: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fix: Option<String>,
    },
    /// The backing vault is locked and would not unlock
    Locked {
        slug: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fix: Option<String>,
    },
    /// The host assignment would degrade the declared grade
    Blocked {
        slug: String,
        reasons: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fix: Option<String>,
    },
}

impl GrantAttempt {
    pub fn absent(slug: impl Into<String>, message: impl Into<String>, fix: Option<String>) -> Self {
        Self::Absent { slug: slug.into(), message: message.into(), fix }
    }

    pub fn locked(slug: impl Into<String>, message: impl Into<String>, fix: Option<String>) -> Self {
        Self::Locked { slug: slug.into(), message: message.into(), fix }
    }

    pub fn blocked(slug: impl Into<String>, reasons: Vec<String>, fix: Option<String>) -> Self {
        Self::Blocked { slug: slug.into(), reasons, fix }
    }

    /// The slug this attempt was for.
    pub fn slug(&self) -> &str {
        match self {
            Self::Granted { grant } => &grant.slug,
            Self::Absent { slug, .. } | Self::Locked { slug, .. } | Self::Blocked { slug, .. } => {
                slug
            }
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grade::{DurationClass, Protection};
    use chrono::Duration;

    fn grant(slug: &str, expires_at: Option<DateTime<Utc>>) -> KeyGrant {
        KeyGrant {
            slug: slug.to_string(),
            secret: "s3cret".to_string(),
            grade: KeyGrade::new(Protection::Encrypted, DurationClass::Permanent),
            source: KeySource { vault: "age".to_string(), mech: "static".to_string() },
            env: "prod".to_string(),
            org: "acme".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        assert!(!grant("acme.prod.A", None).is_expired(now));
        assert!(!grant("acme.prod.A", Some(now + Duration::hours(1))).is_expired(now));
        assert!(grant("acme.prod.A", Some(now - Duration::seconds(1))).is_expired(now));
    }

    #[test]
    fn test_ttl_left_clamped() {
        let now = Utc::now();
        let g = grant("acme.prod.A", Some(now - Duration::hours(1)));
        assert_eq!(g.ttl_left_ms(now), Some(0));
        assert_eq!(grant("acme.prod.A", None).ttl_left_ms(now), None);
    }

    #[test]
    fn test_attempt_slug() {
        let a = GrantAttempt::absent("acme.prod.A", "not configured", None);
        assert_eq!(a.slug(), "acme.prod.A");
        assert!(!a.is_granted());
        let g = GrantAttempt::Granted { grant: grant("acme.prod.B", None) };
        assert_eq!(g.slug(), "acme.prod.B");
        assert!(g.is_granted());
    }
}
