//! Grading lattice - how safely and for how long a grant may exist
//!
//! A grade is a (protection, duration) pair. Protection says how well the
//! secret is shielded at rest; duration says how long the credential class
//! is expected to stay valid. Both are inferred from the host assignment:
//! protection from the vault backend, duration from the acquisition
//! mechanism.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How well a stored secret is shielded. Ordered strictest-first: a grant's
/// protection must never be weaker (greater) than what its vault guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protection {
    /// The grant holds a lookup reference, never the secret itself
    Reference,
    /// The secret is encrypted at rest
    Encrypted,
    /// The secret sits in a plaintext file
    Plaintext,
}

/// How long a credential of this class is expected to stay valid.
/// Ordered shortest-lived first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationClass {
    /// Cannot outlive the daemon process
    Transient,
    /// Issued short-lived, e.g. by an SSO flow
    Ephemeral,
    /// A static replica with no built-in expiry
    Permanent,
}

impl Protection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Encrypted => "encrypted",
            Self::Plaintext => "plaintext",
        }
    }
}

impl DurationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Ephemeral => "ephemeral",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for DurationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognized grade shorthand token.
#[derive(Error, Debug)]
#[error("unknown grade token '{0}' (expected one of: reference, encrypted, plaintext, transient, ephemeral, permanent)")]
pub struct GradeParseError(String);

/// A (protection, duration) pair describing a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGrade {
    pub protection: Protection,
    pub duration: DurationClass,
}

impl KeyGrade {
    pub fn new(protection: Protection, duration: DurationClass) -> Self {
        Self { protection, duration }
    }

    /// Parse a manifest grade shorthand like `"encrypted"`, `"ephemeral"`,
    /// or `"encrypted,ephemeral"`. Unspecified dimensions keep the
    /// weakest-assumption defaults (plaintext, permanent).
    pub fn parse_shorthand(s: &str) -> Result<Self, GradeParseError> {
        let mut grade = Self::new(Protection::Plaintext, DurationClass::Permanent);
        for token in s.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Ok(p) = token.parse::<Protection>() {
                grade.protection = p;
            } else if let Ok(d) = token.parse::<DurationClass>() {
                grade.duration = d;
            } else {
                return Err(GradeParseError(token.to_string()));
            }
        }
        Ok(grade)
    }

    /// Reasons this grade, as actually inferred, degrades a declared
    /// requirement. Empty when the requirement is satisfied.
    pub fn degradations_from(&self, declared: &KeyGrade) -> Vec<String> {
        let mut reasons = Vec::new();
        if self.protection > declared.protection {
            reasons.push(format!(
                "protection {} is weaker than declared {}",
                self.protection, declared.protection
            ));
        }
        if self.duration > declared.duration {
            reasons.push(format!(
                "duration {} outlives declared {}",
                self.duration, declared.duration
            ));
        }
        reasons
    }
}

impl fmt::Display for KeyGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.protection, self.duration)
    }
}

impl FromStr for Protection {
    type Err = GradeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reference" => Ok(Self::Reference),
            "encrypted" => Ok(Self::Encrypted),
            "plaintext" => Ok(Self::Plaintext),
            _ => Err(GradeParseError(s.to_string())),
        }
    }
}

impl FromStr for DurationClass {
    type Err = GradeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "ephemeral" => Ok(Self::Ephemeral),
            "permanent" => Ok(Self::Permanent),
            _ => Err(GradeParseError(s.to_string())),
        }
    }
}

/// Result of inferring a grade from a host assignment. The fallback flags
/// mark dimensions that hit the unrecognized-input default; callers must
/// surface those as configuration smells rather than accept them silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferredGrade {
    pub grade: KeyGrade,
    pub unknown_vault: bool,
    pub unknown_mech: bool,
}

/// Protection guaranteed by a vault backend, by name.
fn vault_protection(vault: &str) -> Option<Protection> {
    match vault {
        "age" => Some(Protection::Encrypted),
        "prompt" => Some(Protection::Encrypted),
        "file" => Some(Protection::Plaintext),
        "external" => Some(Protection::Reference),
        _ => None,
    }
}

/// Whether a vault's values exist only in daemon memory.
fn vault_memory_only(vault: &str) -> bool {
    vault == "prompt"
}

/// Duration class implied by an acquisition mechanism, by name.
fn mech_duration(mech: &str) -> Option<DurationClass> {
    match mech {
        "static" => Some(DurationClass::Permanent),
        "sso" => Some(DurationClass::Ephemeral),
        "otp" => Some(DurationClass::Transient),
        _ => None,
    }
}

/// Infer the grade of a (vault, mech) host assignment.
///
/// Protection is a pure function of the vault, duration of the mech, with
/// one override: a memory-only vault forces `transient` because the value
/// cannot outlive the daemon process. Unrecognized inputs fall back to
/// `plaintext` / `permanent` and are flagged for the caller to log.
pub fn infer_grade(vault: &str, mech: &str) -> InferredGrade {
    let protection = vault_protection(vault);
    let mech_class = mech_duration(mech);

    let duration = if vault_memory_only(vault) {
        DurationClass::Transient
    } else {
        mech_class.unwrap_or(DurationClass::Permanent)
    };

    InferredGrade {
        grade: KeyGrade::new(protection.unwrap_or(Protection::Plaintext), duration),
        unknown_vault: protection.is_none(),
        // A memory-only vault decides the duration by itself, but an
        // unrecognized mech string is still worth flagging.
        unknown_mech: mech_class.is_none(),
    }
}
