//! Unlock orchestrator
//!
//! Resolves which slugs an unlock targets, pulls raw secrets out of vault
//! adapters (the only place interactive auth may happen), grades them, and
//! pushes the resulting grants to the session daemon in one UNLOCK batch.
//!
//! Per-slug outcomes are [`GrantAttempt`] values; only configuration
//! inconsistencies (adapter missing, vault disagreeing with the host
//! manifest) abort the whole unlock, because a partial credential set is a
//! worse failure mode than none.

use crate::client::DaemonClient;
use crate::vault::VaultRegistry;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use keyrack_core::duration::format_duration;
use keyrack_core::grade::infer_grade;
use keyrack_core::grant::KeySource;
use keyrack_core::slug::{resolve_slug, split_slug};
use keyrack_core::{GrantAttempt, HostManifest, KeyGrant, RepoManifest, SessionContext};
use tracing::warn;

pub const SUDO_ENV: &str = "sudo";

/// What the caller asked to unlock.
#[derive(Debug, Clone, Default)]
pub struct UnlockRequest {
    pub env: Option<String>,
    pub key: Option<String>,
    pub duration: Option<Duration>,
    pub owner: String,
}

/// Per-slug outcomes plus the slugs the daemon acknowledged.
#[derive(Debug)]
pub struct UnlockOutcome {
    pub attempts: Vec<GrantAttempt>,
    pub unlocked: Vec<String>,
}

impl UnlockOutcome {
    pub fn any_locked(&self) -> bool {
        self.attempts.iter().any(|a| matches!(a, GrantAttempt::Locked { .. }))
    }

    pub fn all_granted(&self) -> bool {
        self.attempts.iter().all(GrantAttempt::is_granted)
    }
}

/// Sudo-tier grants default short; everything else lasts a workday.
pub fn default_ttl(env: &str) -> Duration {
    if env == SUDO_ENV {
        Duration::minutes(30)
    } else {
        Duration::hours(9)
    }
}

/// Resolve the target env and slug set for a request.
///
/// Sudo is special-cased: it requires an explicit key (sudo credentials
/// are never auto-selected in bulk) and scans the host manifest only,
/// since sudo keys are deliberately kept out of the shareable repo
/// manifest.
pub fn resolve_targets(
    req: &UnlockRequest,
    repo: Option<&RepoManifest>,
    host: &HostManifest,
) -> Result<(String, Vec<String>)> {
    if req.env.as_deref() == Some(SUDO_ENV) {
        let key = req.key.as_deref().with_context(|| {
            "unlocking sudo keys requires an explicit --key; they are never selected in bulk"
        })?;
        let targets = host.sudo_candidates(key).into_iter().map(String::from).collect();
        return Ok((SUDO_ENV.to_string(), targets));
    }

    let repo = match repo {
        Some(repo) => repo,
        None => bail!(
            "no keyrack.toml manifest found; run inside a repository that declares one, or use --env sudo --key <k> for host-level keys"
        ),
    };

    let env = repo.resolve_env(req.env.as_deref())?;
    let targets = match &req.key {
        Some(key) => vec![resolve_slug(key, Some(&env), Some(repo))?.slug],
        None => {
            let mut slugs: Vec<String> =
                repo.keys_for_env(&env).into_iter().map(|k| k.slug.clone()).collect();
            slugs.sort();
            slugs
        }
    };
    Ok((env, targets))
}

/// Try to produce a grant for every target slug.
pub fn collect_attempts(
    targets: &[String],
    repo: Option<&RepoManifest>,
    host: &HostManifest,
    vaults: &VaultRegistry,
    requested: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<GrantAttempt>> {
    let mut attempts = Vec::with_capacity(targets.len());

    for slug in targets {
        let assignment = match host.get(slug) {
            Some(assignment) => assignment,
            None => {
                attempts.push(GrantAttempt::absent(
                    slug.clone(),
                    "not configured on this host",
                    Some(format!(
                        "keyrack set --key {} --env {} --vault <vault> --mech <mech>",
                        slug,
                        split_slug(slug).map(|(_, env, _)| env).unwrap_or("<env>")
                    )),
                ));
                continue;
            }
        };

        // A vault named by the host manifest that this build cannot speak
        // is a structural mismatch, not a per-key condition.
        let vault = vaults.get(&assignment.vault).with_context(|| {
            format!(
                "host manifest assigns {} to vault '{}', which this build does not support (available: {})",
                slug,
                assignment.vault,
                vaults.names().join(", ")
            )
        })?;

        let inferred = infer_grade(&assignment.vault, &assignment.mech);
        if inferred.unknown_vault {
            warn!(slug = %slug, vault = %assignment.vault, "unrecognized vault, grading as plaintext");
        }
        if inferred.unknown_mech {
            warn!(slug = %slug, mech = %assignment.mech, "unrecognized mech, grading as permanent");
        }

        // Enforce the declared grade before touching the vault, so a
        // misgraded assignment never triggers interactive auth.
        if let Some(declared) = repo.and_then(|r| r.keys.get(slug)).and_then(|s| s.grade) {
            let reasons = inferred.grade.degradations_from(&declared);
            if !reasons.is_empty() {
                attempts.push(GrantAttempt::blocked(
                    slug.clone(),
                    reasons,
                    Some("move the key to a stronger vault or relax the declared grade".to_string()),
                ));
                continue;
            }
        }

        let exid = assignment.exid.as_deref();
        let unlocked = match vault.is_unlocked(exid) {
            Ok(true) => true,
            Ok(false) => vault.unlock(None, exid).is_ok()
                && vault.is_unlocked(exid).unwrap_or(false),
            Err(e) => {
                attempts.push(GrantAttempt::locked(
                    slug.clone(),
                    format!("vault '{}' is unavailable: {}", assignment.vault, e),
                    None,
                ));
                continue;
            }
        };
        if !unlocked {
            attempts.push(GrantAttempt::locked(
                slug.clone(),
                format!("vault '{}' is locked", assignment.vault),
                Some(format!("unlock the '{}' vault and retry", assignment.vault)),
            ));
            continue;
        }

        let secret = vault
            .get(slug, exid)?
            .with_context(|| {
                format!(
                    "host manifest lists {} in vault '{}' but the vault holds no value; re-run keyrack set for it",
                    slug, assignment.vault
                )
            })?;

        let ttl = match assignment.max_duration() {
            Some(cap) if cap < requested => {
                warn!(
                    slug = %slug,
                    cap = %format_duration(cap),
                    "requested TTL capped by host assignment"
                );
                cap
            }
            _ => requested,
        };

        attempts.push(GrantAttempt::Granted {
            grant: KeyGrant {
                slug: slug.clone(),
                secret,
                grade: inferred.grade,
                source: KeySource {
                    vault: assignment.vault.clone(),
                    mech: assignment.mech.clone(),
                },
                env: assignment.env.clone(),
                org: assignment.org.clone(),
                expires_at: Some(now + ttl),
            },
        });
    }

    Ok(attempts)
}

/// Full unlock flow against the daemon for this (session, owner) pair,
/// spawning it when absent.
pub async fn unlock(
    req: &UnlockRequest,
    ctx: &SessionContext,
    repo: Option<&RepoManifest>,
    host: &HostManifest,
    vaults: &VaultRegistry,
) -> Result<UnlockOutcome> {
    let client = DaemonClient::for_owner(ctx, &req.owner);
    unlock_via(&client, req, repo, host, vaults, true).await
}

/// Unlock against an explicit client; `spawn` controls whether a missing
/// daemon is started first.
pub async fn unlock_via(
    client: &DaemonClient,
    req: &UnlockRequest,
    repo: Option<&RepoManifest>,
    host: &HostManifest,
    vaults: &VaultRegistry,
    spawn: bool,
) -> Result<UnlockOutcome> {
    let (env, targets) = resolve_targets(req, repo, host)?;

    let mut attempts = Vec::new();
    if targets.is_empty() && env == SUDO_ENV {
        // The required --key matched nothing in the host manifest
        let key = req.key.clone().unwrap_or_default();
        attempts.push(GrantAttempt::absent(
            key.clone(),
            "no sudo key on this host matches",
            Some(format!("keyrack set --key {} --env sudo --vault <vault> --mech <mech>", key)),
        ));
    } else {
        let requested = req.duration.unwrap_or_else(|| default_ttl(&env));
        attempts = collect_attempts(&targets, repo, host, vaults, requested, Utc::now())?;
    }

    let grants: Vec<KeyGrant> = attempts
        .iter()
        .filter_map(|a| match a {
            GrantAttempt::Granted { grant } => Some(grant.clone()),
            _ => None,
        })
        .collect();

    let unlocked = if grants.is_empty() {
        Vec::new()
    } else {
        if spawn {
            client.ensure_running(&req.owner).await?;
        }
        client.unlock(grants).await?
    };

    Ok(UnlockOutcome { attempts, unlocked })
}
