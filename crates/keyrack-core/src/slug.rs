//! Slug construction and resolution
//!
//! A slug is the canonical identifier `org.env.name` for one credential
//! requirement. Callers may hand us a full slug or a bare key name; bare
//! names resolve against the hydrated repo manifest.

use crate::manifest::RepoManifest;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlugError {
    #[error("key '{name}' exists under multiple envs ({envs}); pass --env to disambiguate")]
    Ambiguous { name: String, envs: String },
}

/// Build the canonical `org.env.name` slug.
pub fn make_slug(org: &str, env: &str, name: &str) -> String {
    format!("{}.{}.{}", org, env, name)
}

/// Split a slug into (org, env, name). Names may themselves contain dots;
/// only the first two separators are structural.
pub fn split_slug(slug: &str) -> Option<(&str, &str, &str)> {
    let mut parts = slug.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(org), Some(env), Some(name))
            if !org.is_empty() && !env.is_empty() && !name.is_empty() =>
        {
            Some((org, env, name))
        }
        _ => None,
    }
}

/// A resolved key selector: the slug to look up and the env it implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub slug: String,
    pub env: Option<String>,
}

/// Resolve caller input (full slug or bare name) to a slug.
///
/// - no manifest: echo the input unchanged, nothing to resolve against
/// - known slug or `org.env.name` shape: pass through
/// - bare name + explicit env: construct `org.env.name`
/// - bare name under exactly one env: infer that env
/// - bare name under several envs: fail naming every candidate
/// - bare name unknown: pass through, the consumer reports "not found"
pub fn resolve_slug(
    input: &str,
    env: Option<&str>,
    manifest: Option<&RepoManifest>,
) -> Result<ResolvedKey, SlugError> {
    let manifest = match manifest {
        Some(m) => m,
        None => {
            return Ok(ResolvedKey { slug: input.to_string(), env: env.map(String::from) });
        }
    };

    if manifest.keys.contains_key(input) {
        let key_env = manifest.keys.get(input).map(|k| k.env.clone());
        return Ok(ResolvedKey { slug: input.to_string(), env: key_env });
    }
    if split_slug(input).is_some() {
        return Ok(ResolvedKey { slug: input.to_string(), env: env.map(String::from) });
    }

    if let Some(env) = env {
        return Ok(ResolvedKey {
            slug: make_slug(&manifest.org, env, input),
            env: Some(env.to_string()),
        });
    }

    let mut envs: Vec<&str> = manifest
        .keys
        .values()
        .filter(|k| k.name == input)
        .map(|k| k.env.as_str())
        .collect();
    envs.sort_unstable();
    envs.dedup();

    match envs.as_slice() {
        [] => Ok(ResolvedKey { slug: input.to_string(), env: None }),
        [only] => Ok(ResolvedKey {
            slug: make_slug(&manifest.org, only, input),
            env: Some((*only).to_string()),
        }),
        many => Err(SlugError::Ambiguous {
            name: input.to_string(),
            envs: many.join(", "),
        }),
    }
}
