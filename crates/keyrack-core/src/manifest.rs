//! Manifest resolution engine
//!
//! A repository manifest declares which credentials an environment needs,
//! possibly inheriting from other manifests via `extends`. Hydration
//! flattens the whole chain into one slug -> spec map. All file access is
//! delegated to a [`ManifestSource`] so the engine itself stays pure.

use crate::grade::{GradeParseError, KeyGrade};
use crate::slug::make_slug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The synthetic env whose keys apply everywhere.
pub const ALL_ENV: &str = "all";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("circular extends chain: {0}")]
    CircularExtends(String),

    #[error("manifest {path}: env.{env} key '{name}': {source}")]
    BadGrade {
        path: String,
        env: String,
        name: String,
        #[source]
        source: GradeParseError,
    },

    #[error("failed to load manifest {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("env '{env}' is not declared in the manifest (declared: {declared}); pass one of those or omit --env for the shared keys")]
    UnknownEnv { env: String, declared: String },
}

/// One credential requirement declared by a repo manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Canonical slug, `org.env.name`
    pub slug: String,
    /// Bare key name as declared
    pub name: String,
    /// Env section the spec lives under (after `all` expansion)
    pub env: String,
    /// Acquisition mechanism, when the manifest pins one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mech: Option<String>,
    /// Declared grade requirement; `None` means infer from the host
    /// assignment later
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<KeyGrade>,
}

/// A key entry as a loader produced it, before expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawKey {
    pub name: String,
    /// Grade shorthand string, e.g. `"encrypted,ephemeral"`
    pub grade: Option<String>,
}

/// A parsed manifest document, before hydration.
#[derive(Debug, Clone, Default)]
pub struct RawManifest {
    pub org: String,
    /// env name -> declared keys; the `all` section is expanded during
    /// hydration
    pub envs: BTreeMap<String, Vec<RawKey>>,
    /// Paths of manifests to inherit, resolved relative to the repo root
    pub extends: Vec<String>,
}

/// Loader collaborator. Parsing and file I/O live outside the engine.
pub trait ManifestSource {
    fn load(&self, path: &Path) -> anyhow::Result<RawManifest>;
}

/// The flattened result of hydrating a manifest chain.
#[derive(Debug, Clone, Default)]
pub struct RepoManifest {
    pub org: String,
    /// Declared envs across the whole chain, `all` excluded
    pub envs: Vec<String>,
    pub keys: BTreeMap<String, KeySpec>,
    /// Ordered extends chain, for diagnostics
    pub extends: Vec<PathBuf>,
}

impl RepoManifest {
    /// Keys belonging to one env. `all`-declared keys were already expanded
    /// into every declared env during hydration, so a plain filter is exact.
    pub fn keys_for_env(&self, env: &str) -> Vec<&KeySpec> {
        self.keys.values().filter(|k| k.env == env).collect()
    }

    /// Specs sharing a bare key name, across envs.
    pub fn find_by_name(&self, name: &str) -> Vec<&KeySpec> {
        self.keys.values().filter(|k| k.name == name).collect()
    }

    /// The env a bulk operation targets: the requested one if declared,
    /// the shared `all` tier when nothing was requested.
    pub fn resolve_env(&self, requested: Option<&str>) -> Result<String, ManifestError> {
        match requested {
            None => Ok(ALL_ENV.to_string()),
            Some(env) if env == ALL_ENV || self.envs.iter().any(|e| e == env) => {
                Ok(env.to_string())
            }
            Some(env) => Err(ManifestError::UnknownEnv {
                env: env.to_string(),
                declared: if self.envs.is_empty() {
                    "none".to_string()
                } else {
                    self.envs.join(", ")
                },
            }),
        }
    }
}

/// Hydrate the manifest at `path`, recursively resolving its `extends`
/// chain. `repo_root` anchors relative extends paths.
pub fn hydrate(
    path: &Path,
    repo_root: &Path,
    loader: &dyn ManifestSource,
) -> Result<RepoManifest, ManifestError> {
    let mut chain = Vec::new();
    hydrate_inner(resolve_path(repo_root, path), repo_root, loader, &mut chain)
}

fn resolve_path(repo_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        normalize(&repo_root.join(path))
    }
}

/// Lexically normalize `.` and `..` components so the same manifest reached
/// through different spellings still matches in the cycle check.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn hydrate_inner(
    path: PathBuf,
    repo_root: &Path,
    loader: &dyn ManifestSource,
    chain: &mut Vec<PathBuf>,
) -> Result<RepoManifest, ManifestError> {
    if chain.contains(&path) {
        let mut names: Vec<String> =
            chain.iter().map(|p| p.display().to_string()).collect();
        names.push(path.display().to_string());
        return Err(ManifestError::CircularExtends(names.join(" -> ")));
    }
    chain.push(path.clone());

    let raw = loader.load(&path).map_err(|e| ManifestError::Load {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut keys: BTreeMap<String, KeySpec> = BTreeMap::new();
    let mut envs: Vec<String> = Vec::new();
    let mut extends: Vec<PathBuf> = Vec::new();

    // Later extends entries override earlier ones on slug collision.
    for entry in &raw.extends {
        let child_path = resolve_path(repo_root, Path::new(entry));
        let child = hydrate_inner(child_path.clone(), repo_root, loader, chain)?;
        extends.push(child_path);
        extends.extend(child.extends);
        for env in child.envs {
            if !envs.contains(&env) {
                envs.push(env);
            }
        }
        keys.extend(child.keys);
    }

    // The manifest's own keys win over anything it extends.
    keys.extend(expand_level(&raw, &path)?);
    for env in raw.envs.keys() {
        if env != ALL_ENV && !envs.contains(env) {
            envs.push(env.clone());
        }
    }

    chain.pop();
    Ok(RepoManifest { org: raw.org, envs, keys, extends })
}

/// Expand one manifest level into its slug map: the `all` section is
/// resolvable directly and copied into every declared env, unless the env
/// declares the same name itself.
fn expand_level(
    raw: &RawManifest,
    path: &Path,
) -> Result<BTreeMap<String, KeySpec>, ManifestError> {
    let spec = |env: &str, rk: &RawKey| -> Result<KeySpec, ManifestError> {
        let grade = match rk.grade.as_deref() {
            None | Some("") => None,
            Some(shorthand) => Some(KeyGrade::parse_shorthand(shorthand).map_err(|e| {
                ManifestError::BadGrade {
                    path: path.display().to_string(),
                    env: env.to_string(),
                    name: rk.name.clone(),
                    source: e,
                }
            })?),
        };
        Ok(KeySpec {
            slug: make_slug(&raw.org, env, &rk.name),
            name: rk.name.clone(),
            env: env.to_string(),
            mech: None,
            grade,
        })
    };

    let mut keys = BTreeMap::new();
    let all_keys = raw.envs.get(ALL_ENV);

    if let Some(all) = all_keys {
        for rk in all {
            let s = spec(ALL_ENV, rk)?;
            keys.insert(s.slug.clone(), s);
        }
    }

    for (env, entries) in &raw.envs {
        if env == ALL_ENV {
            continue;
        }
        if let Some(all) = all_keys {
            for rk in all {
                let s = spec(env, rk)?;
                keys.insert(s.slug.clone(), s);
            }
        }
        // Env-specific declarations beat the expanded `all` copies.
        for rk in entries {
            let s = spec(env, rk)?;
            keys.insert(s.slug.clone(), s);
        }
    }

    Ok(keys)
}
