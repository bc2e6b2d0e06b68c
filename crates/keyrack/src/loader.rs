//! Manifest file loading
//!
//! The resolution engine in keyrack-core is pure; this module is its file
//! half: TOML repo manifests (discovered by walking up from the working
//! directory) and the JSON host manifest under the user config dir.

use anyhow::{Context, Result};
use keyrack_core::manifest::{hydrate, ManifestSource, RawKey, RawManifest, RepoManifest};
use keyrack_core::HostManifest;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Name of the per-repository manifest file.
pub const MANIFEST_FILE: &str = "keyrack.toml";

/// One env section entry: either a bare key name or `{NAME = "shorthand"}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvEntry {
    Bare(String),
    Graded(BTreeMap<String, String>),
}

#[derive(Debug, Deserialize)]
struct RawDoc {
    org: String,
    #[serde(default)]
    env: BTreeMap<String, Vec<EnvEntry>>,
    #[serde(default)]
    extends: Vec<String>,
}

/// TOML-backed [`ManifestSource`].
pub struct TomlManifestSource;

impl ManifestSource for TomlManifestSource {
    fn load(&self, path: &Path) -> Result<RawManifest> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let doc: RawDoc = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let envs = doc
            .env
            .into_iter()
            .map(|(env, entries)| {
                let keys = entries
                    .into_iter()
                    .flat_map(|entry| match entry {
                        EnvEntry::Bare(name) => vec![RawKey { name, grade: None }],
                        EnvEntry::Graded(map) => map
                            .into_iter()
                            .map(|(name, shorthand)| RawKey {
                                name,
                                grade: if shorthand.is_empty() { None } else { Some(shorthand) },
                            })
                            .collect(),
                    })
                    .collect();
                (env, keys)
            })
            .collect();

        Ok(RawManifest { org: doc.org, envs, extends: doc.extends })
    }
}

/// Walk up from `start` looking for a `keyrack.toml`. Returns the manifest
/// path and the directory holding it (the repo root, which anchors
/// relative `extends` paths).
pub fn find_repo_manifest(start: &Path) -> Option<(PathBuf, PathBuf)> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        let candidate = d.join(MANIFEST_FILE);
        if candidate.is_file() {
            return Some((candidate, d.to_path_buf()));
        }
        dir = d.parent();
    }
    None
}

/// Load and hydrate the repo manifest governing `start_dir`, if any.
pub fn load_repo_manifest(start_dir: &Path) -> Result<Option<RepoManifest>> {
    match find_repo_manifest(start_dir) {
        None => Ok(None),
        Some((path, root)) => {
            let manifest = hydrate(&path, &root, &TomlManifestSource)?;
            Ok(Some(manifest))
        }
    }
}

/// Load the host manifest; a missing file is an empty manifest.
pub fn load_host_manifest(path: &Path) -> Result<HostManifest> {
    if !path.exists() {
        return Ok(HostManifest::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("malformed host manifest {}", path.display()))
}

/// Persist the host manifest atomically, owner-only.
pub fn save_host_manifest(path: &Path, manifest: &HostManifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(manifest)?)?;
    fs::set_permissions(&tmp, Permissions::from_mode(0o600))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
