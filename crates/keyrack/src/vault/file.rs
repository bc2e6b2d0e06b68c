//! Plaintext-file vault
//!
//! A single owner-only JSON document mapping slug to value. Grades as
//! `plaintext` in the lattice; useful for values that are not actually
//! secret (endpoints, profile names) but still flow through the broker.

use super::{validate_slug, Vault};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

pub struct PlainFileVault {
    path: PathBuf,
}

impl PlainFileVault {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("malformed vault file {}", self.path.display()))
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(values)?)?;
        fs::set_permissions(&tmp, Permissions::from_mode(0o600))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Vault for PlainFileVault {
    fn name(&self) -> &str {
        "file"
    }

    fn is_unlocked(&self, _exid: Option<&str>) -> Result<bool> {
        // Plaintext files have no locked state
        Ok(true)
    }

    fn unlock(&self, _passphrase: Option<&str>, _exid: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn get(&self, slug: &str, _exid: Option<&str>) -> Result<Option<String>> {
        validate_slug(slug)?;
        Ok(self.load()?.get(slug).cloned())
    }

    fn set(&self, slug: &str, value: &str) -> Result<()> {
        validate_slug(slug)?;
        let mut values = self.load()?;
        values.insert(slug.to_string(), value.to_string());
        self.save(&values)
    }

    fn relock(&self, _slug: Option<&str>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_vault() -> (PlainFileVault, PathBuf) {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir()
            .join(format!("keyrack_file_test_{}_{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&dir);
        (PlainFileVault::new(dir.join("values.json")), dir)
    }

    #[test]
    fn test_set_get() {
        let (vault, dir) = temp_vault();
        assert!(vault.get("acme.prod.URL", None).unwrap().is_none());
        vault.set("acme.prod.URL", "https://example.test").unwrap();
        assert_eq!(vault.get("acme.prod.URL", None).unwrap().unwrap(), "https://example.test");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_mode_0600() {
        let (vault, dir) = temp_vault();
        vault.set("acme.prod.URL", "v").unwrap();
        let mode = fs::metadata(dir.join("values.json")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_always_unlocked() {
        let (vault, dir) = temp_vault();
        assert!(vault.is_unlocked(None).unwrap());
        vault.relock(None).unwrap();
        assert!(vault.is_unlocked(None).unwrap());
        let _ = fs::remove_dir_all(&dir);
    }
}
