//! Vault adapters - backends that store or produce raw secrets
//!
//! The broker treats every backend uniformly through the [`Vault`]
//! contract. How a backend authenticates or stores data is its own
//! business; the grading lattice only cares about the backend's name.

mod age_vault;
mod external;
mod file;
mod prompt;

pub use age_vault::AgeVault;
pub use external::ExternalVault;
pub use file::PlainFileVault;
pub use prompt::PromptVault;

use anyhow::Result;
use keyrack_core::Paths;
use std::collections::BTreeMap;

/// The adapter contract every vault backend satisfies.
pub trait Vault: Send + Sync {
    /// Backend name as host manifests reference it.
    fn name(&self) -> &str;

    /// Whether the vault can serve reads right now.
    fn is_unlocked(&self, exid: Option<&str>) -> Result<bool>;

    /// Bring the vault into a readable state. This is where interactive
    /// auth happens, so it must only ever run in the CLI process, never
    /// in the daemon.
    fn unlock(&self, passphrase: Option<&str>, exid: Option<&str>) -> Result<()>;

    /// Read the raw secret for a slug. `None` means the vault holds no
    /// value for it.
    fn get(&self, slug: &str, exid: Option<&str>) -> Result<Option<String>>;

    /// Store a value for a slug.
    fn set(&self, slug: &str, value: &str) -> Result<()>;

    /// Drop any unlocked state, for one slug or entirely.
    fn relock(&self, slug: Option<&str>) -> Result<()>;
}

/// Name -> adapter map for the vaults this build supports.
#[derive(Default)]
pub struct VaultRegistry {
    vaults: BTreeMap<String, Box<dyn Vault>>,
}

impl VaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The adapters compiled into this build.
    pub fn builtin(paths: &Paths) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(AgeVault::new(paths.vault_root("age"))));
        registry.register(Box::new(PlainFileVault::new(
            paths.vault_root("file").join("values.json"),
        )));
        registry.register(Box::new(PromptVault::new()));
        registry.register(Box::new(ExternalVault::new()));
        registry
    }

    pub fn register(&mut self, vault: Box<dyn Vault>) {
        self.vaults.insert(vault.name().to_string(), vault);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Vault> {
        self.vaults.get(name).map(|v| v.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.vaults.keys().map(String::as_str).collect()
    }
}

/// Reject slugs that could escape a file-backed vault's directory.
pub(crate) fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() {
        anyhow::bail!("empty slug");
    }
    if slug.contains('/') || slug.contains("..") {
        anyhow::bail!("invalid slug '{}'", slug);
    }
    for c in slug.chars() {
        if !c.is_alphanumeric() && c != '_' && c != '-' && c != '.' && c != '@' {
            anyhow::bail!("invalid character '{}' in slug '{}'", c, slug);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_lattice_vaults() {
        let paths = Paths::new();
        let registry = VaultRegistry::builtin(&paths);
        for name in ["age", "file", "prompt", "external"] {
            assert!(registry.get(name).is_some(), "missing builtin vault {name}");
        }
        assert!(registry.get("keychain9000").is_none());
    }

    #[test]
    fn test_validate_slug() {
        assert!(validate_slug("acme.prod.DB_URL").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("../escape").is_err());
        assert!(validate_slug("a/b").is_err());
        assert!(validate_slug("spaced out").is_err());
    }
}
