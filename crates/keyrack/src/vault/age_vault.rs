//! Encrypted-file vault backed by age
//!
//! Each secret is one age-encrypted file under the vault directory, named
//! by its slug. The identity key lives next to them; "unlocked" means the
//! identity exists and is readable.

use super::{validate_slug, Vault};
use age::secrecy::ExposeSecret;
use anyhow::{bail, Context, Result};
use std::fs::{self, File, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgeVaultError {
    #[error("age vault not initialized - run an unlock or set to create it")]
    NotInitialized,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),
}

pub struct AgeVault {
    /// Directory for encrypted secrets
    vault_dir: PathBuf,
    /// Path to the identity key file
    identity_path: PathBuf,
}

impl AgeVault {
    pub fn new(root: PathBuf) -> Self {
        let identity_path = root.join("identity.key");
        Self { vault_dir: root.join("secrets"), identity_path }
    }

    /// Create directories and generate the identity key if absent.
    fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.vault_dir)?;
        if let Some(root) = self.identity_path.parent() {
            fs::set_permissions(root, Permissions::from_mode(0o700))?;
        }
        fs::set_permissions(&self.vault_dir, Permissions::from_mode(0o700))?;

        if self.identity_path.exists() {
            return Ok(());
        }

        let identity = age::x25519::Identity::generate();
        let identity_str = identity.to_string();

        let mut file = File::create(&self.identity_path)?;
        file.write_all(identity_str.expose_secret().as_bytes())?;
        fs::set_permissions(&self.identity_path, Permissions::from_mode(0o600))?;
        Ok(())
    }

    fn load_identity(&self) -> Result<age::x25519::Identity> {
        if !self.identity_path.exists() {
            bail!(AgeVaultError::NotInitialized);
        }
        let content =
            fs::read_to_string(&self.identity_path).context("failed to read identity key")?;
        content
            .parse::<age::x25519::Identity>()
            .map_err(|e| anyhow::anyhow!("failed to parse identity: {}", e))
    }

    fn secret_path(&self, slug: &str) -> PathBuf {
        self.vault_dir.join(format!("{}.age", slug))
    }

    fn encrypt(&self, value: &str) -> Result<Vec<u8>> {
        let identity = self.load_identity()?;
        let recipient = identity.to_public();

        let encryptor = age::Encryptor::with_recipients(vec![Box::new(recipient)])
            .expect("non-empty recipient list");

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| AgeVaultError::Encryption(e.to_string()))?;
        writer
            .write_all(value.as_bytes())
            .map_err(|e| AgeVaultError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| AgeVaultError::Encryption(e.to_string()))?;
        Ok(encrypted)
    }

    fn decrypt(&self, encrypted: &[u8]) -> Result<String> {
        let identity = self.load_identity()?;

        let decryptor = match age::Decryptor::new(encrypted)
            .map_err(|e| AgeVaultError::Decryption(e.to_string()))?
        {
            age::Decryptor::Recipients(d) => d,
            _ => bail!(AgeVaultError::Decryption("unexpected passphrase encryption".to_string())),
        };

        let mut decrypted = vec![];
        let mut reader = decryptor
            .decrypt(std::iter::once(&identity as &dyn age::Identity))
            .map_err(|e| AgeVaultError::Decryption(e.to_string()))?;
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| AgeVaultError::Decryption(e.to_string()))?;

        String::from_utf8(decrypted).context("secret is not valid UTF-8")
    }
}

impl Vault for AgeVault {
    fn name(&self) -> &str {
        "age"
    }

    fn is_unlocked(&self, _exid: Option<&str>) -> Result<bool> {
        Ok(self.identity_path.exists())
    }

    fn unlock(&self, _passphrase: Option<&str>, _exid: Option<&str>) -> Result<()> {
        self.init()
    }

    fn get(&self, slug: &str, _exid: Option<&str>) -> Result<Option<String>> {
        validate_slug(slug)?;
        let path = self.secret_path(slug);
        if !path.exists() {
            return Ok(None);
        }
        let encrypted = fs::read(&path)?;
        Ok(Some(self.decrypt(&encrypted)?))
    }

    fn set(&self, slug: &str, value: &str) -> Result<()> {
        validate_slug(slug)?;
        if value.is_empty() {
            bail!("empty value not allowed");
        }
        self.init()?;

        let encrypted = self.encrypt(value)?;
        let path = self.secret_path(slug);
        let mut file = File::create(&path)?;
        file.write_all(&encrypted)?;
        fs::set_permissions(&path, Permissions::from_mode(0o600))?;
        Ok(())
    }

    fn relock(&self, _slug: Option<&str>) -> Result<()> {
        // Nothing held in memory; files stay encrypted at rest
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_vault() -> (AgeVault, PathBuf) {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_dir = std::env::temp_dir()
            .join(format!("keyrack_age_test_{}_{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&temp_dir);
        fs::create_dir_all(&temp_dir).unwrap();
        (AgeVault::new(temp_dir.clone()), temp_dir)
    }

    fn cleanup(path: &Path) {
        let _ = fs::remove_dir_all(path);
    }

    #[test]
    fn test_unlock_is_idempotent() {
        let (vault, dir) = temp_vault();
        assert!(!vault.is_unlocked(None).unwrap());
        vault.unlock(None, None).unwrap();
        assert!(vault.is_unlocked(None).unwrap());
        let identity = fs::read_to_string(dir.join("identity.key")).unwrap();
        vault.unlock(None, None).unwrap();
        assert_eq!(fs::read_to_string(dir.join("identity.key")).unwrap(), identity);
        cleanup(&dir);
    }

    #[test]
    fn test_set_get_round_trip() {
        let (vault, dir) = temp_vault();
        vault.set("acme.prod.DB_URL", "postgres://secret").unwrap();
        assert_eq!(vault.get("acme.prod.DB_URL", None).unwrap().unwrap(), "postgres://secret");
        // On-disk bytes are not the plaintext
        let raw = fs::read(dir.join("secrets/acme.prod.DB_URL.age")).unwrap();
        assert!(!raw.windows(8).any(|w| w == &b"postgres"[..]));
        cleanup(&dir);
    }

    #[test]
    fn test_missing_value_is_none() {
        let (vault, dir) = temp_vault();
        vault.unlock(None, None).unwrap();
        assert!(vault.get("acme.prod.NOPE", None).unwrap().is_none());
        cleanup(&dir);
    }

    #[test]
    fn test_get_before_init_fails() {
        let (vault, dir) = temp_vault();
        // No identity yet: a present-looking read would have to fail, but a
        // missing file is still just None
        assert!(vault.get("acme.prod.X", None).unwrap().is_none());
        assert!(vault.set("", "x").is_err());
        cleanup(&dir);
    }

    #[test]
    fn test_rejects_traversal_slugs() {
        let (vault, dir) = temp_vault();
        vault.unlock(None, None).unwrap();
        assert!(vault.set("../escape", "x").is_err());
        assert!(vault.get("a/b", None).is_err());
        cleanup(&dir);
    }
}
