//! External-manager vault - grants carry a reference, not the secret
//!
//! For backends that keep custody of the secret themselves (a cloud SSO
//! CLI, a desktop secret manager): the broker never sees the raw value,
//! only the lookup reference recorded as the assignment's exid. Grades as
//! `reference`, the strictest protection.

use super::Vault;
use anyhow::{bail, Result};

#[derive(Default)]
pub struct ExternalVault;

impl ExternalVault {
    pub fn new() -> Self {
        Self
    }
}

impl Vault for ExternalVault {
    fn name(&self) -> &str {
        "external"
    }

    fn is_unlocked(&self, _exid: Option<&str>) -> Result<bool> {
        Ok(true)
    }

    fn unlock(&self, _passphrase: Option<&str>, _exid: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn get(&self, slug: &str, exid: Option<&str>) -> Result<Option<String>> {
        // The "value" is the reference consumers hand to the external tool
        Ok(Some(exid.unwrap_or(slug).to_string()))
    }

    fn set(&self, _slug: &str, _value: &str) -> Result<()> {
        bail!("the external vault keeps custody of its own values; set the exid on the host assignment instead")
    }

    fn relock(&self, _slug: Option<&str>) -> Result<()> {
        Ok(())
    }
}
