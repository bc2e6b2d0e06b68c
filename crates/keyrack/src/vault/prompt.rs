//! Prompt vault - values typed in at unlock time, never written to disk
//!
//! The only copy of a prompt-sourced value lives in daemon memory, so the
//! lattice forces its duration to `transient`: it cannot outlive the
//! daemon process.

use super::Vault;
use anyhow::{bail, Result};

#[derive(Default)]
pub struct PromptVault;

impl PromptVault {
    pub fn new() -> Self {
        Self
    }
}

impl Vault for PromptVault {
    fn name(&self) -> &str {
        "prompt"
    }

    fn is_unlocked(&self, _exid: Option<&str>) -> Result<bool> {
        // The terminal is the vault; it is always "open"
        Ok(true)
    }

    fn unlock(&self, _passphrase: Option<&str>, _exid: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn get(&self, slug: &str, _exid: Option<&str>) -> Result<Option<String>> {
        let value = rpassword::prompt_password(format!("Value for {}: ", slug))?;
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn set(&self, _slug: &str, _value: &str) -> Result<()> {
        bail!("the prompt vault does not store values; they are typed in at unlock time")
    }

    fn relock(&self, _slug: Option<&str>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_is_refused() {
        let vault = PromptVault::new();
        assert!(vault.set("acme.prod.X", "v").is_err());
        assert!(vault.is_unlocked(None).unwrap());
    }
}
