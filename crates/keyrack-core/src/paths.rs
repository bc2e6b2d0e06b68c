//! Standard paths used by keyrack tools

use std::path::PathBuf;

/// Standard keyrack paths
pub struct Paths {
    /// Data directory (~/.local/share/keyrack)
    pub data: PathBuf,
    /// Config directory (~/.config/keyrack)
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("keyrack");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("keyrack");

        Self { data, config }
    }

    /// The host manifest document.
    pub fn host_manifest(&self) -> PathBuf {
        self.config.join("host.json")
    }

    /// Root directory for a file-backed vault adapter.
    pub fn vault_root(&self, vault: &str) -> PathBuf {
        self.data.join("vaults").join(vault)
    }
}
