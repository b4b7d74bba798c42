//! Vault file locations.

use std::path::{Path, PathBuf};

const VAULT_DIRNAME: &str = ".localpdub";
const VAULT_FILENAME: &str = "vault.lpd";

/// Paths for the vault file and its atomic-save siblings.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    vault: PathBuf,
}

impl VaultPaths {
    /// Builds paths for a vault at an explicit location.
    #[must_use]
    pub fn at<P: AsRef<Path>>(path: P) -> Self {
        Self {
            vault: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the default location, `$HOME/.localpdub/vault.lpd`,
    /// falling back to the current directory when `HOME` is unset.
    #[must_use]
    pub fn default_location() -> Self {
        let vault = std::env::var_os("HOME").map_or_else(
            || PathBuf::from(VAULT_FILENAME),
            |home| PathBuf::from(home).join(VAULT_DIRNAME).join(VAULT_FILENAME),
        );
        Self { vault }
    }

    /// Returns the vault file path.
    #[must_use]
    pub fn vault_path(&self) -> &Path {
        &self.vault
    }

    /// Returns the in-progress write path (`<vault>.tmp`), never read
    /// on open.
    #[must_use]
    pub fn tmp_path(&self) -> PathBuf {
        self.sibling("tmp")
    }

    /// Returns the previous-save backup path (`<vault>.bak`).
    #[must_use]
    pub fn bak_path(&self) -> PathBuf {
        self.sibling("bak")
    }

    /// Returns the save-lock path (`<vault>.lock`).
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.sibling("lock")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.vault.as_os_str().to_os_string();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }
}
