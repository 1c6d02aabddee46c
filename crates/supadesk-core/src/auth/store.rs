use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::session::Credential;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Persists the session credential between runs.
pub struct SessionStore {
    cache_dir: PathBuf,
}

impl SessionStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Load the stored credential. Expiry is left to `SessionManager::restore`.
    pub fn load(&self) -> Result<Option<Credential>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let credential: Credential =
            serde_json::from_str(&contents).context("Failed to parse session file")?;
        debug!(user_id = %credential.identity.id, "Loaded stored session");
        Ok(Some(credential))
    }

    pub fn save(&self, credential: &Credential) -> Result<()> {
        let path = self.session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(credential)?;
        // An older file may predate the private mode
        if path.exists() {
            restrict_permissions(&path)?;
        }
        let mut file = open_private(&path).context("Failed to open session file")?;
        file.write_all(contents.as_bytes())
            .context("Failed to write session file")?;
        Ok(())
    }

    /// Remove the stored credential, if any.
    pub fn clear(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}

/// Open for writing, creating the file readable by the owner only.
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict session file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
