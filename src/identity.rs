//! Process-wide node identity, persisted as XDG-located JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

fn identity_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hivemind")
        .join("_identity.json")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
struct IdentityFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// A node's identity: a human-readable name, the path to its PGP private
/// key, and an optional shared password used to derive the session key on
/// handshake (see [`crate::crypto::SessionKey::from_password`]).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    path: PathBuf,
    file: IdentityFile,
}

impl NodeIdentity {
    /// Load (or initialize empty, if absent) the identity at the default
    /// XDG path.
    pub fn load() -> Result<Self> {
        Self::load_from(&identity_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let file = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            IdentityFile::default()
        };
        Ok(Self { path: path.to_path_buf(), file })
    }

    /// Human-readable label. Defaults to the basename of the private key
    /// path, then to `"unnamed-node"`.
    pub fn name(&self) -> String {
        if let Some(name) = &self.file.name {
            return name.clone();
        }
        if let Some(key) = &self.file.key {
            if let Some(basename) = Path::new(key).file_name().and_then(|n| n.to_str()) {
                return basename.to_string();
            }
        }
        "unnamed-node".to_string()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.file.name = Some(name.into());
    }

    /// Path to the PGP private key uniquely identifying this device.
    /// Falls back to `<identity-dir>/<name>.asc` when unset.
    pub fn private_key_path(&self) -> PathBuf {
        if let Some(key) = &self.file.key {
            return PathBuf::from(key);
        }
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{}.asc", self.name()))
    }

    pub fn set_private_key_path(&mut self, key: impl Into<String>) {
        self.file.key = Some(key.into());
    }

    pub fn password(&self) -> Option<&str> {
        self.file.password.as_deref()
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.file.password = Some(password.into());
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.file)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn reload(&mut self) -> Result<()> {
        *self = Self::load_from(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_to_unnamed_node() {
        let dir = tempdir().unwrap();
        let identity = NodeIdentity::load_from(&dir.path().join("_identity.json")).unwrap();
        assert_eq!(identity.name(), "unnamed-node");
    }

    #[test]
    fn name_defaults_to_key_basename() {
        let dir = tempdir().unwrap();
        let mut identity = NodeIdentity::load_from(&dir.path().join("_identity.json")).unwrap();
        identity.set_private_key_path("/etc/hivemind/speaker-one.asc");
        assert_eq!(identity.name(), "speaker-one.asc");
    }

    #[test]
    fn save_and_reload_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("_identity.json");
        let mut identity = NodeIdentity::load_from(&path).unwrap();
        identity.set_name("living-room");
        identity.set_password("hunter2");
        identity.save().unwrap();

        let mut reloaded = NodeIdentity::load_from(&path).unwrap();
        reloaded.reload().unwrap();
        assert_eq!(reloaded.name(), "living-room");
        assert_eq!(reloaded.password(), Some("hunter2"));
    }
}
