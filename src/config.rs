//! Device identity and settings, persisted as TOML under the config directory

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::protocol;

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("AirShare");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("airshare");
    }
    PathBuf::from(".airshare")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hex-encoded random device id, also the advertised service instance name.
    pub id: String,
    /// Display name; empty means the host name.
    pub name: String,
    pub model_name: String,
    pub port: u16,
    pub bind: IpAddr,
    /// Interfaces tried in order before falling back to any usable one.
    pub interfaces: Vec<String>,
    /// Treat the Bluetooth precondition as met on hosts without a radio accessor.
    pub bluetooth: bool,
    pub download_dir: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub archive_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            model_name: protocol::DEFAULT_MODEL_NAME.to_string(),
            port: protocol::PORT,
            bind: IpAddr::from([0, 0, 0, 0]),
            interfaces: vec!["wlan1".to_string(), "wlan0".to_string()],
            bluetooth: true,
            download_dir: None,
            tls_cert: None,
            tls_key: None,
            archive_workers: 4,
        }
    }
}

pub fn generate_id() -> String {
    let mut id = [0u8; protocol::ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

impl Config {
    /// Fresh in-memory config with a random id. Nothing is persisted.
    pub fn ephemeral() -> Self {
        Self { id: generate_id(), ..Self::default() }
    }

    /// Load `path`, creating it (or filling in a missing id) on first use.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            toml::from_str::<Config>(&text).with_context(|| format!("parse {}", path.display()))?
        } else {
            Config::default()
        };
        if cfg.id.is_empty() {
            cfg.id = generate_id();
            tracing::debug!(id = %cfg.id, "generated device id");
            cfg.save(path)?;
        }
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("serialize config")?;
        write_private(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))
    }

    /// Name shown to peers.
    pub fn device_name(&self) -> String {
        if !self.name.trim().is_empty() {
            return self.name.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| protocol::DEFAULT_MODEL_NAME.to_string())
    }

    pub fn download_dir(&self) -> PathBuf {
        match &self.download_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Atomic write: temp file with 0600 permissions, synced, then renamed over `path`.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(p) = path.parent() {
        fs::create_dir_all(p).context("create parent dir")?;
    }
    let temp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&temp_path).context("create temp file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = f.metadata()?.permissions();
            perms.set_mode(0o600);
            f.set_permissions(perms)?;
        }
        f.write_all(contents)?;
        f.flush()?;
        f.sync_all()?;
    }
    fs::rename(&temp_path, path).context("atomic replace")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_generates_and_persists_id() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/config.toml");
        let first = Config::load_or_init(&path)?;
        assert_eq!(first.id.len(), protocol::ID_LEN * 2);
        assert!(first.id.chars().all(|c| c.is_ascii_hexdigit()));
        let again = Config::load_or_init(&path)?;
        assert_eq!(first.id, again.id);
        assert_eq!(again.port, protocol::PORT);
        Ok(())
    }

    #[test]
    fn partial_file_keeps_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "id = \"a1b2c3d4e5f6\"\nname = \"Desk\"\nport = 9000\n")?;
        let cfg = Config::load_or_init(&path)?;
        assert_eq!(cfg.id, "a1b2c3d4e5f6");
        assert_eq!(cfg.device_name(), "Desk");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.interfaces, vec!["wlan1", "wlan0"]);
        assert_eq!(cfg.archive_workers, 4);
        Ok(())
    }

    #[test]
    fn blank_name_falls_back() {
        let cfg = Config { name: "  ".into(), ..Config::ephemeral() };
        assert!(!cfg.device_name().trim().is_empty());
    }

    #[test]
    fn ids_are_random() {
        assert_ne!(generate_id(), generate_id());
    }
}
