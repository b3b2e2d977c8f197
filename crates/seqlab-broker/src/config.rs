//! Broker configuration.
//!
//! Loaded once at startup from an optional TOML file; every field has
//! a documented default so a missing file yields a working broker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Which identity store backs credential verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthBackendKind {
    /// System accounts via passwd/shadow.
    Shadow,
    /// A passwd-style flat file (`name:hash:uid:gid:home`).
    File,
}

/// Credential verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Backend selection.
    pub backend: AuthBackendKind,
    /// Account file for the `file` backend.
    pub file_path: Option<PathBuf>,
    /// Resolved uid must be strictly greater than this floor.
    /// Keeps system and administrative accounts out.
    pub uid_floor: u32,
    /// Resolved gid must be strictly greater than this floor.
    pub gid_floor: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: AuthBackendKind::Shadow,
            file_path: None,
            uid_floor: 999,
            gid_floor: 999,
        }
    }
}

/// External sequence-description programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DescribeConfig {
    /// Program invoked for a single sequence identifier.
    pub sequence_bin: PathBuf,
    /// Program invoked for a sequence-set identifier.
    pub set_bin: PathBuf,
}

impl Default for DescribeConfig {
    fn default() -> Self {
        Self {
            sequence_bin: PathBuf::from("seqlab-describe"),
            set_bin: PathBuf::from("seqlab-describe-set"),
        }
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Budget for each framed send/receive.
    pub frame_timeout_secs: u64,
    /// Stall budget for raw GET streaming, reset on every write.
    pub get_stall_secs: u64,
    /// Stall budget for PUT chunk arrival, reset on every nonzero chunk.
    pub put_stall_secs: u64,
    /// Overall budget for spawn-and-capture.
    pub exec_timeout_secs: u64,
    /// Upper bound on an announced PUT size.
    pub max_put_bytes: u64,
    /// Name of the completion sentinel left by batch execution.
    pub sentinel_name: String,
    /// Skip the setgroups/setgid/setuid steps. Development only;
    /// refused outright when the broker starts as root.
    pub allow_unprivileged: bool,
    pub auth: AuthConfig,
    pub describe: DescribeConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frame_timeout_secs: 30,
            get_stall_secs: 30,
            put_stall_secs: 120,
            exec_timeout_secs: 86_400,
            max_put_bytes: 512 * 1024 * 1024,
            sentinel_name: ".finished".to_string(),
            allow_unprivileged: false,
            auth: AuthConfig::default(),
            describe: DescribeConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from `path`, or defaults when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                toml::from_str(&raw).with_context(|| format!("parsing config {}", p.display()))
            }
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }

    pub fn get_stall(&self) -> Duration {
        Duration::from_secs(self.get_stall_secs)
    }

    pub fn put_stall(&self) -> Duration {
        Duration::from_secs(self.put_stall_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.frame_timeout_secs, 30);
        assert_eq!(cfg.get_stall_secs, 30);
        assert_eq!(cfg.put_stall_secs, 120);
        assert_eq!(cfg.sentinel_name, ".finished");
        assert!(!cfg.allow_unprivileged);
        assert_eq!(cfg.auth.backend, AuthBackendKind::Shadow);
        assert_eq!(cfg.auth.uid_floor, 999);
    }

    #[test]
    fn load_without_file_gives_defaults() {
        let cfg = BrokerConfig::load(None).unwrap();
        assert_eq!(cfg.frame_timeout_secs, BrokerConfig::default().frame_timeout_secs);
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "put_stall_secs = 300").unwrap();
        writeln!(f, "[auth]").unwrap();
        writeln!(f, "backend = \"file\"").unwrap();
        writeln!(f, "file_path = \"/etc/seqlab/users\"").unwrap();
        let cfg = BrokerConfig::load(Some(f.path())).unwrap();
        assert_eq!(cfg.put_stall_secs, 300);
        assert_eq!(cfg.auth.backend, AuthBackendKind::File);
        assert_eq!(
            cfg.auth.file_path.as_deref(),
            Some(Path::new("/etc/seqlab/users"))
        );
        // Untouched fields keep defaults.
        assert_eq!(cfg.frame_timeout_secs, 30);
        assert_eq!(cfg.auth.uid_floor, 999);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let cfg = BrokerConfig::default();
        let raw = toml::to_string(&cfg).unwrap();
        let back: BrokerConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.exec_timeout_secs, cfg.exec_timeout_secs);
        assert_eq!(back.sentinel_name, cfg.sentinel_name);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(BrokerConfig::load(Some(Path::new("/nonexistent/broker.toml"))).is_err());
    }
}
