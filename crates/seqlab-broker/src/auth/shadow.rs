//! System identity store: passwd for account resolution, shadow for
//! the stored secret. Requires the broker's elevated starting
//! privileges to read the shadow file, so verification must run
//! before the privilege drop.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use nix::unistd::User;

use super::{secret_matches, CredentialVerifier, Credentials};

/// Verifier backed by the host's passwd/shadow databases.
pub struct ShadowBackend {
    shadow_path: PathBuf,
}

impl ShadowBackend {
    pub fn new() -> Self {
        Self {
            shadow_path: PathBuf::from("/etc/shadow"),
        }
    }

    /// Override the shadow file location (tests, chroot deployments).
    pub fn with_shadow_path(path: impl Into<PathBuf>) -> Self {
        Self {
            shadow_path: path.into(),
        }
    }

    fn stored_secret(&self, username: &str) -> Result<Option<String>> {
        let raw = std::fs::read_to_string(&self.shadow_path)
            .with_context(|| format!("reading {}", self.shadow_path.display()))?;
        Ok(lookup_shadow_hash(&raw, username))
    }
}

impl Default for ShadowBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialVerifier for ShadowBackend {
    fn verify(&self, username: &str, password: &str) -> Result<Option<Credentials>> {
        let Some(user) = User::from_name(username).context("passwd lookup")? else {
            debug!("no passwd entry for '{username}'");
            return Ok(None);
        };
        let Some(stored) = self.stored_secret(username)? else {
            debug!("no shadow entry for '{username}'");
            return Ok(None);
        };
        if !secret_matches(password, &stored) {
            return Ok(None);
        }
        Ok(Some(Credentials {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        }))
    }
}

/// Pull the hash field for `username` out of shadow-format content.
fn lookup_shadow_hash(content: &str, username: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let name = fields.next()?;
        if name != username {
            return None;
        }
        fields.next().map(str::to_owned)
    })
}
