//! Flat-file identity store: one `name:hash:uid:gid:home` line per
//! account. Used for deployments without system accounts and for
//! integration tests.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::debug;

use super::{secret_matches, CredentialVerifier, Credentials};

/// Verifier backed by a passwd-style account file.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialVerifier for FileBackend {
    fn verify(&self, username: &str, password: &str) -> Result<Option<Credentials>> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading account file {}", self.path.display()))?;

        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(entry) = parse_entry(line) else {
                debug!(
                    "skipping malformed account line {} in {}",
                    lineno + 1,
                    self.path.display()
                );
                continue;
            };
            if entry.name != username {
                continue;
            }
            if !secret_matches(password, &entry.hash) {
                return Ok(None);
            }
            return Ok(Some(Credentials {
                uid: entry.uid,
                gid: entry.gid,
                home: PathBuf::from(entry.home),
            }));
        }
        Ok(None)
    }
}

struct Entry<'a> {
    name: &'a str,
    hash: &'a str,
    uid: u32,
    gid: u32,
    home: &'a str,
}

fn parse_entry(line: &str) -> Option<Entry<'_>> {
    let mut fields = line.splitn(5, ':');
    let name = fields.next()?;
    let hash = fields.next()?;
    let uid = fields.next()?.parse().ok()?;
    let gid = fields.next()?.parse().ok()?;
    let home = fields.next()?;
    if name.is_empty() || home.is_empty() {
        return None;
    }
    Some(Entry {
        name,
        hash,
        uid,
        gid,
        home,
    })
}
