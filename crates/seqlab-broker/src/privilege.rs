//! Privilege de-escalation.
//!
//! The broker starts with superuser-equivalent privileges and gives
//! them up in a fixed order before touching anything on behalf of the
//! authenticated user: supplementary groups first (still elevated),
//! then the primary group, then the uid, and finally a `chdir` into
//! the directory containing the request's target path. Handlers after
//! the drop operate on the bare final path component only, so every
//! filesystem access is confined to the directory the process sits in.

use std::ffi::CString;
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use nix::unistd::{chdir, initgroups, setgid, setuid, Gid, Uid};

use crate::auth::Credentials;
use crate::error::{BrokerError, BrokerResult};

/// Whether the uid/gid steps of the drop actually run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeMode {
    /// Full drop. Requires the broker to start elevated.
    Enforced,
    /// Skip the identity changes; only the directory scoping applies.
    /// Development and test runs only, refused when euid is 0.
    Unprivileged,
}

impl PrivilegeMode {
    /// Pick the mode from configuration, refusing the unprivileged
    /// escape hatch on an elevated process.
    pub fn from_config(allow_unprivileged: bool) -> BrokerResult<Self> {
        let euid = Uid::effective();
        if allow_unprivileged {
            if euid.is_root() {
                return Err(BrokerError::Privilege(
                    "unprivileged mode refused while running as root".to_string(),
                ));
            }
            warn!("running unprivileged; identity changes are skipped");
            return Ok(PrivilegeMode::Unprivileged);
        }
        if !euid.is_root() {
            return Err(BrokerError::Privilege(format!(
                "effective uid {euid} cannot drop privileges; start as root \
                 or set allow_unprivileged"
            )));
        }
        Ok(PrivilegeMode::Enforced)
    }
}

/// A request target split into the directory the broker confines
/// itself to and the bare name handlers operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedPath {
    pub dir: PathBuf,
    pub name: String,
}

impl ScopedPath {
    /// Validate and split an absolute target path.
    pub fn new(raw: &str) -> BrokerResult<Self> {
        let malformed = |why: &str| BrokerError::Privilege(format!("path '{raw}': {why}"));

        if raw.is_empty() {
            return Err(malformed("empty"));
        }
        if raw.bytes().any(|b| b == 0 || b.is_ascii_control()) {
            return Err(malformed("contains control bytes"));
        }
        let path = Path::new(raw);
        if !path.is_absolute() {
            return Err(malformed("not absolute"));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(malformed("contains parent-directory components"));
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Err(malformed("no final component"));
        };
        let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        Ok(Self {
            dir,
            name: name.to_string(),
        })
    }

    /// Scope to a directory itself: confine into it, no bare name.
    pub fn whole_dir(raw: &str) -> BrokerResult<PathBuf> {
        let malformed = |why: &str| BrokerError::Privilege(format!("path '{raw}': {why}"));
        if raw.is_empty() {
            return Err(malformed("empty"));
        }
        if raw.bytes().any(|b| b == 0 || b.is_ascii_control()) {
            return Err(malformed("contains control bytes"));
        }
        let path = Path::new(raw);
        if !path.is_absolute() {
            return Err(malformed("not absolute"));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(malformed("contains parent-directory components"));
        }
        Ok(path.to_path_buf())
    }
}

/// Drop to the authenticated user and confine the process to `dir`.
///
/// Order matters: `initgroups` needs the elevated credentials, and
/// `setgid` must precede `setuid` or the gid change would itself be a
/// privilege violation. The chdir runs last so its permission check
/// happens with the target user's identity.
pub fn drop_to(
    username: &str,
    creds: &Credentials,
    dir: &Path,
    mode: PrivilegeMode,
) -> BrokerResult<()> {
    if mode == PrivilegeMode::Enforced {
        let cname = CString::new(username)
            .map_err(|_| BrokerError::Privilege("username contains NUL".to_string()))?;
        let gid = Gid::from_raw(creds.gid);
        let uid = Uid::from_raw(creds.uid);

        initgroups(&cname, gid).map_err(|e| {
            BrokerError::Privilege(format!("initgroups for '{username}': {e}"))
        })?;
        setgid(gid)
            .map_err(|e| BrokerError::Privilege(format!("setgid {}: {e}", creds.gid)))?;
        setuid(uid)
            .map_err(|e| BrokerError::Privilege(format!("setuid {}: {e}", creds.uid)))?;
        debug!("dropped to uid {} gid {}", creds.uid, creds.gid);
    }

    chdir(dir)
        .map_err(|e| BrokerError::Privilege(format!("chdir {}: {e}", dir.display())))?;
    debug!("confined to {}", dir.display());
    Ok(())
}
