//! Credential verification.
//!
//! One capability, several identity stores: [`CredentialVerifier`] is
//! implemented by the shadow backend (system accounts) and the file
//! backend (passwd-style flat file). The verifier only answers "do
//! these credentials belong to this account"; the uid/gid floor and
//! superuser rejection are enforced here, by the caller.

mod file;
mod shadow;

pub use file::FileBackend;
pub use shadow::ShadowBackend;

use std::path::PathBuf;

use anyhow::Result;

use crate::config::AuthConfig;
use crate::error::{BrokerError, BrokerResult};

/// Identity resolved for a verified user. Consumed immediately by the
/// privilege drop; never serialized.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Verifies a username/password pair against an identity store.
pub trait CredentialVerifier {
    /// `Ok(None)` means the account is unknown, locked, or the secret
    /// does not match; the caller must not learn which.
    fn verify(&self, username: &str, password: &str) -> Result<Option<Credentials>>;
}

impl<T: CredentialVerifier + ?Sized> CredentialVerifier for Box<T> {
    fn verify(&self, username: &str, password: &str) -> Result<Option<Credentials>> {
        (**self).verify(username, password)
    }
}

/// Verify credentials and enforce the account-class invariants:
/// uid and gid nonzero and strictly above the configured floors.
pub fn authenticate(
    verifier: &dyn CredentialVerifier,
    username: &str,
    password: &str,
    cfg: &AuthConfig,
) -> BrokerResult<Credentials> {
    let creds = verifier
        .verify(username, password)
        .map_err(|e| BrokerError::Auth(format!("verifying '{username}': {e}")))?
        .ok_or_else(|| BrokerError::Auth(format!("authentication failed for '{username}'")))?;

    if creds.uid == 0 || creds.gid == 0 {
        return Err(BrokerError::Auth(format!(
            "account '{username}' resolves to the superuser identity"
        )));
    }
    if creds.uid <= cfg.uid_floor {
        return Err(BrokerError::Auth(format!(
            "uid {} of '{username}' not above floor {}",
            creds.uid, cfg.uid_floor
        )));
    }
    if creds.gid <= cfg.gid_floor {
        return Err(BrokerError::Auth(format!(
            "gid {} of '{username}' not above floor {}",
            creds.gid, cfg.gid_floor
        )));
    }
    Ok(creds)
}

/// Compare a supplied password against a stored crypt hash.
///
/// Empty, `!`-prefixed and `*`-prefixed hashes denote locked accounts
/// and never match.
pub(crate) fn secret_matches(password: &str, stored: &str) -> bool {
    if stored.is_empty() || stored.starts_with('!') || stored.starts_with('*') {
        return false;
    }
    pwhash::unix::verify(password, stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedVerifier(Option<Credentials>);

    impl CredentialVerifier for FixedVerifier {
        fn verify(&self, _username: &str, _password: &str) -> Result<Option<Credentials>> {
            Ok(self.0.clone())
        }
    }

    fn creds(uid: u32, gid: u32) -> Credentials {
        Credentials {
            uid,
            gid,
            home: PathBuf::from("/home/alice"),
        }
    }

    fn cfg() -> AuthConfig {
        AuthConfig::default()
    }

    #[test]
    fn accepts_regular_account() {
        let v = FixedVerifier(Some(creds(1000, 1000)));
        let c = authenticate(&v, "alice", "pw", &cfg()).unwrap();
        assert_eq!(c.uid, 1000);
    }

    #[test]
    fn rejects_unknown_account() {
        let v = FixedVerifier(None);
        assert!(matches!(
            authenticate(&v, "nobody", "pw", &cfg()).unwrap_err(),
            BrokerError::Auth(_)
        ));
    }

    #[test]
    fn rejects_superuser_even_with_valid_secret() {
        let v = FixedVerifier(Some(creds(0, 0)));
        assert!(authenticate(&v, "root", "pw", &cfg()).is_err());
    }

    #[test]
    fn rejects_uid_at_or_below_floor() {
        for uid in [1, 500, 998, 999] {
            let v = FixedVerifier(Some(creds(uid, 1000)));
            assert!(
                authenticate(&v, "sys", "pw", &cfg()).is_err(),
                "uid {uid} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_gid_at_or_below_floor() {
        let v = FixedVerifier(Some(creds(1000, 999)));
        assert!(authenticate(&v, "alice", "pw", &cfg()).is_err());
    }

    #[test]
    fn floor_is_configurable() {
        let mut cfg = cfg();
        cfg.uid_floor = 1999;
        cfg.gid_floor = 1999;
        let v = FixedVerifier(Some(creds(1000, 1000)));
        assert!(authenticate(&v, "alice", "pw", &cfg).is_err());
        let v = FixedVerifier(Some(creds(2000, 2000)));
        assert!(authenticate(&v, "alice", "pw", &cfg).is_ok());
    }

    #[test]
    fn locked_hashes_never_match() {
        assert!(!secret_matches("pw", ""));
        assert!(!secret_matches("pw", "!$6$salt$hash"));
        assert!(!secret_matches("pw", "*"));
    }

    #[test]
    fn crypt_hash_verifies() {
        let hash = pwhash::sha512_crypt::hash("correct horse").unwrap();
        assert!(secret_matches("correct horse", &hash));
        assert!(!secret_matches("wrong horse", &hash));
    }
}
