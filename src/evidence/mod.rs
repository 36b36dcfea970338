//! Screenshot blob store -- one directory per test id, PNG per stage, and
//! HMAC-signed time-limited retrieval URLs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct ScreenshotStore {
    root: PathBuf,
    key: Vec<u8>,
    ttl_secs: u64,
}

impl ScreenshotStore {
    /// Open the store rooted at `root`. When no signing key is configured a
    /// random one is generated, which invalidates previously issued URLs
    /// across restarts.
    pub fn new(root: impl Into<PathBuf>, key: Option<&str>, ttl_secs: u64) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create screenshot dir {}", root.display()))?;
        let key = match key {
            Some(k) if !k.is_empty() => k.as_bytes().to_vec(),
            _ => {
                tracing::info!("no url_signing_key configured, generating an ephemeral one");
                rand::random::<[u8; 32]>().to_vec()
            }
        };
        Ok(Self { root, key, ttl_secs })
    }

    /// Persist one PNG and return its blob reference (`<test-id>/<stage>.png`).
    pub fn save(&self, test_id: Uuid, stage: &str, png: &[u8]) -> Result<String> {
        let dir = self.root.join(test_id.to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let file = dir.join(format!("{}.png", stage));
        std::fs::write(&file, png)
            .with_context(|| format!("failed to write {}", file.display()))?;
        Ok(format!("{}/{}.png", test_id, stage))
    }

    /// Absolute filesystem path for a stored reference. Rejects references
    /// that would escape the store root.
    pub fn path_for(&self, reference: &str) -> Result<PathBuf> {
        if reference.contains("..") || Path::new(reference).is_absolute() {
            anyhow::bail!("invalid screenshot reference");
        }
        Ok(self.root.join(reference))
    }

    /// Signed, time-limited retrieval URL for a stored reference.
    pub fn signed_url(&self, reference: &str) -> String {
        let expires = Utc::now().timestamp() + self.ttl_secs as i64;
        let sig = self.signature(reference, expires);
        format!(
            "/api/v1/screenshots/{}?expires={}&sig={}",
            reference, expires, sig
        )
    }

    /// Check a presented signature against the reference and expiry.
    pub fn verify(&self, reference: &str, expires: i64, sig: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(presented) = URL_SAFE_NO_PAD.decode(sig) else {
            return false;
        };
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(m) => m,
            Err(_) => return false,
        };
        mac.update(format!("{}|{}", reference, expires).as_bytes());
        mac.verify_slice(&presented).is_ok()
    }

    fn signature(&self, reference: &str, expires: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(format!("{}|{}", reference, expires).as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ScreenshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ScreenshotStore::new(dir.path(), Some("test-key"), 60).unwrap();
        (dir, store)
    }

    #[test]
    fn save_and_resolve_roundtrip() {
        let (_dir, store) = store();
        let id = Uuid::new_v4();
        let reference = store.save(id, "initial", b"png-bytes").unwrap();
        assert_eq!(reference, format!("{}/initial.png", id));
        let path = store.path_for(&reference).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"png-bytes");
    }

    #[test]
    fn signed_url_verifies_and_tampering_fails() {
        let (_dir, store) = store();
        let url = store.signed_url("abc/initial.png");
        let query = url.split('?').nth(1).unwrap();
        let mut expires = 0i64;
        let mut sig = String::new();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "expires" => expires = v.parse().unwrap(),
                "sig" => sig = v.to_string(),
                _ => {}
            }
        }
        assert!(store.verify("abc/initial.png", expires, &sig));
        assert!(!store.verify("abc/final.png", expires, &sig));
        assert!(!store.verify("abc/initial.png", expires - 1, &sig));
    }

    #[test]
    fn expired_signature_is_rejected() {
        let (_dir, store) = store();
        let expired = Utc::now().timestamp() - 10;
        // even a correctly computed signature fails once past expiry
        let sig = store.signature("abc/initial.png", expired);
        assert!(!store.verify("abc/initial.png", expired, &sig));
    }

    #[test]
    fn path_traversal_is_rejected() {
        let (_dir, store) = store();
        assert!(store.path_for("../../etc/passwd").is_err());
        assert!(store.path_for("/etc/passwd").is_err());
    }
}
