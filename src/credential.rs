//! Credential sealing and verification.
//!
//! Privileged actions are gated by the credential the host app supplied with
//! its last config write. Only a digest of it is kept on disk; the plaintext
//! is never persisted.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BridgeError, BridgeResult};
use crate::platform;

/// Hex digest a credential seals to.
pub(crate) fn seal_digest(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hex::encode(hasher.finalize())
}

/// On-disk form of a sealed credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSeal {
    pub algorithm: String,
    pub digest: String,
    pub sealed_at: DateTime<Utc>,
}

impl CredentialSeal {
    pub fn for_credential(credential: &str) -> Self {
        CredentialSeal {
            algorithm: "sha256".to_string(),
            digest: seal_digest(credential),
            sealed_at: Utc::now(),
        }
    }

    pub fn matches(&self, credential: &str) -> bool {
        self.algorithm == "sha256" && self.digest == seal_digest(credential)
    }
}

/// Decides whether a presented credential may run privileged actions.
pub trait CredentialPolicy: Send + Sync {
    /// Ok on acceptance, `Unauthorized` otherwise.
    fn authorize(&self, credential: &str) -> BridgeResult<()>;
}

/// Checks credentials against the digest sealed by the last config write.
///
/// No seal on disk means nothing has been authorized yet, so every credential
/// is rejected until a config write establishes one.
pub struct SealedDigestPolicy {
    seal_path: PathBuf,
}

impl Default for SealedDigestPolicy {
    fn default() -> Self {
        SealedDigestPolicy {
            seal_path: platform::credential_seal_path(),
        }
    }
}

impl SealedDigestPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal location override, mainly for tests.
    pub fn with_seal_path(seal_path: impl Into<PathBuf>) -> Self {
        SealedDigestPolicy {
            seal_path: seal_path.into(),
        }
    }

    fn load(&self) -> BridgeResult<CredentialSeal> {
        let raw = fs::read_to_string(&self.seal_path).map_err(|e| {
            debug!(
                "credential seal unreadable at {}: {e}",
                self.seal_path.display()
            );
            BridgeError::Unauthorized
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            debug!(
                "credential seal at {} is malformed: {e}",
                self.seal_path.display()
            );
            BridgeError::Unauthorized
        })
    }
}

impl CredentialPolicy for SealedDigestPolicy {
    fn authorize(&self, credential: &str) -> BridgeResult<()> {
        if credential.is_empty() {
            return Err(BridgeError::Unauthorized);
        }
        let seal = self.load()?;
        if seal.matches(credential) {
            Ok(())
        } else {
            debug!("credential rejected against {}", self.seal_path.display());
            Err(BridgeError::Unauthorized)
        }
    }
}
