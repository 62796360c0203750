//! Coordinator signing key material.
//!
//! The coordinator signs the orders it hands to followers. Key generation
//! here is deliberately minimal: a random secret plus its digest, persisted
//! once and reused across restarts. Verification and signing themselves live
//! in the communications daemon.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::files::atomic_write;

const KEYS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::keys");

const SECRET_FILE: &str = "signing.key";
const PUBLIC_FILE: &str = "signing.pub";
const SECRET_LEN: usize = 32;

/// Signing key material for the coordinator role.
pub trait SigningKeys: Send + Sync {
    /// Reports whether a key pair already exists.
    fn exists(&self) -> bool;

    /// Generates and persists a fresh key pair, replacing any partial one.
    fn generate(&self) -> Result<(), KeyError>;
}

/// Key material stored as files under the keys directory.
#[derive(Debug, Clone)]
pub struct FileSigningKeys {
    keys_dir: PathBuf,
}

impl FileSigningKeys {
    #[must_use]
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
        }
    }

    fn secret_path(&self) -> PathBuf {
        self.keys_dir.join(SECRET_FILE)
    }

    fn public_path(&self) -> PathBuf {
        self.keys_dir.join(PUBLIC_FILE)
    }
}

impl SigningKeys for FileSigningKeys {
    fn exists(&self) -> bool {
        self.secret_path().is_file() && self.public_path().is_file()
    }

    fn generate(&self) -> Result<(), KeyError> {
        let mut secret = [0_u8; SECRET_LEN];
        let mut source =
            File::open("/dev/urandom").map_err(|source| KeyError::Randomness { source })?;
        source
            .read_exact(&mut secret)
            .map_err(|source| KeyError::Randomness { source })?;

        let digest = Sha256::digest(secret);
        let public: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        let secret_hex: String = secret.iter().map(|byte| format!("{byte:02x}")).collect();

        atomic_write(&self.secret_path(), secret_hex.as_bytes()).map_err(|source| {
            KeyError::Persist {
                path: self.secret_path(),
                source,
            }
        })?;
        atomic_write(&self.public_path(), public.as_bytes()).map_err(|source| {
            KeyError::Persist {
                path: self.public_path(),
                source,
            }
        })?;
        Ok(())
    }
}

/// Generates the key pair when absent; a present pair is left untouched.
pub fn ensure_keys(keys: &dyn SigningKeys) -> Result<(), KeyError> {
    if keys.exists() {
        debug!(target: KEYS_TARGET, "signing key pair already present");
        return Ok(());
    }
    keys.generate()?;
    info!(target: KEYS_TARGET, "generated signing key pair");
    Ok(())
}

/// Errors raised while generating key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Reading from the system randomness source failed.
    #[error("failed to read system randomness: {source}")]
    Randomness {
        #[source]
        source: io::Error,
    },
    /// Persisting a key file failed.
    #[error("failed to persist key file '{path}': {source}", path = path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
