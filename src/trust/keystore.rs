//! Ed25519 signing key pair held outside the working tree.
//!
//! The private key lives in `<key_dir>/signing.key` (hex, mode 0600, directory
//! 0700) and the public key in `<key_dir>/signing.pub`. A key pair is never
//! overwritten: signatures made with the old key would silently become
//! invalid. Deletion is a separate, explicit operator action.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::audit::{source, AuditLevel, AuditLog, AuditRecord};
use crate::error::{Classified, ErrorClass};
use crate::storage;

/// File name of the private key inside the key directory.
pub const PRIVATE_KEY_FILE: &str = "signing.key";
/// File name of the public key inside the key directory.
pub const PUBLIC_KEY_FILE: &str = "signing.pub";

const SIGNATURE_LEN: usize = 64;

/// Key store failures.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// A key pair already exists; generation never overwrites it.
    #[error("a signing key already exists at {0}")]
    KeyExists(PathBuf),

    /// No private (or public) key is loaded.
    #[error("no signing key is loaded; run `aether keygen` first")]
    KeyUnavailable,

    /// A signature is not 64 bytes of Ed25519 encoding.
    #[error("malformed signature: expected {SIGNATURE_LEN} bytes, got {0}")]
    MalformedSignature(usize),

    /// A key file could not be decoded.
    #[error("malformed key file {path}: {reason}")]
    MalformedKey {
        /// Offending file.
        path: PathBuf,
        /// Decode failure.
        reason: String,
    },

    /// The private key is readable by group or world.
    #[error("insecure permissions {mode:o} on {path}; expected 600")]
    InsecurePermissions {
        /// Offending file.
        path: PathBuf,
        /// Permission bits found.
        mode: u32,
    },

    /// The confirmation given for destruction does not match the fingerprint.
    #[error("confirmation does not match the current key fingerprint")]
    ConfirmationMismatch,

    /// Filesystem failure.
    #[error("key store I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl Classified for KeyError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::KeyUnavailable | Self::Io { .. } => ErrorClass::ResourceFault,
            Self::InsecurePermissions { .. } => ErrorClass::TrustViolation,
            Self::KeyExists(_)
            | Self::MalformedSignature(_)
            | Self::MalformedKey { .. }
            | Self::ConfirmationMismatch => ErrorClass::ConfigurationFault,
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            Self::KeyExists(_) => "key_exists",
            Self::KeyUnavailable => "key_unavailable",
            Self::MalformedSignature(_) => "malformed_signature",
            Self::MalformedKey { .. } => "malformed_key",
            Self::InsecurePermissions { .. } => "insecure_permissions",
            Self::ConfirmationMismatch => "confirmation_mismatch",
            Self::Io { .. } => "key_io",
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> KeyError + '_ {
    move |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Public description of the loaded key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    /// First 16 hex characters of sha256(public key).
    pub fingerprint: String,
    /// When the public key file was written, if known.
    pub created_at: Option<DateTime<Utc>>,
    /// Location of the public key.
    pub public_key_path: PathBuf,
    /// Whether the private half is loaded (signing possible).
    pub can_sign: bool,
}

/// Fingerprint of a public key: first 16 hex characters of its sha256.
pub fn fingerprint_of(key: &VerifyingKey) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    digest.chars().take(16).collect()
}

/// Owner of the signing key pair.
pub struct KeyStore {
    dir: PathBuf,
    signing: Option<SigningKey>,
    verifying: Option<VerifyingKey>,
    audit: Arc<AuditLog>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("dir", &self.dir)
            .field("fingerprint", &self.fingerprint())
            .field("signing", &"[REDACTED]")
            .finish()
    }
}

impl KeyStore {
    /// Open the key directory and load whatever key material it holds.
    ///
    /// A missing directory or missing files are not an error: the store is
    /// simply empty until [`generate`](Self::generate) runs.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InsecurePermissions`] when the private key file is
    /// group- or world-accessible, or [`KeyError::MalformedKey`] when a key
    /// file cannot be decoded.
    pub fn open(dir: impl Into<PathBuf>, audit: Arc<AuditLog>) -> Result<Self, KeyError> {
        let dir = dir.into();
        let private_path = dir.join(PRIVATE_KEY_FILE);
        let public_path = dir.join(PUBLIC_KEY_FILE);

        let signing = if private_path.exists() {
            let mode = storage::shared_permission_bits(&private_path)
                .map_err(io_err(&private_path))?;
            if mode != 0 {
                let full = storage::permission_bits(&private_path).unwrap_or(mode);
                return Err(KeyError::InsecurePermissions {
                    path: private_path,
                    mode: full,
                });
            }
            Some(read_signing_key(&private_path)?)
        } else {
            None
        };

        let verifying = match &signing {
            Some(key) => Some(key.verifying_key()),
            None if public_path.exists() => Some(read_verifying_key(&public_path)?),
            None => None,
        };

        debug!(
            dir = %dir.display(),
            can_sign = signing.is_some(),
            can_verify = verifying.is_some(),
            "key store opened"
        );

        Ok(Self {
            dir,
            signing,
            verifying,
            audit,
        })
    }

    /// Directory holding the key files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create and persist a new key pair.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyExists`] if either key file already exists, or
    /// [`KeyError::InsecurePermissions`] if the written private key turns out
    /// to be group/world accessible (the file is removed again).
    pub fn generate(&mut self) -> Result<KeyInfo, KeyError> {
        let private_path = self.dir.join(PRIVATE_KEY_FILE);
        let public_path = self.dir.join(PUBLIC_KEY_FILE);
        if private_path.exists() {
            return Err(KeyError::KeyExists(private_path));
        }
        if public_path.exists() {
            return Err(KeyError::KeyExists(public_path));
        }

        storage::create_private_dir(&self.dir).map_err(io_err(&self.dir))?;

        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let signing = SigningKey::from_bytes(&secret);
        let verifying = signing.verifying_key();

        storage::create_private_file(&private_path, hex::encode(signing.to_bytes()).as_bytes())
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    KeyError::KeyExists(private_path.clone())
                } else {
                    KeyError::Io {
                        path: private_path.clone(),
                        source,
                    }
                }
            })?;

        let shared = storage::shared_permission_bits(&private_path)
            .map_err(io_err(&private_path))?;
        if shared != 0 {
            let mode = storage::permission_bits(&private_path).unwrap_or(shared);
            let _ = fs::remove_file(&private_path);
            return Err(KeyError::InsecurePermissions {
                path: private_path,
                mode,
            });
        }

        storage::write_atomic(&public_path, hex::encode(verifying.as_bytes()).as_bytes())
            .map_err(io_err(&public_path))?;

        self.signing = Some(signing);
        self.verifying = Some(verifying);

        let fingerprint = fingerprint_of(&verifying);
        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Audit, source::KEY_STORE, "key_generated")
                .detail(format!("fingerprint={fingerprint} algorithm=ed25519"))
                .outcome("created"),
        ) {
            warn!(error = %e, "failed to audit log key generation");
        }
        info!(fingerprint = %fingerprint, dir = %self.dir.display(), "signing key generated");

        self.info().ok_or(KeyError::KeyUnavailable)
    }

    /// Sign `bytes` with the private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyUnavailable`] when no private key is loaded.
    pub fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>, KeyError> {
        let key = self.signing.as_ref().ok_or(KeyError::KeyUnavailable)?;
        Ok(key.sign(bytes).to_bytes().to_vec())
    }

    /// Check `signature` over `bytes` against the public key.
    ///
    /// A well-formed but wrong signature yields `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MalformedSignature`] when `signature` is not 64
    /// bytes long, or [`KeyError::KeyUnavailable`] when no public key exists.
    pub fn verify(&self, bytes: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        let sig_bytes: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| KeyError::MalformedSignature(signature.len()))?;
        let key = self.verifying.as_ref().ok_or(KeyError::KeyUnavailable)?;
        let signature = Signature::from_bytes(&sig_bytes);
        Ok(key.verify_strict(bytes, &signature).is_ok())
    }

    /// Fingerprint of the loaded public key.
    pub fn fingerprint(&self) -> Option<String> {
        self.verifying.as_ref().map(fingerprint_of)
    }

    /// Description of the loaded key pair, if any.
    pub fn info(&self) -> Option<KeyInfo> {
        let verifying = self.verifying.as_ref()?;
        let public_key_path = self.dir.join(PUBLIC_KEY_FILE);
        let created_at = fs::metadata(&public_key_path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Some(KeyInfo {
            fingerprint: fingerprint_of(verifying),
            created_at,
            public_key_path,
            can_sign: self.signing.is_some(),
        })
    }

    /// Delete the key pair. `confirmation` must equal the current fingerprint.
    ///
    /// Every existing signature becomes unverifiable afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyUnavailable`] when no key exists, or
    /// [`KeyError::ConfirmationMismatch`] when the confirmation is wrong.
    pub fn destroy(&mut self, confirmation: &str) -> Result<(), KeyError> {
        let fingerprint = self.fingerprint().ok_or(KeyError::KeyUnavailable)?;
        if confirmation.trim() != fingerprint {
            if let Err(e) = self.audit.append(
                AuditRecord::new(AuditLevel::Warn, source::KEY_STORE, "key_destroy_refused")
                    .detail(format!("fingerprint={fingerprint}"))
                    .outcome("confirmation_mismatch"),
            ) {
                warn!(error = %e, "failed to audit log refused key destruction");
            }
            return Err(KeyError::ConfirmationMismatch);
        }

        for name in [PRIVATE_KEY_FILE, PUBLIC_KEY_FILE] {
            let path = self.dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(KeyError::Io { path, source }),
            }
        }
        self.signing = None;
        self.verifying = None;

        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Security, source::KEY_STORE, "key_destroyed")
                .detail(format!(
                    "fingerprint={fingerprint}; all existing skill signatures are now unverifiable"
                ))
                .outcome("destroyed"),
        ) {
            error!(error = %e, "failed to audit log key destruction");
        }
        info!(fingerprint = %fingerprint, "signing key destroyed by operator");
        Ok(())
    }
}

fn read_hex_32(path: &Path) -> Result<[u8; 32], KeyError> {
    let text = fs::read_to_string(path).map_err(io_err(path))?;
    let bytes = hex::decode(text.trim()).map_err(|e| KeyError::MalformedKey {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| KeyError::MalformedKey {
        path: path.to_path_buf(),
        reason: format!("expected 32 bytes, got {len}"),
    })
}

fn read_signing_key(path: &Path) -> Result<SigningKey, KeyError> {
    Ok(SigningKey::from_bytes(&read_hex_32(path)?))
}

fn read_verifying_key(path: &Path) -> Result<VerifyingKey, KeyError> {
    VerifyingKey::from_bytes(&read_hex_32(path)?).map_err(|e| KeyError::MalformedKey {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
