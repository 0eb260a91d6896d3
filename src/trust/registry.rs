//! Catalog of signed skills.
//!
//! Each skill is two files under the skills directory: `<name>.skill` holds
//! the source bytes and `<name>.manifest.json` the signed [`SkillManifest`].
//! Source is treated as untrusted input and re-hashed on every verification.
//! [`SkillRegistry::load_for_execution`] is the only constructor of an
//! [`ExecutableHandle`], so nothing can run without passing verification.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use super::keystore::{KeyError, KeyStore};
use super::scanner::{ScanReport, SecurityScanner};
use crate::audit::{source, AuditError, AuditLevel, AuditLog, AuditRecord};
use crate::error::{Classified, ErrorClass};
use crate::storage;

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

const SOURCE_EXT: &str = "skill";
const MANIFEST_SUFFIX: &str = ".manifest.json";
const MAX_NAME_LEN: usize = 64;

/// Registry failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Skill names are limited to `[A-Za-z0-9_-]{1,64}`.
    #[error("invalid skill name {0:?}: use 1-64 letters, digits, '_' or '-'")]
    InvalidName(String),

    /// The static scan found a disqualifying issue; nothing was signed.
    #[error("security scan rejected skill {name}: {summary}")]
    ScanRejected {
        /// Skill name.
        name: String,
        /// Scan findings.
        summary: String,
    },

    /// A manifest with this name exists and overwrite was not requested.
    #[error("skill {0} is already registered; pass overwrite to replace it")]
    DuplicateName(String),

    /// Verification failed; the skill must not run.
    #[error("skill {name} is untrusted: {reason}")]
    UntrustedSkill {
        /// Skill name.
        name: String,
        /// Why verification failed.
        reason: UntrustedReason,
    },

    /// No manifest or source exists for the name.
    #[error("skill {0} is not registered")]
    NotFound(String),

    /// Key store failure while signing.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Filesystem failure.
    #[error("skill registry I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A manifest could not be encoded.
    #[error("manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A per-name write lock was poisoned.
    #[error("skill registry lock poisoned")]
    LockPoisoned,

    /// A trust violation or scan rejection was found but its SECURITY entry
    /// could not be written.
    #[error("skill {name}: {violation} could not be audited: {source}")]
    Unaudited {
        /// Skill name.
        name: String,
        /// The unrecorded violation (`scan_rejected` or an untrusted reason).
        violation: String,
        /// Verdict, when the violation came from verification.
        result: Option<Box<VerificationResult>>,
        /// Audit failure.
        #[source]
        source: AuditError,
    },
}

impl Classified for RegistryError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidName(_) | Self::DuplicateName(_) | Self::NotFound(_) => {
                ErrorClass::ConfigurationFault
            }
            Self::ScanRejected { .. } => ErrorClass::PolicyDenial,
            Self::UntrustedSkill { .. } => ErrorClass::TrustViolation,
            Self::Key(e) => e.class(),
            Self::Io { .. } | Self::Serialization(_) | Self::LockPoisoned => {
                ErrorClass::ResourceFault
            }
            Self::Unaudited { .. } => ErrorClass::TrustViolation,
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "invalid_skill_name",
            Self::ScanRejected { .. } => "scan_rejected",
            Self::DuplicateName(_) => "duplicate_name",
            Self::UntrustedSkill { reason, .. } => reason.as_str(),
            Self::NotFound(_) => "skill_not_found",
            Self::Key(e) => e.reason_code(),
            Self::Io { .. } => "registry_io",
            Self::Serialization(_) => "registry_serialization",
            Self::LockPoisoned => "registry_lock_poisoned",
            Self::Unaudited { .. } => "audit_unavailable",
        }
    }
}

/// Why a skill failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UntrustedReason {
    /// Source bytes changed after signing.
    DigestMismatch,
    /// Signature does not verify under the current public key.
    SignatureInvalid,
    /// No manifest exists for the source.
    ManifestMissing,
    /// Manifest exists but the source file is gone.
    SourceMissing,
}

impl UntrustedReason {
    /// Stable reason code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DigestMismatch => "digest_mismatch",
            Self::SignatureInvalid => "signature_invalid",
            Self::ManifestMissing => "manifest_missing",
            Self::SourceMissing => "source_missing",
        }
    }
}

impl std::fmt::Display for UntrustedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trust verdict for one skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TrustStatus {
    /// Digest and signature both check out.
    Trusted,
    /// Must never be loaded.
    Untrusted(UntrustedReason),
}

/// Outcome of [`SkillRegistry::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    /// Skill name.
    pub name: String,
    /// Verdict.
    pub status: TrustStatus,
    /// Human-readable explanation.
    pub detail: String,
}

impl VerificationResult {
    /// Whether the skill may be loaded.
    pub fn is_trusted(&self) -> bool {
        self.status == TrustStatus::Trusted
    }

    /// Failure reason, if untrusted.
    pub fn reason(&self) -> Option<UntrustedReason> {
        match self.status {
            TrustStatus::Trusted => None,
            TrustStatus::Untrusted(reason) => Some(reason),
        }
    }
}

/// Operator-supplied metadata for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillMetadata {
    /// Version string.
    pub version: String,
    /// What the skill does.
    pub description: String,
    /// Who wrote it.
    pub author: String,
}

impl Default for SkillMetadata {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_owned(),
            description: String::new(),
            author: "aether".to_owned(),
        }
    }
}

/// Signed record describing one skill's trusted content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillManifest {
    /// Manifest format version.
    pub schema_version: u32,
    /// Unique skill name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Description.
    pub description: String,
    /// Author.
    pub author: String,
    /// sha256 of the source bytes, hex.
    pub content_digest: String,
    /// Ed25519 signature over [`signing_payload`], hex.
    pub signature: String,
    /// Fingerprint of the key that signed it.
    pub key_fingerprint: String,
    /// When it was signed.
    pub created_at: DateTime<Utc>,
    /// Static scan result at signing time.
    pub security_scan_result: ScanReport,
}

/// Bytes covered by a skill signature. Binds name and version to the digest
/// so a manifest cannot be replayed under another name.
pub fn signing_payload(name: &str, version: &str, digest_hex: &str) -> Vec<u8> {
    format!("aether-skill:v{MANIFEST_VERSION}:{name}:{version}:{digest_hex}").into_bytes()
}

/// sha256 of `bytes`, hex encoded.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Verified skill code ready to hand to a runtime.
///
/// Holds the exact bytes that passed verification; there is no way to build
/// one outside this module.
#[derive(Debug, Clone)]
pub struct ExecutableHandle {
    name: String,
    version: String,
    digest: String,
    source: Vec<u8>,
}

impl ExecutableHandle {
    /// Skill name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Skill version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Digest of [`source`](Self::source).
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Verified source bytes.
    pub fn source(&self) -> &[u8] {
        &self.source
    }
}

/// Check a skill name against `[A-Za-z0-9_-]{1,64}`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The skill catalog.
pub struct SkillRegistry {
    dir: PathBuf,
    keys: Arc<KeyStore>,
    scanner: Box<dyn SecurityScanner>,
    audit: Arc<AuditLog>,
    name_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl std::fmt::Debug for SkillRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRegistry")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl SkillRegistry {
    /// Create a registry over `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the directory cannot be created.
    pub fn new(
        dir: impl Into<PathBuf>,
        keys: Arc<KeyStore>,
        scanner: Box<dyn SecurityScanner>,
        audit: Arc<AuditLog>,
    ) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RegistryError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            keys,
            scanner,
            audit,
            name_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Skills directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the source file for `name`.
    pub fn source_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{SOURCE_EXT}"))
    }

    /// Path of the manifest for `name`.
    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{MANIFEST_SUFFIX}"))
    }

    /// Lock guarding the source/manifest pair of `name`. Writers take it
    /// exclusively, verification takes it shared.
    fn name_lock(&self, name: &str) -> Result<Arc<RwLock<()>>, RegistryError> {
        let mut locks = self
            .name_locks
            .lock()
            .map_err(|_| RegistryError::LockPoisoned)?;
        Ok(Arc::clone(
            locks
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        ))
    }

    /// Scan, sign, and store a skill.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::ScanRejected`] when the scan has a disqualifying
    ///   finding (a SECURITY entry is written, nothing is stored).
    /// - [`RegistryError::DuplicateName`] when `name` exists and `overwrite`
    ///   is false.
    /// - [`RegistryError::Key`] when no signing key is loaded.
    pub fn sign_and_register(
        &self,
        source_bytes: &[u8],
        name: &str,
        metadata: SkillMetadata,
        overwrite: bool,
    ) -> Result<SkillManifest, RegistryError> {
        if !is_valid_name(name) {
            return Err(RegistryError::InvalidName(name.to_owned()));
        }

        let lock = self.name_lock(name)?;
        let _guard = lock.write().map_err(|_| RegistryError::LockPoisoned)?;

        let scan = self.scanner.scan(source_bytes);
        if !scan.passed {
            let summary = scan.summary();
            if let Err(e) = self.audit.append(
                AuditRecord::new(AuditLevel::Security, source::SKILL_REGISTRY, "skill_scan_rejected")
                    .detail(format!("skill={name} findings: {summary}"))
                    .outcome("rejected"),
            ) {
                error!(skill = %name, error = %e, "scan rejection not audited");
                return Err(RegistryError::Unaudited {
                    name: name.to_owned(),
                    violation: "scan_rejected".to_owned(),
                    result: None,
                    source: e,
                });
            }
            return Err(RegistryError::ScanRejected {
                name: name.to_owned(),
                summary,
            });
        }

        let manifest_path = self.manifest_path(name);
        if manifest_path.exists() && !overwrite {
            return Err(RegistryError::DuplicateName(name.to_owned()));
        }

        let digest = content_digest(source_bytes);
        let signature = self
            .keys
            .sign(&signing_payload(name, &metadata.version, &digest))?;
        let key_fingerprint = self.keys.fingerprint().ok_or(KeyError::KeyUnavailable)?;

        let manifest = SkillManifest {
            schema_version: MANIFEST_VERSION,
            name: name.to_owned(),
            version: metadata.version,
            description: metadata.description,
            author: metadata.author,
            content_digest: digest,
            signature: hex::encode(signature),
            key_fingerprint,
            created_at: Utc::now(),
            security_scan_result: scan,
        };

        let source_path = self.source_path(name);
        storage::write_atomic(&source_path, source_bytes).map_err(|source| RegistryError::Io {
            path: source_path.clone(),
            source,
        })?;
        let encoded = serde_json::to_vec_pretty(&manifest)?;
        storage::write_atomic(&manifest_path, &encoded).map_err(|source| RegistryError::Io {
            path: manifest_path.clone(),
            source,
        })?;

        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Audit, source::SKILL_REGISTRY, "skill_signed")
                .detail(format!(
                    "skill={name} version={} digest={} key={}{}",
                    manifest.version,
                    manifest.content_digest,
                    manifest.key_fingerprint,
                    if overwrite { " overwrite=true" } else { "" }
                ))
                .outcome("registered"),
        ) {
            warn!(skill = %name, error = %e, "failed to audit log skill signing");
        }
        info!(skill = %name, version = %manifest.version, "skill signed and registered");

        Ok(manifest)
    }

    /// Read the stored manifest for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when no manifest exists.
    pub fn manifest(&self, name: &str) -> Result<SkillManifest, RegistryError> {
        if !is_valid_name(name) {
            return Err(RegistryError::InvalidName(name.to_owned()));
        }
        let path = self.manifest_path(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(name.to_owned()))
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Re-verify `name` against its current on-disk source.
    ///
    /// Untrusted results are SECURITY-logged before returning. Runs
    /// concurrently with other verifications but never alongside a signing
    /// or removal of the same name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unaudited`] (carrying the verdict) when the
    /// skill is untrusted and the SECURITY entry could not be written.
    pub fn verify(&self, name: &str) -> Result<VerificationResult, RegistryError> {
        Ok(self.check(name)?.0)
    }

    /// Verification plus, when trusted, the exact bytes that were hashed.
    #[allow(clippy::type_complexity)]
    fn check(
        &self,
        name: &str,
    ) -> Result<(VerificationResult, Option<(SkillManifest, Vec<u8>)>), RegistryError> {
        let lock = self.name_lock(name)?;
        let outcome = {
            let _guard = lock.read().unwrap_or_else(PoisonError::into_inner);
            match self.evaluate(name) {
                // Another process may be between its source and manifest renames.
                Err((UntrustedReason::DigestMismatch | UntrustedReason::SourceMissing, _)) => {
                    self.evaluate(name)
                }
                other => other,
            }
        };

        match outcome {
            Ok((manifest, source)) => {
                debug!(skill = %name, "skill verified");
                let result = VerificationResult {
                    name: name.to_owned(),
                    status: TrustStatus::Trusted,
                    detail: format!("digest {} signed by {}", manifest.content_digest, manifest.key_fingerprint),
                };
                Ok((result, Some((manifest, source))))
            }
            Err((reason, detail)) => {
                warn!(skill = %name, reason = %reason, "skill failed verification");
                let result = VerificationResult {
                    name: name.to_owned(),
                    status: TrustStatus::Untrusted(reason),
                    detail,
                };
                if let Err(e) = self.audit.append(
                    AuditRecord::new(AuditLevel::Security, source::SKILL_REGISTRY, "skill_untrusted")
                        .detail(format!("skill={name} {}", result.detail))
                        .outcome(reason.as_str()),
                ) {
                    error!(skill = %name, error = %e, "trust violation not audited");
                    return Err(RegistryError::Unaudited {
                        name: name.to_owned(),
                        violation: reason.as_str().to_owned(),
                        result: Some(Box::new(result)),
                        source: e,
                    });
                }
                Ok((result, None))
            }
        }
    }

    fn evaluate(&self, name: &str) -> Result<(SkillManifest, Vec<u8>), (UntrustedReason, String)> {
        if !is_valid_name(name) {
            return Err((
                UntrustedReason::ManifestMissing,
                "invalid skill name".to_owned(),
            ));
        }

        let manifest_bytes = match fs::read(self.manifest_path(name)) {
            Ok(b) => b,
            Err(e) => {
                return Err((
                    UntrustedReason::ManifestMissing,
                    format!("no manifest: {e}"),
                ))
            }
        };
        let manifest: SkillManifest = serde_json::from_slice(&manifest_bytes).map_err(|e| {
            (
                UntrustedReason::SignatureInvalid,
                format!("manifest unreadable: {e}"),
            )
        })?;
        if manifest.name != name {
            return Err((
                UntrustedReason::SignatureInvalid,
                format!("manifest names {:?}", manifest.name),
            ));
        }

        let source = fs::read(self.source_path(name)).map_err(|e| {
            (
                UntrustedReason::SourceMissing,
                format!("source unreadable: {e}"),
            )
        })?;

        let actual = content_digest(&source);
        if actual != manifest.content_digest {
            return Err((
                UntrustedReason::DigestMismatch,
                format!(
                    "expected digest {} found {actual}; source edited after signing",
                    manifest.content_digest
                ),
            ));
        }

        let signature = hex::decode(&manifest.signature).map_err(|e| {
            (
                UntrustedReason::SignatureInvalid,
                format!("signature not hex: {e}"),
            )
        })?;
        let payload = signing_payload(name, &manifest.version, &manifest.content_digest);
        match self.keys.verify(&payload, &signature) {
            Ok(true) => Ok((manifest, source)),
            Ok(false) => Err((
                UntrustedReason::SignatureInvalid,
                format!("signature does not verify (signed by {})", manifest.key_fingerprint),
            )),
            Err(e) => Err((UntrustedReason::SignatureInvalid, e.to_string())),
        }
    }

    /// Names of every skill with a manifest or a source file, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the directory cannot be listed.
    pub fn names(&self) -> Result<Vec<String>, RegistryError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| RegistryError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut names = BTreeSet::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let stem = file_name
                .strip_suffix(MANIFEST_SUFFIX)
                .or_else(|| file_name.strip_suffix(".skill"));
            if let Some(stem) = stem {
                if is_valid_name(stem) {
                    names.insert(stem.to_owned());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Verify every known skill. Never stops at the first failure.
    ///
    /// A verdict whose SECURITY entry could not be written is still reported
    /// as untrusted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the directory cannot be listed, or
    /// [`RegistryError::LockPoisoned`].
    pub fn verify_all(&self) -> Result<Vec<VerificationResult>, RegistryError> {
        let mut results = Vec::new();
        for name in self.names()? {
            match self.verify(&name) {
                Ok(result) => results.push(result),
                Err(RegistryError::Unaudited {
                    result: Some(result),
                    ..
                }) => results.push(*result),
                Err(e) => return Err(e),
            }
        }
        let untrusted = results.iter().filter(|r| !r.is_trusted()).count();
        if let Err(e) = self.audit.append(
            AuditRecord::new(
                if untrusted == 0 {
                    AuditLevel::Info
                } else {
                    AuditLevel::Security
                },
                source::SKILL_REGISTRY,
                "skills_verified",
            )
            .detail(format!("checked={} untrusted={untrusted}", results.len()))
            .outcome(if untrusted == 0 { "all_trusted" } else { "untrusted_found" }),
        ) {
            warn!(error = %e, "failed to audit log skill verification summary");
        }
        Ok(results)
    }

    /// Verify `name` and return a handle over the verified bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UntrustedSkill`] when verification fails, or
    /// [`RegistryError::Unaudited`] when that failure could not be logged.
    pub fn load_for_execution(&self, name: &str) -> Result<ExecutableHandle, RegistryError> {
        let (result, verified) = self.check(name)?;
        let Some((manifest, source)) = verified else {
            let reason = result.reason().unwrap_or(UntrustedReason::ManifestMissing);
            return Err(RegistryError::UntrustedSkill {
                name: name.to_owned(),
                reason,
            });
        };

        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Audit, source::SKILL_REGISTRY, "skill_loaded")
                .detail(format!("skill={name} version={} digest={}", manifest.version, manifest.content_digest))
                .outcome("trusted"),
        ) {
            warn!(skill = %name, error = %e, "failed to audit log skill load");
        }
        Ok(ExecutableHandle {
            name: manifest.name,
            version: manifest.version,
            digest: manifest.content_digest,
            source,
        })
    }

    /// All readable manifests, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<SkillManifest>, RegistryError> {
        let mut manifests = Vec::new();
        for name in self.names()? {
            match self.manifest(&name) {
                Ok(m) => manifests.push(m),
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => warn!(skill = %name, error = %e, "skipping unreadable manifest"),
            }
        }
        Ok(manifests)
    }

    /// Operator removal of a skill's source and manifest.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if neither file exists.
    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        if !is_valid_name(name) {
            return Err(RegistryError::InvalidName(name.to_owned()));
        }
        let lock = self.name_lock(name)?;
        let _guard = lock.write().map_err(|_| RegistryError::LockPoisoned)?;

        let mut removed = 0usize;
        for path in [self.source_path(name), self.manifest_path(name)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = removed.saturating_add(1),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(RegistryError::Io { path, source }),
            }
        }
        if removed == 0 {
            return Err(RegistryError::NotFound(name.to_owned()));
        }

        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditLevel::Audit, source::SKILL_REGISTRY, "skill_removed")
                .detail(format!("skill={name} files_removed={removed}"))
                .outcome("removed"),
        ) {
            warn!(skill = %name, error = %e, "failed to audit log skill removal");
        }
        info!(skill = %name, "skill removed by operator");
        Ok(())
    }
}
