//! Code trust: signing keys, the skill catalog, pre-signing scans, and the
//! runtime that executes verified skills.

pub mod keystore;
pub mod registry;
pub mod runtime;
pub mod scanner;

pub use keystore::{KeyError, KeyInfo, KeyStore};
pub use registry::{
    ExecutableHandle, RegistryError, SkillManifest, SkillMetadata, SkillRegistry, TrustStatus,
    UntrustedReason, VerificationResult,
};
pub use runtime::{ProcessRuntime, RuntimeError, SkillEntry, SkillRuntime};
pub use scanner::{Finding, PatternScanner, ScanReport, SecurityScanner, Severity};
