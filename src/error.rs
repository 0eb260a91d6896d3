//! Cross-component error taxonomy.
//!
//! Every component keeps its own `thiserror` enum. This module gives them a
//! shared classification so callers can tell an expected policy outcome from a
//! trust violation or an infrastructure fault, and can print a stable
//! machine-readable reason code next to the human-readable message.

use serde::Serialize;

/// Broad class of a control-plane failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Expected, user-facing refusal (deny or pending confirmation).
    PolicyDenial,
    /// Digest or signature mismatch, unauthorized access. Always SECURITY-logged.
    TrustViolation,
    /// Key unavailable, storage I/O failure.
    ResourceFault,
    /// Malformed configuration, duplicate names, invalid input at the boundary.
    ConfigurationFault,
}

impl ErrorClass {
    /// Returns the snake_case name of the class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyDenial => "policy_denial",
            Self::TrustViolation => "trust_violation",
            Self::ResourceFault => "resource_fault",
            Self::ConfigurationFault => "configuration_fault",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every component error so callers can report it uniformly.
pub trait Classified {
    /// Taxonomy class of this error.
    fn class(&self) -> ErrorClass;

    /// Stable machine-readable reason code (e.g. `digest_mismatch`).
    fn reason_code(&self) -> &'static str;
}

/// Format a classified error as `reason_code: message`.
pub fn describe<E>(err: &E) -> String
where
    E: Classified + std::fmt::Display,
{
    format!("{}: {err}", err.reason_code())
}
