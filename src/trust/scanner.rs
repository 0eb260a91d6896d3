//! Static security scan run over skill source before signing.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Severity of a scan finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth reviewing; does not block signing.
    Medium,
    /// Disqualifying.
    High,
}

/// One match of a scan rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Rule identifier (e.g. `dynamic_eval`).
    pub rule: String,
    /// Severity of the rule.
    pub severity: Severity,
    /// 1-based source line.
    pub line: usize,
    /// Short description of what matched.
    pub message: String,
}

/// Result of scanning one source file; stored in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanReport {
    /// False when any finding is disqualifying.
    pub passed: bool,
    /// All findings, in source order.
    pub findings: Vec<Finding>,
}

impl ScanReport {
    /// Build a report; it passes unless some finding is `High`.
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let passed = !findings.iter().any(|f| f.severity == Severity::High);
        Self { passed, findings }
    }

    /// One line per finding, for audit details and CLI output.
    pub fn summary(&self) -> String {
        if self.findings.is_empty() {
            return "no findings".to_owned();
        }
        self.findings
            .iter()
            .map(|f| format!("[{:?}] {} line {}: {}", f.severity, f.rule, f.line, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Pluggable static analysis over skill source bytes.
pub trait SecurityScanner: Send + Sync {
    /// Scan `source` and report findings.
    fn scan(&self, source: &[u8]) -> ScanReport;
}

struct Rule {
    id: &'static str,
    severity: Severity,
    message: &'static str,
    pattern: Regex,
}

/// Line-oriented regex scanner with a built-in rule set.
pub struct PatternScanner {
    rules: Vec<Rule>,
}

impl std::fmt::Debug for PatternScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternScanner")
            .field("rules", &self.rules.iter().map(|r| r.id).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for PatternScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternScanner {
    /// Scanner with the default rule set.
    pub fn new() -> Self {
        let table: [(&str, Severity, &str, &str); 10] = [
            ("dynamic_eval", Severity::High, "dynamic code evaluation", r"\b(eval|exec)\s*\("),
            ("dynamic_compile", Severity::High, "runtime compilation", r"\bcompile\s*\("),
            ("dynamic_import", Severity::High, "dynamic import", r"__import__\s*\(|importlib\.import_module"),
            ("shell_spawn", Severity::High, "shell command execution", r"os\.system\s*\(|os\.popen\s*\(|subprocess\.\w+\([^)]*shell\s*=\s*True"),
            ("recursive_delete", Severity::High, "recursive delete", r"rm\s+-rf|shutil\.rmtree\s*\("),
            ("unsafe_deserialize", Severity::High, "unsafe deserialization", r"pickle\.loads?\s*\(|marshal\.loads\s*\(|yaml\.load\s*\("),
            ("raw_socket", Severity::Medium, "raw socket use", r"\bsocket\.socket\s*\("),
            ("subprocess", Severity::Medium, "subprocess use", r"\bsubprocess\.(run|call|Popen|check_output)\s*\("),
            ("key_material_access", Severity::High, "access to signing key material", r"signing\.key|\.aether-keys"),
            ("weak_hash", Severity::Low, "weak hash function", r"hashlib\.(md5|sha1)\s*\("),
        ];

        let rules = table
            .into_iter()
            .filter_map(|(id, severity, message, pattern)| {
                Regex::new(pattern).ok().map(|pattern| Rule {
                    id,
                    severity,
                    message,
                    pattern,
                })
            })
            .collect();
        Self { rules }
    }
}

impl SecurityScanner for PatternScanner {
    fn scan(&self, source: &[u8]) -> ScanReport {
        let text = String::from_utf8_lossy(source);
        let mut findings = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                continue;
            }
            for rule in &self.rules {
                if rule.pattern.is_match(line) {
                    findings.push(Finding {
                        rule: rule.id.to_owned(),
                        severity: rule.severity,
                        line: idx.saturating_add(1),
                        message: rule.message.to_owned(),
                    });
                }
            }
        }
        ScanReport::from_findings(findings)
    }
}
