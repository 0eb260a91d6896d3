//! Aether CLI entry point.
//!
//! One-shot operator commands over the control plane (keys, skills, gate
//! checks, kill switch, audit) plus the long-running `heartbeat` daemon.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use aether::audit::index::AuditIndex;
use aether::audit::{self, AuditError, AuditLog};
use aether::config::{Config, ConfigError};
use aether::control::{ControlPlane, SkillOutcome};
use aether::error::{Classified, ErrorClass};
use aether::gate::{ActionKind, ActionRequest, Decision, DenyCode, DenyReason};
use aether::heartbeat::{TaskResult, TaskStatus};
use aether::kill_switch::{KillSwitchError, KillSwitchState, TriggerCause};
use aether::logging;
use aether::trust::{
    KeyError, KeyStore, RegistryError, RuntimeError, SkillEntry, SkillMetadata, TrustStatus,
};

/// Exit code for a refused action.
const EXIT_DENIED: u8 = 2;

/// Exit code for a trust violation.
const EXIT_TRUST_VIOLATION: u8 = 3;

/// Exit code for any other failure.
const EXIT_FAILURE: u8 = 1;

/// Aether: trust and safety control plane for an autonomous agent.
#[derive(Parser)]
#[command(name = "aether", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Generate the signing key pair, or inspect/destroy it.
    Keygen {
        /// Print key information instead of generating.
        #[arg(long)]
        info: bool,
        /// Permanently delete the key pair; pass the current fingerprint.
        #[arg(long, value_name = "FINGERPRINT", conflicts_with = "info")]
        destroy: Option<String>,
    },
    /// Scan, sign, and register a skill; or list/remove registered skills.
    SignSkill {
        /// Skill source file.
        #[arg(long, required_unless_present_any = ["list", "remove"])]
        file: Option<PathBuf>,
        /// Skill name.
        #[arg(long, required_unless_present_any = ["list", "remove"])]
        name: Option<String>,
        /// Skill version.
        #[arg(long, default_value = "1.0.0")]
        version: String,
        /// One-line description.
        #[arg(long, default_value = "")]
        description: String,
        /// Author.
        #[arg(long, default_value = "aether")]
        author: String,
        /// Replace an existing registration.
        #[arg(long)]
        overwrite: bool,
        /// List registered skills.
        #[arg(long, conflicts_with_all = ["file", "name", "remove"])]
        list: bool,
        /// Remove a registered skill.
        #[arg(long, value_name = "NAME", conflicts_with_all = ["file", "name"])]
        remove: Option<String>,
    },
    /// Verify every registered skill.
    VerifySkills,
    /// Run a verified skill through the safety gate.
    RunSkill {
        /// Skill name.
        name: String,
        /// JSON input.
        #[arg(long, default_value = "null")]
        input: String,
        /// Entry point (`run` or `describe`).
        #[arg(long, default_value = "run")]
        entry: String,
    },
    /// Evaluate an action through the safety gate.
    Check {
        /// Action kind (file_write, network, system_command, skill_load,
        /// skill_execute, read_only, memory_write).
        kind: String,
        /// What the action targets.
        payload: String,
    },
    /// Operate the kill switch.
    KillSwitch {
        /// Arm monitoring.
        #[arg(long, group = "op")]
        arm: bool,
        /// Reset a triggered switch (interactive challenge).
        #[arg(long, group = "op")]
        reset: bool,
        /// Trigger the switch.
        #[arg(
            long,
            group = "op",
            value_name = "CAUSE",
            num_args = 0..=1,
            default_missing_value = "explicit_stop_command"
        )]
        trigger: Option<String>,
        /// Detail recorded with a trigger.
        #[arg(long, requires = "trigger", default_value = "operator request")]
        details: String,
        /// Print state and cause history.
        #[arg(long, group = "op")]
        status: bool,
    },
    /// Run the heartbeat loop, or a single pass.
    Heartbeat {
        /// Run every enabled task once and exit.
        #[arg(long)]
        run_once: bool,
        /// Run one named task and exit.
        #[arg(long, value_name = "NAME", conflicts_with = "run_once")]
        task: Option<String>,
    },
    /// Inspect the audit log.
    Audit {
        /// Show the last N entries.
        #[arg(long, value_name = "N")]
        recent: Option<usize>,
        /// Search the audit index.
        #[arg(long, value_name = "QUERY")]
        search: Option<String>,
        /// Verify the hash chain.
        #[arg(long)]
        verify: bool,
    },
    /// Show control-plane status.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => report_error(&e),
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load().context("failed to load configuration")?;

    // The daemon installs its own file logging.
    let daemon = matches!(
        cli.command,
        Command::Heartbeat {
            run_once: false,
            task: None
        }
    );
    if !daemon {
        logging::init_cli(&config.logging.level);
    }

    match cli.command {
        Command::Keygen { info, destroy } => handle_keygen(&config, info, destroy),
        Command::SignSkill {
            file,
            name,
            version,
            description,
            author,
            overwrite,
            list,
            remove,
        } => {
            let plane = ControlPlane::open(config)?;
            if list {
                handle_list_skills(&plane)
            } else if let Some(name) = remove {
                plane.registry.remove(&name)?;
                println!("removed skill {name}");
                Ok(ExitCode::SUCCESS)
            } else {
                let file = file.context("--file is required")?;
                let name = name.context("--name is required")?;
                let metadata = SkillMetadata {
                    version,
                    description,
                    author,
                };
                handle_sign_skill(&plane, &file, &name, metadata, overwrite)
            }
        }
        Command::VerifySkills => handle_verify_skills(&ControlPlane::open(config)?),
        Command::RunSkill { name, input, entry } => {
            handle_run_skill(&ControlPlane::open(config)?, &name, &input, &entry).await
        }
        Command::Check { kind, payload } => {
            handle_check(&ControlPlane::open(config)?, &kind, &payload)
        }
        Command::KillSwitch {
            arm,
            reset,
            trigger,
            details,
            status: _,
        } => {
            let plane = ControlPlane::open(config)?;
            if arm {
                plane.kill_switch.arm()?;
                println!("kill switch ARMED");
                Ok(ExitCode::SUCCESS)
            } else if reset {
                handle_reset(&plane)
            } else if let Some(cause) = trigger {
                handle_trigger(&plane, &cause, &details)
            } else {
                print_kill_switch(&plane)?;
                Ok(ExitCode::SUCCESS)
            }
        }
        Command::Heartbeat { run_once, task } => handle_heartbeat(config, run_once, task).await,
        Command::Audit {
            recent,
            search,
            verify,
        } => handle_audit(&config, recent, search, verify).await,
        Command::Status => handle_status(&ControlPlane::open(config)?),
    }
}

/// Class and reason code of the first component error in the chain.
fn classify(err: &anyhow::Error) -> Option<(ErrorClass, &'static str)> {
    fn of<E: Classified>(e: &E) -> (ErrorClass, &'static str) {
        (e.class(), e.reason_code())
    }

    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<RegistryError>() {
            Some(of(e))
        } else if let Some(e) = cause.downcast_ref::<KeyError>() {
            Some(of(e))
        } else if let Some(e) = cause.downcast_ref::<KillSwitchError>() {
            Some(of(e))
        } else if let Some(e) = cause.downcast_ref::<AuditError>() {
            Some(of(e))
        } else if let Some(e) = cause.downcast_ref::<ConfigError>() {
            Some(of(e))
        } else {
            cause.downcast_ref::<RuntimeError>().map(of)
        }
    })
}

/// Print an error with its reason code and map its class to an exit code.
fn report_error(err: &anyhow::Error) -> ExitCode {
    let classified = classify(err);

    match classified {
        Some((class, code)) => {
            eprintln!("error [{code}]: {err:#}");
            match class {
                ErrorClass::PolicyDenial => ExitCode::from(EXIT_DENIED),
                ErrorClass::TrustViolation => ExitCode::from(EXIT_TRUST_VIOLATION),
                ErrorClass::ResourceFault | ErrorClass::ConfigurationFault => {
                    ExitCode::from(EXIT_FAILURE)
                }
            }
        }
        None => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Print a denial and map it to an exit code.
fn report_denial(reason: &DenyReason) -> ExitCode {
    eprintln!("DENIED [{}]: {}", reason.code, reason.explanation);
    if reason.code.is_trust_violation() || reason.code == DenyCode::KillSwitchTriggered {
        ExitCode::from(EXIT_TRUST_VIOLATION)
    } else {
        ExitCode::from(EXIT_DENIED)
    }
}

/// Ask a yes/no question on stderr and read the answer from stdin.
/// End of input counts as "no".
fn confirm(question: &str) -> anyhow::Result<bool> {
    let answer = prompt(&format!("{question} [y/N] "))?;
    Ok(matches!(answer.as_str(), "y" | "Y" | "yes" | "YES"))
}

fn prompt(text: &str) -> anyhow::Result<String> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{text}")?;
    stderr.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_owned())
}

fn handle_keygen(
    config: &Config,
    show_info: bool,
    destroy: Option<String>,
) -> anyhow::Result<ExitCode> {
    let paths = config.runtime_paths()?;
    let audit = Arc::new(AuditLog::open(&paths.audit_log)?);
    let mut keys = KeyStore::open(&paths.key_dir, audit)?;

    if let Some(fingerprint) = destroy {
        if !confirm("This deletes the signing key; every existing signature becomes unverifiable. Continue?")? {
            println!("aborted");
            return Ok(ExitCode::from(EXIT_DENIED));
        }
        keys.destroy(&fingerprint)?;
        println!("signing key destroyed");
        return Ok(ExitCode::SUCCESS);
    }

    if show_info {
        match keys.info() {
            Some(info) => {
                println!("fingerprint: {}", info.fingerprint);
                println!("public key:  {}", info.public_key_path.display());
                if let Some(created) = info.created_at {
                    println!("created:     {}", created.to_rfc3339());
                }
                println!("can sign:    {}", info.can_sign);
            }
            None => println!("no signing key in {}", paths.key_dir.display()),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let info = keys.generate()?;
    println!("generated signing key {}", info.fingerprint);
    println!("public key: {}", info.public_key_path.display());
    Ok(ExitCode::SUCCESS)
}

fn handle_sign_skill(
    plane: &ControlPlane,
    file: &std::path::Path,
    name: &str,
    metadata: SkillMetadata,
    overwrite: bool,
) -> anyhow::Result<ExitCode> {
    let source = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    match plane
        .registry
        .sign_and_register(&source, name, metadata, overwrite)
    {
        Ok(manifest) => {
            println!(
                "signed {} v{} digest={} key={}",
                manifest.name, manifest.version, manifest.content_digest, manifest.key_fingerprint
            );
            for finding in &manifest.security_scan_result.findings {
                println!(
                    "  note: line {} {} ({:?}): {}",
                    finding.line, finding.rule, finding.severity, finding.message
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ RegistryError::ScanRejected { .. }) => {
            eprintln!("REJECTED [{}]: {e}", e.reason_code());
            Ok(ExitCode::from(EXIT_TRUST_VIOLATION))
        }
        Err(e) => Err(e.into()),
    }
}

fn handle_list_skills(plane: &ControlPlane) -> anyhow::Result<ExitCode> {
    let manifests = plane.registry.list()?;
    if manifests.is_empty() {
        println!("no skills registered");
    }
    for m in manifests {
        println!(
            "{:<24} v{:<10} {}  {}",
            m.name,
            m.version,
            m.created_at.format("%Y-%m-%d %H:%M"),
            m.description
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_verify_skills(plane: &ControlPlane) -> anyhow::Result<ExitCode> {
    let results = plane.registry.verify_all()?;
    let mut untrusted = 0usize;
    for result in &results {
        match &result.status {
            TrustStatus::Trusted => println!("trusted    {}", result.name),
            TrustStatus::Untrusted(reason) => {
                untrusted = untrusted.saturating_add(1);
                println!("UNTRUSTED  {} [{reason}] {}", result.name, result.detail);
            }
        }
    }
    println!("{} skills checked, {untrusted} untrusted", results.len());
    Ok(if untrusted == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_TRUST_VIOLATION)
    })
}

async fn handle_run_skill(
    plane: &ControlPlane,
    name: &str,
    input: &str,
    entry: &str,
) -> anyhow::Result<ExitCode> {
    let input: serde_json::Value =
        serde_json::from_str(input).context("--input must be valid JSON")?;
    let entry = SkillEntry::parse(entry)
        .with_context(|| format!("unknown entry point {entry:?}; use run or describe"))?;

    let mut outcome = plane
        .execute_skill(name, entry, input.clone(), "cli", None)
        .await?;
    if let SkillOutcome::NeedsConfirmation { token, expires_at } = &outcome {
        eprintln!(
            "running skill {name} requires confirmation (token {token}, expires {})",
            expires_at.to_rfc3339()
        );
        if !confirm("Approve?")? {
            eprintln!("not approved");
            return Ok(ExitCode::from(EXIT_DENIED));
        }
        outcome = plane
            .execute_skill(name, entry, input, "cli", Some(token.clone()))
            .await?;
    }

    match outcome {
        SkillOutcome::Completed(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        SkillOutcome::Denied(reason) => Ok(report_denial(&reason)),
        SkillOutcome::NeedsConfirmation { .. } => Ok(ExitCode::from(EXIT_DENIED)),
    }
}

fn handle_check(plane: &ControlPlane, kind: &str, payload: &str) -> anyhow::Result<ExitCode> {
    let kind = ActionKind::parse(kind).with_context(|| format!("unknown action kind {kind:?}"))?;
    let request = ActionRequest::new(kind, payload, "cli");

    let mut decision = plane.gate.evaluate(&request);
    if let Decision::RequireConfirmation { token, expires_at } = &decision {
        eprintln!(
            "{kind} {payload} requires confirmation (token {token}, expires {})",
            expires_at.to_rfc3339()
        );
        if !confirm("Approve?")? {
            eprintln!("not approved");
            return Ok(ExitCode::from(EXIT_DENIED));
        }
        decision = plane.gate.evaluate(&request.clone().with_confirmation(token.clone()));
    }

    match decision {
        Decision::Allow => {
            println!("ALLOW {kind} {payload}");
            Ok(ExitCode::SUCCESS)
        }
        Decision::Deny(reason) => Ok(report_denial(&reason)),
        Decision::RequireConfirmation { .. } => Ok(ExitCode::from(EXIT_DENIED)),
    }
}

fn handle_reset(plane: &ControlPlane) -> anyhow::Result<ExitCode> {
    print_kill_switch(plane)?;
    let challenge = plane.kill_switch.reset_challenge()?;
    eprintln!(
        "reset challenge: {} (expires {})",
        challenge.code,
        challenge.expires_at.to_rfc3339()
    );
    let answer = prompt("Type the challenge code to reset: ")?;
    plane.kill_switch.request_reset(&answer)?;
    println!("kill switch reset; state is ARMED");
    Ok(ExitCode::SUCCESS)
}

fn handle_trigger(plane: &ControlPlane, cause: &str, details: &str) -> anyhow::Result<ExitCode> {
    let cause = TriggerCause::parse(cause).with_context(|| {
        let known: Vec<_> = TriggerCause::ALL.iter().map(TriggerCause::as_str).collect();
        format!("unknown cause {cause:?}; expected one of {}", known.join(", "))
    })?;
    if plane.kill_switch.trigger(cause, details)? {
        println!("kill switch TRIGGERED ({cause})");
    } else {
        println!("kill switch already halted; trigger recorded as duplicate");
    }
    Ok(ExitCode::SUCCESS)
}

fn print_kill_switch(plane: &ControlPlane) -> anyhow::Result<()> {
    let status = plane.kill_switch.status()?;
    println!("kill switch: {}", status.state.as_str().to_uppercase());
    for cause in &status.active_causes {
        println!(
            "  cause: {} at {} ({})",
            cause.cause,
            cause.at.to_rfc3339(),
            cause.detail
        );
    }
    println!("  total triggers: {}", status.total_triggers);
    if let Some(reset) = &status.last_reset {
        println!(
            "  last reset: {} ({} causes cleared)",
            reset.at.to_rfc3339(),
            reset.causes_cleared
        );
    }
    Ok(())
}

fn print_results(results: &[TaskResult]) -> bool {
    let mut all_ok = true;
    for r in results {
        let label = match r.status {
            TaskStatus::Succeeded => "ok",
            TaskStatus::Failed => "FAILED",
            TaskStatus::TimedOut => "TIMEOUT",
            TaskStatus::Skipped => "skipped",
        };
        if matches!(r.status, TaskStatus::Failed | TaskStatus::TimedOut) {
            all_ok = false;
        }
        println!(
            "{label:<8} {:<22} {:>6}ms  {}",
            r.name,
            r.duration.as_millis(),
            r.message
        );
    }
    all_ok
}

async fn handle_heartbeat(
    config: Config,
    run_once: bool,
    task: Option<String>,
) -> anyhow::Result<ExitCode> {
    if run_once || task.is_some() {
        let plane = ControlPlane::open(config)?;
        let scheduler = plane.scheduler().await?;
        let results = match task {
            Some(name) => vec![scheduler.run_task(&name).await?],
            None => scheduler.run_once().await?,
        };
        let all_ok = print_results(&results);
        return Ok(if plane.kill_switch.is_triggered() {
            eprintln!("kill switch is TRIGGERED");
            ExitCode::from(EXIT_TRUST_VIOLATION)
        } else if all_ok {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(EXIT_FAILURE)
        });
    }

    let paths = config.runtime_paths()?;
    let _logging_guard = logging::init_daemon(&paths.logs_dir, &config.logging.level)?;
    let plane = ControlPlane::open(config)?;
    plane.ensure_armed()?;
    if plane.kill_switch.state() == KillSwitchState::Triggered {
        eprintln!("kill switch is TRIGGERED; reset it before starting the heartbeat");
        return Ok(ExitCode::from(EXIT_TRUST_VIOLATION));
    }

    let scheduler = plane.scheduler().await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let shared = plane.config.clone();
    let audit = Arc::clone(&plane.audit);
    tokio::spawn(async move {
        wait_for_signals(shared, audit).await;
        let _ = shutdown_tx.send(true);
    });

    info!(root = %plane.paths.root.display(), "heartbeat daemon started");
    scheduler.run(shutdown_rx).await?;

    Ok(if plane.kill_switch.is_triggered() {
        ExitCode::from(EXIT_TRUST_VIOLATION)
    } else {
        ExitCode::SUCCESS
    })
}

/// Reload config on SIGHUP; return on SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_signals(shared: aether::config::SharedConfig, audit: Arc<AuditLog>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut hup), Ok(mut term)) = (
        signal(SignalKind::hangup()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("failed to install signal handlers; only ctrl-c will stop the heartbeat");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = term.recv() => return,
            _ = hup.recv() => {
                match Config::load() {
                    Ok(next) => match shared.reload(next, &audit) {
                        Ok(changes) => info!(changes = changes.len(), "configuration reloaded"),
                        Err(e) => warn!(error = %e, "configuration reload rejected"),
                    },
                    Err(e) => warn!(error = %e, "configuration reload rejected"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_shared: aether::config::SharedConfig, _audit: Arc<AuditLog>) {
    let _ = tokio::signal::ctrl_c().await;
}

async fn handle_audit(
    config: &Config,
    recent: Option<usize>,
    search: Option<String>,
    verify: bool,
) -> anyhow::Result<ExitCode> {
    let paths = config.runtime_paths()?;

    if verify {
        let report = audit::verify_chain(&paths.audit_log)?;
        return Ok(match &report.first_break {
            None => {
                println!("audit chain intact: {} entries", report.entries);
                ExitCode::SUCCESS
            }
            Some(brk) => {
                println!(
                    "AUDIT CHAIN BROKEN after {} intact entries: {brk}",
                    report.entries
                );
                ExitCode::from(EXIT_TRUST_VIOLATION)
            }
        });
    }

    if let Some(query) = search {
        let index = AuditIndex::open(&paths.audit_index).await?;
        index.sync(&paths.audit_log).await?;
        let hits = index.search(&query, 50).await?;
        for hit in &hits {
            println!(
                "#{} [{}] [{}] [{}] [{}] - {}{}",
                hit.seq,
                hit.timestamp,
                hit.level,
                hit.source,
                hit.action,
                hit.detail,
                hit.outcome
                    .as_deref()
                    .map(|o| format!(" => {o}"))
                    .unwrap_or_default()
            );
        }
        println!("{} matches", hits.len());
        index.close().await;
        return Ok(ExitCode::SUCCESS);
    }

    for entry in audit::recent(&paths.audit_log, recent.unwrap_or(20))? {
        println!("#{} {}", entry.seq, entry.render());
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_status(plane: &ControlPlane) -> anyhow::Result<ExitCode> {
    print_kill_switch(plane)?;

    match plane.keys.info() {
        Some(info) => println!("signing key: {} (can sign: {})", info.fingerprint, info.can_sign),
        None => println!("signing key: none (run `aether keygen`)"),
    }

    let skills = plane.registry.list()?;
    println!("skills registered: {}", skills.len());
    println!("audit next seq: {}", plane.audit.next_seq()?);
    println!("root: {}", plane.paths.root.display());

    match std::fs::read_to_string(&plane.paths.health_report) {
        Ok(json) => match serde_json::from_str::<aether::heartbeat::HealthReport>(&json) {
            Ok(h) => {
                let disk = h
                    .disk_percent
                    .map_or_else(|| "n/a".to_owned(), |d| format!("{d:.1}%"));
                println!(
                    "last health sample: {} cpu {:.1}% memory {:.1}% ({}MB available) disk {disk}",
                    h.timestamp, h.cpu_percent, h.memory_percent, h.memory_available_mb
                );
                if !h.anomalies.is_empty() {
                    println!("anomalies: {}", h.anomalies.join("; "));
                }
            }
            Err(e) => warn!(error = %e, "unreadable health report"),
        },
        Err(_) => println!("last health sample: none"),
    }
    Ok(ExitCode::SUCCESS)
}
