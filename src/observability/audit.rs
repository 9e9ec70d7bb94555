/// Security event logging for gradebox
/// Structured records of capability denials, kills, deadline reclaims and
/// other events worth keeping an audit trail of.
use crate::config::types::{Result, SandboxError};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;
use uuid::Uuid;

/// Log target used for every security record
pub const SECURITY_TARGET: &str = "security";

/// Security event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of security events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    // Batch lifecycle
    BatchStart,
    BatchEnd,

    // Capability layer
    CapabilityDenied,
    SandboxUnavailable,

    // Deadlines and termination
    WallTimeLimitViolation,
    ForcedKill,
    UnitAbandoned,
    UnitPanicked,

    // Process launch
    LaunchFailure,
}

impl SecurityEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::BatchStart => SecuritySeverity::Low,
            SecurityEventType::BatchEnd => SecuritySeverity::Low,
            SecurityEventType::CapabilityDenied => SecuritySeverity::High,
            SecurityEventType::SandboxUnavailable => SecuritySeverity::Medium,
            SecurityEventType::WallTimeLimitViolation => SecuritySeverity::Medium,
            SecurityEventType::ForcedKill => SecuritySeverity::Medium,
            SecurityEventType::UnitAbandoned => SecuritySeverity::Critical,
            SecurityEventType::UnitPanicked => SecuritySeverity::High,
            SecurityEventType::LaunchFailure => SecuritySeverity::Medium,
        }
    }
}

/// A single security-relevant event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: SystemTime,
    pub details: String,
    /// Identifier of the batch the event belongs to
    pub run_id: Option<Uuid>,
    /// Name of the execution unit (thread) involved
    pub unit: Option<String>,
    pub pid: Option<i32>,
    pub command: Option<String>,
}

impl SecurityEvent {
    /// Create a new security event with default severity
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: SystemTime::now(),
            details,
            run_id: None,
            unit: None,
            pid: None,
            command: None,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_command(mut self, command: String) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }

    /// JSON record written to the audit trail
    pub fn to_record(&self) -> serde_json::Value {
        let mut record = serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });

        if let Some(run_id) = &self.run_id {
            record["run_id"] = serde_json::json!(run_id.to_string());
        }
        if let Some(unit) = &self.unit {
            record["unit"] = serde_json::json!(unit);
        }
        if let Some(pid) = self.pid {
            record["pid"] = serde_json::json!(pid);
        }
        if let Some(command) = &self.command {
            record["command"] = serde_json::json!(command);
        }
        record
    }
}

/// Appends security records to a file in addition to the log
pub struct SecurityLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    pub fn new(audit_path: PathBuf) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Config(format!("Failed to create security log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| {
                SandboxError::Config(format!("Failed to open security audit log: {}", e))
            })?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path,
        })
    }

    fn append(&self, record: &serde_json::Value) {
        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", record) {
                    error!("Failed to write to security audit log: {}", e);
                }
            }
            Err(_) => error!("Failed to acquire lock on security audit file"),
        }
    }

    pub fn audit_path(&self) -> &PathBuf {
        &self.audit_path
    }
}

static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Enable the file-backed audit trail; events are only logged until this is called
pub fn init_security_logger(audit_path: PathBuf) -> Result<()> {
    let logger = SecurityLogger::new(audit_path)?;
    let path = logger.audit_path().clone();
    if SECURITY_LOGGER.set(logger).is_err() {
        warn!("Security logger already initialized");
    } else {
        info!("Security audit trail: {}", path.display());
    }
    Ok(())
}

/// Log a security event and append it to the audit trail if one is configured
pub fn log_security_event(event: SecurityEvent) {
    let record = event.to_record();
    match event.severity {
        SecuritySeverity::Critical | SecuritySeverity::High => {
            error!(target: SECURITY_TARGET, "{}", record)
        }
        SecuritySeverity::Medium => warn!(target: SECURITY_TARGET, "{}", record),
        SecuritySeverity::Low => info!(target: SECURITY_TARGET, "{}", record),
    }

    if let Some(logger) = SECURITY_LOGGER.get() {
        logger.append(&record);
    }
}

pub fn new_run_id() -> Uuid {
    Uuid::new_v4()
}

pub fn batch_start(run_id: Uuid, tasks: usize, max_run_time_ms: u128) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::BatchStart,
            format!("{} tasks, deadline {} ms", tasks, max_run_time_ms),
        )
        .with_run_id(run_id),
    );
}

pub fn batch_end(run_id: Uuid, finished: usize, total: usize) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::BatchEnd,
            format!("{} of {} tasks finished before the deadline", finished, total),
        )
        .with_run_id(run_id),
    );
}

pub fn capability_denied(unit: Option<&str>, operation: &str, reason: &str) {
    let mut event = SecurityEvent::new(
        SecurityEventType::CapabilityDenied,
        format!("Denied {}: {}", operation, reason),
    );
    if let Some(unit) = unit {
        event = event.with_unit(unit);
    }
    log_security_event(event);
}

pub fn sandbox_unavailable(reason: &str) {
    log_security_event(SecurityEvent::new(
        SecurityEventType::SandboxUnavailable,
        format!("Sandbox library unavailable: {}", reason),
    ));
}

pub fn wall_time_limit_violation(run_id: Uuid, unit: &str, limit_ms: u128) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::WallTimeLimitViolation,
            format!("Unit still running at the {} ms deadline", limit_ms),
        )
        .with_run_id(run_id)
        .with_unit(unit),
    );
}

pub fn forced_kill(pid: i32, reason: &str) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::ForcedKill,
            format!("Forced kill: {}", reason),
        )
        .with_pid(pid),
    );
}

pub fn unit_abandoned(run_id: Uuid, unit: &str) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::UnitAbandoned,
            "Unit ignored cancellation past the grace period".to_string(),
        )
        .with_run_id(run_id)
        .with_unit(unit),
    );
}

pub fn unit_panicked(unit: &str, message: &str) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::UnitPanicked,
            format!("Internal error in unit: {}", message),
        )
        .with_unit(unit),
    );
}

pub fn launch_failure(command: &str, error: &str) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::LaunchFailure,
            format!("Could not launch: {}", error),
        )
        .with_command(command.to_string()),
    );
}
