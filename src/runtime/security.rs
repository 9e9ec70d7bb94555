//! Capability restriction for untrusted execution units
//!
//! Untrusted code never touches the host directly: every sensitive
//! operation is requested through its `TaskContext` (or the free `check`
//! function) and vetted by a `CapabilityPolicy`. Threads running task
//! units are tagged as members of the untrusted group; other threads are
//! not restricted.

use crate::observability::audit;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// A fine-grained permission request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Permission family, e.g. `property`, `reflect`, `file`
    pub kind: String,
    pub name: String,
    /// Requested actions, comma separated (`read`, `write`, ...)
    pub actions: String,
}

impl Permission {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, actions: impl Into<String>) -> Self {
        Permission {
            kind: kind.into(),
            name: name.into(),
            actions: actions.into(),
        }
    }

    fn has_action(&self, action: &str) -> bool {
        self.actions.split(',').any(|a| a.trim() == action)
    }
}

/// Operations untrusted code can ask the host for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Modify or interrupt another thread
    ThreadAccess,
    /// Modify a thread group
    ThreadGroupAccess,
    /// Terminate the hosting process
    Exit(i32),
    /// Spawn a host process
    Exec(String),
    Permission(Permission),
    CreateClassLoader,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ThreadAccess => write!(f, "thread access"),
            Operation::ThreadGroupAccess => write!(f, "thread group access"),
            Operation::Exit(code) => write!(f, "exit({})", code),
            Operation::Exec(cmd) => write!(f, "exec({})", cmd),
            Operation::Permission(p) => write!(f, "permission {}/{} [{}]", p.kind, p.name, p.actions),
            Operation::CreateClassLoader => write!(f, "create class loader"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SecurityViolation {
    #[error("Cannot access Thread")]
    ThreadAccess,

    #[error("Cannot access ThreadGroup")]
    ThreadGroupAccess,

    #[error("Untrusted code should not request process exit (status {0})")]
    Exit(i32),

    #[error("Untrusted code cannot execute commands: {0}")]
    Exec(String),

    #[error("Untrusted code does not have permission: {kind}/{name}")]
    Permission { kind: String, name: String },
}

impl SecurityViolation {
    fn for_operation(op: &Operation) -> Option<Self> {
        match op {
            Operation::ThreadAccess => Some(SecurityViolation::ThreadAccess),
            Operation::ThreadGroupAccess => Some(SecurityViolation::ThreadGroupAccess),
            Operation::Exit(code) => Some(SecurityViolation::Exit(*code)),
            Operation::Exec(cmd) => Some(SecurityViolation::Exec(cmd.clone())),
            Operation::Permission(p) => Some(SecurityViolation::Permission {
                kind: p.kind.clone(),
                name: p.name.clone(),
            }),
            Operation::CreateClassLoader => None,
        }
    }
}

/// Decides whether an operation is allowed
pub trait CapabilityPolicy: Send + Sync {
    /// `untrusted` is true when the requester belongs to the untrusted group
    fn check(&self, op: &Operation, untrusted: bool) -> Result<(), SecurityViolation>;

    fn name(&self) -> &str;
}

/// Denies everything to the untrusted group except a fixed allow-list
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupPolicy;

impl GroupPolicy {
    /// Permissions the runtime itself needs while executing untrusted code
    pub fn allows_permission(&self, permission: &Permission) -> bool {
        match permission.name.as_str() {
            "line.separator" => permission.has_action("read"),
            "accessDeclaredMembers" | "suppressAccessChecks" => true,
            _ => false,
        }
    }
}

impl CapabilityPolicy for GroupPolicy {
    fn check(&self, op: &Operation, untrusted: bool) -> Result<(), SecurityViolation> {
        match op {
            Operation::CreateClassLoader => Ok(()),
            Operation::Permission(p) if self.allows_permission(p) => Ok(()),
            _ if !untrusted => Ok(()),
            _ => match SecurityViolation::for_operation(op) {
                Some(violation) => Err(violation),
                None => Ok(()),
            },
        }
    }

    fn name(&self) -> &str {
        "group"
    }
}

/// Group policy plus extra permission names needed by one language runtime.
///
/// Only `Permission` requests can be widened; exit, exec and thread access
/// stay denied for untrusted units.
#[derive(Clone, Debug, Default)]
pub struct ExtendedPolicy {
    base: GroupPolicy,
    extra_permissions: BTreeSet<String>,
    name: String,
}

impl ExtendedPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        ExtendedPolicy {
            base: GroupPolicy,
            extra_permissions: BTreeSet::new(),
            name: name.into(),
        }
    }

    pub fn allow_permission(mut self, name: impl Into<String>) -> Self {
        self.extra_permissions.insert(name.into());
        self
    }
}

impl CapabilityPolicy for ExtendedPolicy {
    fn check(&self, op: &Operation, untrusted: bool) -> Result<(), SecurityViolation> {
        if let Operation::Permission(p) = op {
            if self.extra_permissions.contains(&p.name) {
                return Ok(());
            }
        }
        self.base.check(op, untrusted)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

thread_local! {
    static UNTRUSTED: Cell<bool> = const { Cell::new(false) };
}

/// Tag the calling thread as a member of the untrusted group. Irreversible.
pub fn join_untrusted_group() {
    UNTRUSTED.with(|flag| flag.set(true));
}

pub fn is_untrusted_thread() -> bool {
    UNTRUSTED.with(|flag| flag.get())
}

static INSTALLED: OnceLock<Arc<dyn CapabilityPolicy>> = OnceLock::new();

/// Install the process-wide policy; later installs keep the first one
pub fn install(policy: Arc<dyn CapabilityPolicy>) -> Arc<dyn CapabilityPolicy> {
    let mut fresh = false;
    let installed = INSTALLED.get_or_init(|| {
        fresh = true;
        policy.clone()
    });
    if fresh {
        info!("Capability policy '{}' installed", installed.name());
    } else {
        debug!(
            "Capability policy '{}' already installed, ignoring '{}'",
            installed.name(),
            policy.name()
        );
    }
    installed.clone()
}

pub fn install_default() -> Arc<dyn CapabilityPolicy> {
    install(Arc::new(GroupPolicy))
}

pub fn is_installed() -> bool {
    INSTALLED.get().is_some()
}

pub fn installed_policy() -> Option<Arc<dyn CapabilityPolicy>> {
    INSTALLED.get().cloned()
}

/// Check `op` with `policy`, logging denials to the audit trail
pub fn enforce(
    policy: &dyn CapabilityPolicy,
    op: &Operation,
    untrusted: bool,
    unit: Option<&str>,
) -> Result<(), SecurityViolation> {
    policy.check(op, untrusted).map_err(|violation| {
        audit::capability_denied(unit, &op.to_string(), &violation.to_string());
        violation
    })
}

/// Check `op` for the calling thread against the installed policy.
/// Everything is allowed until a policy is installed.
pub fn check(op: &Operation) -> Result<(), SecurityViolation> {
    match INSTALLED.get() {
        Some(policy) => {
            let current = std::thread::current();
            enforce(policy.as_ref(), op, is_untrusted_thread(), current.name())
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property_read(name: &str) -> Operation {
        Operation::Permission(Permission::new("property", name, "read"))
    }

    #[test]
    fn test_untrusted_denials() {
        let policy = GroupPolicy;
        assert_eq!(
            policy.check(&Operation::Exit(0), true),
            Err(SecurityViolation::Exit(0))
        );
        assert_eq!(
            policy.check(&Operation::Exec("/bin/sh".into()), true),
            Err(SecurityViolation::Exec("/bin/sh".into()))
        );
        assert_eq!(
            policy.check(&Operation::ThreadAccess, true),
            Err(SecurityViolation::ThreadAccess)
        );
        assert_eq!(
            policy.check(&Operation::ThreadGroupAccess, true),
            Err(SecurityViolation::ThreadGroupAccess)
        );
        assert!(policy.check(&property_read("user.home"), true).is_err());
    }

    #[test]
    fn test_allow_list() {
        let policy = GroupPolicy;
        assert!(policy.check(&property_read("line.separator"), true).is_ok());
        assert!(policy
            .check(
                &Operation::Permission(Permission::new("property", "line.separator", "write")),
                true
            )
            .is_err());
        assert!(policy
            .check(
                &Operation::Permission(Permission::new("reflect", "suppressAccessChecks", "")),
                true
            )
            .is_ok());
        assert!(policy
            .check(
                &Operation::Permission(Permission::new("runtime", "accessDeclaredMembers", "")),
                true
            )
            .is_ok());
        assert!(policy.check(&Operation::CreateClassLoader, true).is_ok());
    }

    #[test]
    fn test_trusted_threads_unaffected() {
        let policy = GroupPolicy;
        assert!(policy.check(&Operation::Exit(1), false).is_ok());
        assert!(policy.check(&Operation::Exec("ls".into()), false).is_ok());
    }

    #[test]
    fn test_extended_policy_only_widens_permissions() {
        let policy = ExtendedPolicy::new("python").allow_permission("getenv.PYTHONPATH");
        assert!(policy
            .check(
                &Operation::Permission(Permission::new("runtime", "getenv.PYTHONPATH", "")),
                true
            )
            .is_ok());
        assert!(policy.check(&Operation::Exit(0), true).is_err());
        assert!(policy.check(&Operation::ThreadAccess, true).is_err());
        assert!(policy.check(&property_read("line.separator"), true).is_ok());
        assert_eq!(policy.name(), "python");
    }

    #[test]
    fn test_install_is_idempotent() {
        let first = install_default();
        let second = install(Arc::new(ExtendedPolicy::new("other")));
        assert!(is_installed());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_group_membership_is_per_thread() {
        install_default();
        let handle = std::thread::spawn(|| {
            join_untrusted_group();
            check(&Operation::Exit(3))
        });
        assert_eq!(handle.join().unwrap(), Err(SecurityViolation::Exit(3)));
        assert!(!is_untrusted_thread());
        assert!(check(&Operation::Exit(3)).is_ok());
    }
}
