//! Resource limits applied in the child between fork and exec
use crate::config::limits::CommandLimit;
use nix::sys::resource::{setrlimit, Resource};

/// The rlimit resource and the raw value for a wrapper limit
pub fn rlimit_for(limit: CommandLimit, value: i64) -> Option<(Resource, libc::rlim_t)> {
    let value = u64::try_from(value).ok()?;
    let kb = |v: u64| v.saturating_mul(1024) as libc::rlim_t;
    match limit {
        CommandLimit::FileSizeKb => Some((Resource::RLIMIT_FSIZE, kb(value))),
        CommandLimit::StackSizeKb => Some((Resource::RLIMIT_STACK, kb(value))),
        CommandLimit::CpuTimeSec => Some((Resource::RLIMIT_CPU, value as libc::rlim_t)),
        CommandLimit::Processes => Some((Resource::RLIMIT_NPROC, value as libc::rlim_t)),
        CommandLimit::VmSizeKb => Some((Resource::RLIMIT_AS, kb(value))),
        _ => None,
    }
}

/// Resolve limits ahead of fork so the child only makes syscalls
pub fn resolve(limits: &[(CommandLimit, i64)]) -> Vec<(Resource, libc::rlim_t)> {
    limits
        .iter()
        .filter_map(|(limit, value)| rlimit_for(*limit, *value))
        .collect()
}

/// Apply resolved limits to the calling process (soft and hard).
///
/// Async-signal-safe: no allocation, only setrlimit(2).
pub fn apply(resolved: &[(Resource, libc::rlim_t)]) -> nix::Result<()> {
    for (resource, value) in resolved {
        setrlimit(*resource, *value, *value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::limits::parse_wrapper_flags;

    #[test]
    fn test_kb_limits_are_scaled() {
        assert_eq!(
            rlimit_for(CommandLimit::VmSizeKb, 32768),
            Some((Resource::RLIMIT_AS, 32768 * 1024))
        );
        assert_eq!(
            rlimit_for(CommandLimit::CpuTimeSec, 10),
            Some((Resource::RLIMIT_CPU, 10))
        );
    }

    #[test]
    fn test_non_wrapper_and_negative_limits_skipped() {
        assert_eq!(rlimit_for(CommandLimit::OutputMaxLines, 50), None);
        assert_eq!(rlimit_for(CommandLimit::FileSizeKb, -1), None);
    }

    #[test]
    fn test_resolve_default_flags() {
        let resolved = resolve(&parse_wrapper_flags("-f0 -s128 -t10 -u0 -v32768"));
        assert_eq!(resolved.len(), 5);
        assert_eq!(resolved[0], (Resource::RLIMIT_FSIZE, 0));
    }
}
