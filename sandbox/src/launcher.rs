//! Child-side process setup: apply redirections and resource limits,
//! request tracing of the calling process, then replace its image with the
//! target executable.
//!
//! Runs after `fork`, in the child. Nothing here may assume the parent's
//! threads, locks or buffers are in any particular state.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use nix::sys::ptrace;
use nix::unistd;

use crate::rlimits::{self, Resource, ResourceLimit};
use crate::{ExecConfig, Result};

/// Exit status the child uses to report a setup failure that happened
/// before `execve` ever ran. Picked out of the conventional shell
/// reserved range (126-165) so it cannot be confused with a target
/// program's own exit code.
pub(crate) const LAUNCH_FAILURE_EXIT_CODE: i32 = 127;

/// Transform the calling (forked) process into a traced copy of `path`,
/// with the limits and redirections in `cfg` applied. Never returns: on
/// success `execve` replaces the image; on failure the child exits with
/// [`LAUNCH_FAILURE_EXIT_CODE`].
///
/// A plain `exit` is used here rather than a self-sent signal: `traceme`
/// below has already run by the time most failures can occur, and
/// `ptrace(2)` turns any signal other than `SIGKILL` delivered to a
/// traced process into a signal-delivery-stop that the tracer must
/// explicitly re-inject, not a real termination. An ordinary process
/// exit carries no such ambiguity — it reaches the supervisor as a plain
/// `WIFEXITED` the first time it waits, before the main ptrace loop ever
/// starts.
pub(crate) fn exec_child(path: &str, cfg: &ExecConfig) -> ! {
    if let Err(e) = try_exec_child(path, cfg) {
        log::error!("sandbox launcher failed for {}: {}", path, e);
    }

    std::process::exit(LAUNCH_FAILURE_EXIT_CODE);
}

fn try_exec_child(path: &str, cfg: &ExecConfig) -> Result<()> {
    redirect(cfg.stdin_fd, libc::STDIN_FILENO)?;
    redirect(cfg.stdout_fd, libc::STDOUT_FILENO)?;

    if cfg.memory_limit > 0 {
        rlimits::setrlimit_hard(Resource::DataSegment, cfg.memory_limit)?;
        rlimits::setrlimit_hard(Resource::AddressSpace, cfg.memory_limit.saturating_mul(2))?;
    }

    if cfg.time_limit > 0 {
        // Soft and hard limits must differ: the kernel only ever raises
        // SIGXCPU when cpu time exceeds the soft limit while still under the
        // hard one. A soft limit equal to the hard limit reaches the hard
        // check first and goes straight to SIGKILL, which the supervisor
        // cannot tell apart from any other fatal signal. The hard limit one
        // second above the soft one keeps SIGKILL as a backstop if the
        // tracee somehow survives SIGXCPU.
        rlimits::setrlimit(Resource::CPUTime, &ResourceLimit {
            soft_limit: cfg.time_limit,
            hard_limit: cfg.time_limit + 1,
        })?;
    }

    ptrace::traceme()?;

    let native_path = CString::new(path)
        .map_err(|_| crate::Error::from(crate::ErrorKind::InvalidProcessArgument(path.to_owned())))?;
    let argv = [native_path.clone()];
    let envp = inherited_env();
    unistd::execve(&native_path, &argv, &envp)?;

    unreachable!("execve only returns on failure, which is surfaced as an Err above")
}

fn redirect(from: RawFd, to: RawFd) -> Result<()> {
    unistd::dup2(from, to)?;
    Ok(())
}

fn inherited_env() -> Vec<CString> {
    std::env::vars()
        .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
        .collect()
}
