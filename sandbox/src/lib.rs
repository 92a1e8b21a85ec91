//! Single-process ptrace execution sandbox for running untrusted executables
//! (contest or coursework submissions) under strict time, memory and
//! syscall policies, and reporting a categorized outcome.
//!
//! The crate is three cooperating pieces:
//!
//! * [`launcher`] — the child-side setup that installs resource limits,
//!   redirects standard streams, requests tracing of itself, and replaces
//!   its image with the target executable;
//!
//! * [`supervisor`] — the parent-side ptrace observation loop that steps
//!   the tracee syscall by syscall, samples its resource usage, and
//!   classifies its termination;
//!
//! * [`registry`] — a process-wide table routing a wall-clock alarm back to
//!   the tracee its supervisor is responsible for.
//!
//! [`execute`] ties the three together into the crate's single entry point.
//! No filesystem jailing, network isolation or seccomp filtering is
//! attempted: syscalls are policed by reading the tracee's registers at
//! each syscall-stop, not by an in-kernel filter.

#[macro_use]
extern crate error_chain;
extern crate libc;
extern crate nix;

mod config;
mod launcher;
mod registry;
mod rlimits;
mod supervisor;
mod syscalls;

use std::os::unix::io::RawFd;
use std::path::Path;

use nix::sys::signal::Signal;
use nix::unistd::ForkResult;

pub use config::ProcessBuilder;
pub use syscalls::Syscall;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Nix(::nix::Error);
    }

    errors {
        InvalidProcessArgument(arg: String) {
            description("invalid argv")
            display("invalid path for execve: {}", arg)
        }

        UnknownSyscall(name: String) {
            description("unknown syscall name")
            display("unknown syscall: {}", name)
        }

        SignalSetupFailed {
            description("failed to install the wall-clock alarm handler")
        }

        ForkFailed {
            description("failed to fork the tracee")
        }

        WaitFailed {
            description("wait4 on the tracee failed")
        }

        PtraceFailed {
            description("a ptrace request on the tracee failed")
        }
    }
}

/// The type of syscall identifiers, matching the width of the
/// syscall-number register read out of the tracee at each syscall-stop.
pub type SyscallId = i64;

/// Verdict returned for one execution. Stable and wire-visible: downstream
/// graders switch on this value alone, never on a secondary error channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Verdict {
    /// Clean exit of the child, under all limits and policies.
    Ok,
    /// Terminated or stopped by a signal not otherwise classified.
    RuntimeError,
    /// The wall-clock alarm fired, or the child was killed by `SIGXCPU`.
    TimeLimitExceeded,
    /// `SIGSEGV` with sampled peak resident memory above the configured
    /// byte threshold.
    MemoryLimitExceeded,
    /// The tracee attempted a disallowed syscall.
    SyscallError,
}

/// Configuration for one [`execute`] call. Immutable for the duration of the
/// execution it describes.
#[derive(Clone, Debug)]
pub struct ExecConfig {
    /// Duplicated onto the child's standard input (fd 0).
    pub stdin_fd: RawFd,

    /// Duplicated onto the child's standard output (fd 1).
    pub stdout_fd: RawFd,

    /// Seconds of CPU time and wall-clock time the child is given before
    /// being killed. `0` disables both the `RLIMIT_CPU` ceiling and the
    /// supervisor's wall-clock alarm.
    pub time_limit: u64,

    /// Bytes applied as `RLIMIT_DATA`; `RLIMIT_AS` is set to twice this
    /// value. `0` disables the limit, and disables `SIGSEGV`-to-MLE
    /// reclassification regardless of observed memory use.
    pub memory_limit: u64,

    /// Syscall numbers that terminate the tracee the moment it attempts
    /// them. Only membership matters; order is irrelevant.
    pub disallowed_syscalls: Vec<SyscallId>,
}

impl ExecConfig {
    /// Create a config with no limits and no disallowed syscalls, inheriting
    /// the calling process's own standard streams.
    pub fn new() -> Self {
        ExecConfig {
            stdin_fd: libc::STDIN_FILENO,
            stdout_fd: libc::STDOUT_FILENO,
            time_limit: 0,
            memory_limit: 0,
            disallowed_syscalls: Vec::new(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig::new()
    }
}

/// Outcome of one [`execute`] call.
#[derive(Clone, Debug)]
pub struct ExecResult {
    /// The verdict. The only field downstream graders are required to look
    /// at.
    pub code: Verdict,

    /// Seconds of user-mode CPU time consumed by the child, microsecond
    /// precision. Kernel-mode time is not included.
    pub exec_time: f64,

    /// Peak resident set size of the child, in bytes.
    pub exec_mem: u64,

    /// The offending syscall number. Populated only when `code` is
    /// [`Verdict::SyscallError`].
    pub syscall: Option<SyscallId>,

    /// The signal that terminated (or stopped) the child. Populated only
    /// when `code` is [`Verdict::RuntimeError`].
    pub termsig: Option<Signal>,
}

/// Launch `path` under the policies in `cfg`, observe it to completion, and
/// return exactly one categorized verdict.
///
/// This function never surfaces a secondary error: every internal failure
/// (fork, exec, ptrace, wait) is folded into [`Verdict::RuntimeError`],
/// because downstream graders expect exactly one of the five verdict codes.
pub fn execute(path: &Path, cfg: &ExecConfig) -> ExecResult {
    match try_execute(path, cfg) {
        Ok(result) => result,
        Err(e) => {
            log::error!(
                "sandbox execution of {} failed before a verdict could be produced: {}",
                path.display(),
                e
            );
            ExecResult {
                code: Verdict::RuntimeError,
                exec_time: 0.0,
                exec_mem: 0,
                syscall: None,
                termsig: None,
            }
        }
    }
}

fn try_execute(path: &Path, cfg: &ExecConfig) -> Result<ExecResult> {
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::from(ErrorKind::InvalidProcessArgument(path.display().to_string())))?;

    // SAFETY: the child branch immediately calls into `launcher::exec_child`,
    // which only performs async-signal-safe setup (dup2, setrlimit, ptrace,
    // execve) before either replacing the image or killing itself; it never
    // returns into arbitrary Rust code inherited from the parent.
    match unsafe { nix::unistd::fork() }.chain_err(|| ErrorKind::ForkFailed)? {
        ForkResult::Child => launcher::exec_child(path_str, cfg),
        ForkResult::Parent { child } => supervisor::run(child, cfg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::process::{Command, Stdio};
    use std::time::Duration;

    use tempfile::TempDir;

    /// Every test that actually drives a tracee through the supervisor loop
    /// starts by calling this, so `RUST_LOG=trace cargo test -- --nocapture`
    /// shows the module's own `trace!`/`debug!`/`warn!` calls. `try_init` is
    /// used because multiple tests in this process would otherwise each try
    /// to install the global logger.
    fn init_logging() {
        let _ = env_logger::try_init();
    }

    #[test]
    fn ok_for_quick_clean_exit() {
        init_logging();
        let result = ProcessBuilder::new("/bin/true")
            .time_limit(Duration::from_secs(5))
            .execute();
        assert_eq!(result.code, Verdict::Ok);
        assert!(result.exec_time < 5.0);
    }

    #[test]
    fn runtime_error_for_missing_executable() {
        init_logging();
        let result = execute(Path::new("/nonexistent/path/to/nowhere"), &ExecConfig::new());
        assert_eq!(result.code, Verdict::RuntimeError);
    }

    #[test]
    fn syscall_error_for_disallowed_syscall() {
        init_logging();
        let mut builder = ProcessBuilder::new("/bin/ls");
        builder.disallow(Syscall::Openat);
        builder.disallow(Syscall::Open);
        let result = builder.execute();
        assert_eq!(result.code, Verdict::SyscallError);
        assert!(result.syscall.is_some());
    }

    /// Compile `source` with the system C compiler into an executable at
    /// `target`. Sandboxing a real, independently-compiled process is the
    /// only faithful way to exercise the TLE/MLE classification paths,
    /// which depend on actual kernel-delivered `SIGXCPU`/`SIGSEGV` and real
    /// `rusage` sampling that no amount of mocking of `ptrace`/`wait4`
    /// would cover honestly.
    fn compile_executable(source: &str, target: &Path) {
        let cc = std::env::var("CC").unwrap_or_else(|_| String::from("cc"));
        let mut child = Command::new(&cc)
            .args(["-xc", "-", "-O0", "-o", target.to_str().unwrap()])
            .stdin(Stdio::piped())
            .spawn()
            .expect("cannot launch C compiler");
        child
            .stdin
            .as_mut()
            .expect("cannot get compiler stdin")
            .write_all(source.as_bytes())
            .expect("cannot write source to compiler stdin");
        assert!(child.wait().expect("compiler process failed").success());
    }

    #[test]
    fn time_limit_exceeded_for_busy_loop() {
        init_logging();
        let dir = TempDir::new().expect("cannot create tempdir");
        let binary = dir.path().join("spin");
        compile_executable("int main(void) { for (;;) {} return 0; }", &binary);

        let result = ProcessBuilder::new(&binary)
            .time_limit(Duration::from_secs(1))
            .execute();
        assert_eq!(result.code, Verdict::TimeLimitExceeded);
    }

    #[test]
    fn memory_limit_exceeded_for_over_allocation() {
        init_logging();
        let dir = TempDir::new().expect("cannot create tempdir");
        let binary = dir.path().join("hog");
        // Grow the heap 4 MiB at a time, touching every page so it counts
        // toward RSS, until the 32 MiB `RLIMIT_DATA` below makes `malloc`
        // return NULL; then deref that NULL to fault with `SIGSEGV`. By
        // then the tracee's peak RSS is at or past the configured byte
        // threshold, matching the classification in supervisor.rs.
        compile_executable(
            r#"
#include <stdlib.h>
#include <string.h>
int main(void) {
    size_t chunk = 4 * 1024 * 1024;
    for (;;) {
        char *p = malloc(chunk);
        if (!p) {
            char *bad = (char *)0;
            *bad = 1;
            break;
        }
        memset(p, 1, chunk);
    }
    return 0;
}
"#,
            &binary,
        );

        let result = ProcessBuilder::new(&binary)
            .time_limit(Duration::from_secs(5))
            .memory_limit_bytes(32 * 1024 * 1024)
            .execute();
        assert_eq!(result.code, Verdict::MemoryLimitExceeded);
    }

    #[test]
    fn concurrent_executions_do_not_cross_talk() {
        init_logging();
        assert_eq!(crate::registry::len(), 0);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        ProcessBuilder::new("/bin/true")
                            .time_limit(Duration::from_secs(5))
                            .execute()
                    } else {
                        let mut builder = ProcessBuilder::new("/bin/ls");
                        builder.disallow(Syscall::Openat);
                        builder.disallow(Syscall::Open);
                        builder.execute()
                    }
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.join().expect("supervisor thread panicked");
            if i % 2 == 0 {
                assert_eq!(result.code, Verdict::Ok);
            } else {
                assert_eq!(result.code, Verdict::SyscallError);
            }
        }

        assert_eq!(crate::registry::len(), 0);
    }
}
