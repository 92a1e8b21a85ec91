//! Ergonomic front-end over [`ExecConfig`] for callers who would rather not
//! build the raw fd/limit/syscall-id struct by hand.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ExecConfig, ExecResult, SyscallId};
use crate::syscalls::Syscall;

/// Builds an [`ExecConfig`] and runs it. Owns any [`File`] handed to it for
/// stream redirection, so the descriptor stays valid for the lifetime of the
/// call.
pub struct ProcessBuilder {
    path: PathBuf,
    stdin: Option<File>,
    stdout: Option<File>,
    time_limit: Duration,
    memory_limit: u64,
    disallowed_syscalls: Vec<SyscallId>,
}

impl ProcessBuilder {
    /// Start building a run of the executable at `path`, with no limits and
    /// no disallowed syscalls.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        ProcessBuilder {
            path: path.as_ref().to_owned(),
            stdin: None,
            stdout: None,
            time_limit: Duration::from_secs(0),
            memory_limit: 0,
            disallowed_syscalls: Vec::new(),
        }
    }

    /// Redirect the child's standard input from `file` instead of inheriting
    /// this process's.
    pub fn redirect_stdin(&mut self, file: File) -> &mut Self {
        self.stdin = Some(file);
        self
    }

    /// Redirect the child's standard output into `file` instead of
    /// inheriting this process's.
    pub fn redirect_stdout(&mut self, file: File) -> &mut Self {
        self.stdout = Some(file);
        self
    }

    /// Set the CPU-time and wall-clock ceiling. Rounded up to the nearest
    /// whole second, since both `RLIMIT_CPU` and the supervisor's alarm are
    /// second-granular. A zero duration disables both ceilings.
    pub fn time_limit(&mut self, limit: Duration) -> &mut Self {
        let whole_secs = if limit.subsec_nanos() > 0 {
            limit.as_secs() + 1
        } else {
            limit.as_secs()
        };
        self.time_limit = Duration::from_secs(whole_secs);
        self
    }

    /// Set the memory ceiling, in bytes. Zero disables the `RLIMIT_DATA`/
    /// `RLIMIT_AS` limits and `SIGSEGV`-to-MLE reclassification.
    ///
    /// `bytes` must not exceed `u64::MAX / 2`, since the launcher applies it
    /// to `RLIMIT_AS` doubled; a larger value is clamped to that maximum
    /// rather than silently wrapped or saturated into an effectively
    /// unlimited address space.
    pub fn memory_limit_bytes(&mut self, bytes: u64) -> &mut Self {
        self.memory_limit = bytes.min(u64::MAX / 2);
        self
    }

    /// Forbid `syscall`; the tracee is killed the instant it attempts it.
    pub fn disallow(&mut self, syscall: Syscall) -> &mut Self {
        self.disallowed_syscalls.push(syscall.id());
        self
    }

    /// Forbid a raw syscall number not covered by [`Syscall`]'s mnemonic
    /// table.
    pub fn disallow_id(&mut self, id: SyscallId) -> &mut Self {
        self.disallowed_syscalls.push(id);
        self
    }

    /// Assemble the accumulated settings into an [`ExecConfig`]. Any
    /// redirected file stays owned by this builder — only its descriptor
    /// number is copied into the returned config — so the descriptor is
    /// closed whenever this builder is dropped, not leaked. The returned
    /// `ExecConfig`'s fds are therefore only valid for as long as this
    /// `ProcessBuilder` remains alive; [`Self::execute`] relies on exactly
    /// this, since the fork its call performs completes, and the child has
    /// already `dup2`'d its own copy, before this builder itself drops.
    pub fn build(&self) -> ExecConfig {
        let stdin_fd = self
            .stdin
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .unwrap_or(libc::STDIN_FILENO);
        let stdout_fd = self
            .stdout
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .unwrap_or(libc::STDOUT_FILENO);

        ExecConfig {
            stdin_fd,
            stdout_fd,
            time_limit: self.time_limit.as_secs(),
            memory_limit: self.memory_limit,
            disallowed_syscalls: self.disallowed_syscalls.clone(),
        }
    }

    /// Build and run in one step. Like [`crate::execute`], this never
    /// surfaces a secondary error channel: any internal failure folds into
    /// [`crate::Verdict::RuntimeError`].
    pub fn execute(&mut self) -> ExecResult {
        let cfg = self.build();
        crate::execute(&self.path, &cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_defaults_to_inherited_streams_and_no_limits() {
        let cfg = ProcessBuilder::new("/bin/true").build();
        assert_eq!(cfg.stdin_fd, libc::STDIN_FILENO);
        assert_eq!(cfg.stdout_fd, libc::STDOUT_FILENO);
        assert_eq!(cfg.time_limit, 0);
        assert_eq!(cfg.memory_limit, 0);
        assert!(cfg.disallowed_syscalls.is_empty());
    }

    #[test]
    fn time_limit_rounds_up_to_whole_seconds() {
        let cfg = ProcessBuilder::new("/bin/true")
            .time_limit(Duration::from_millis(1500))
            .build();
        assert_eq!(cfg.time_limit, 2);
    }

    #[test]
    fn memory_limit_bytes_clamps_values_that_would_overflow_when_doubled() {
        let cfg = ProcessBuilder::new("/bin/true")
            .memory_limit_bytes(u64::MAX)
            .build();
        assert_eq!(cfg.memory_limit, u64::MAX / 2);
    }

    #[test]
    fn disallow_collects_syscall_ids() {
        let cfg = ProcessBuilder::new("/bin/true")
            .disallow(Syscall::Execve)
            .disallow_id(9999)
            .build();
        assert_eq!(cfg.disallowed_syscalls, vec![Syscall::Execve.id(), 9999]);
    }
}
