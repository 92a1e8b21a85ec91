//! The ptrace-driven observation loop that drives one tracee to completion
//! and classifies its termination into an [`ExecResult`].
//!
//! States: `PRE_EXEC` (between fork and first stop), `RUNNING_USER`
//! (resumed, not stopped), `AT_SYSCALL` (stopped at a syscall boundary),
//! `TERMINAL` (absorbing; yields the verdict). The match arms in
//! [`classify`] below are ordered to exactly the precedence the verdict
//! semantics depend on: normal exit, then our own wall-clock timeout, then
//! signalled termination, then an unsafe stop signal, then the syscall-stop
//! default. Reordering them changes verdicts.

use std::mem;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::{Error, ErrorKind, ExecConfig, ExecResult, Result, SyscallId, Verdict};
use crate::registry::{self, SupervisorId};

/// Ensures the tracee is always reaped or killed, even if the loop below
/// returns early through an error path. Mirrors the role `WaitPidGuard`
/// plays around this crate's own non-traced process spawner.
struct TraceeGuard {
    pid: Pid,
    armed: bool,
}

impl TraceeGuard {
    fn new(pid: Pid) -> Self {
        TraceeGuard { pid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TraceeGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = nix::sys::signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

/// Result of one `wait4` call: the parsed wait status alongside the raw
/// `rusage` sampled at the same instant.
struct Sample {
    status: WaitStatus,
    rusage: libc::rusage,
}

fn wait_and_sample(pid: Pid) -> Result<Sample> {
    let mut raw_status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { mem::zeroed() };
    // SAFETY: `raw_status` and `rusage` are valid, appropriately sized
    // out-parameters for the duration of this call.
    let ret = unsafe { libc::wait4(pid.as_raw(), &mut raw_status, libc::WUNTRACED, &mut rusage) };
    if ret < 0 {
        return Err(Error::from(ErrorKind::WaitFailed));
    }

    let status = WaitStatus::from_raw(pid, raw_status).map_err(|_| Error::from(ErrorKind::WaitFailed))?;
    Ok(Sample { status, rusage })
}

fn user_cpu_seconds(rusage: &libc::rusage) -> f64 {
    rusage.ru_utime.tv_sec as f64 + rusage.ru_utime.tv_usec as f64 / 1_000_000.0
}

/// Convert the kernel's peak-RSS sample (kilobytes) to bytes. The factor is
/// 1000, not 1024, to match existing downstream expectations.
fn resident_bytes(rusage: &libc::rusage) -> u64 {
    (rusage.ru_maxrss.max(0) as u64).saturating_mul(1000)
}

#[cfg(target_arch = "x86_64")]
fn read_syscall_number(pid: Pid) -> Result<SyscallId> {
    let regs = ptrace::getregs(pid).map_err(|_| Error::from(ErrorKind::PtraceFailed))?;
    Ok(regs.orig_rax as SyscallId)
}

/// Disambiguate a terminating or stopping signal into a verdict, given the
/// last-sampled peak resident set size and the configured memory ceiling.
fn classify_signal(sig: Signal, exec_mem: u64, memory_limit: u64) -> (Verdict, Option<Signal>) {
    if sig == Signal::SIGXCPU {
        (Verdict::TimeLimitExceeded, None)
    } else if sig == Signal::SIGSEGV && memory_limit > 0 && exec_mem > memory_limit {
        (Verdict::MemoryLimitExceeded, None)
    } else {
        (Verdict::RuntimeError, Some(sig))
    }
}

fn kill_tracee(pid: Pid) {
    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
}

/// Drive `tracee_pid` to completion and return a categorized verdict.
/// `tracee_pid` must not yet have been waited on.
pub(crate) fn run(tracee_pid: Pid, cfg: &ExecConfig) -> Result<ExecResult> {
    let supervisor_id = registry::current_supervisor_id();
    let mut guard = TraceeGuard::new(tracee_pid);

    // Block until the tracee's initial stop: either the `PTRACE_TRACEME`
    // synchronization point at exec, or — if the launcher failed before
    // reaching `execve` — its own exit.
    let initial = wait_and_sample(tracee_pid)?;
    let mut exec_mem = resident_bytes(&initial.rusage);

    if let Some(result) = initial_stop_result(&initial.status, &initial.rusage, exec_mem, cfg.memory_limit) {
        guard.disarm();
        return Ok(result);
    }

    // Register before arming: once the alarm is armed, a SIGALRM could in
    // principle be delivered immediately, and the handler must find this
    // thread's entry already in the table.
    registry::register(supervisor_id, tracee_pid);
    if let Err(e) = registry::arm_timeout(cfg.time_limit) {
        registry::deregister(supervisor_id);
        return Err(e);
    }

    let result = supervise(supervisor_id, tracee_pid, cfg, &mut guard, &mut exec_mem);

    registry::deregister(supervisor_id);
    result
}

/// Classify the tracee's very first wait status, before the main ptrace
/// loop ever runs. A successful `execve` always produces a `SIGTRAP`
/// exec-sync stop here, never an exit: the new image cannot run a single
/// instruction (let alone exit) until the supervisor resumes it past that
/// stop. So if this first status is already terminal, the launcher failed
/// before reaching `execve` and the verdict is always
/// [`Verdict::RuntimeError`], regardless of the exit code or signal
/// involved. Returns `None` for the expected exec-sync stop (or any other
/// stop), meaning the main loop should take over.
fn initial_stop_result(status: &WaitStatus, rusage: &libc::rusage, exec_mem: u64, memory_limit: u64) -> Option<ExecResult> {
    match *status {
        WaitStatus::Exited(_, _) => Some(ExecResult {
            code: Verdict::RuntimeError,
            exec_time: user_cpu_seconds(rusage),
            exec_mem,
            syscall: None,
            termsig: None,
        }),
        WaitStatus::Signaled(_, sig, _) => {
            let (code, termsig) = classify_signal(sig, exec_mem, memory_limit);
            Some(ExecResult {
                code,
                exec_time: user_cpu_seconds(rusage),
                exec_mem,
                syscall: None,
                termsig,
            })
        }
        _ => None,
    }
}

fn supervise(
    supervisor_id: SupervisorId,
    tracee_pid: Pid,
    cfg: &ExecConfig,
    guard: &mut TraceeGuard,
    exec_mem: &mut u64,
) -> Result<ExecResult> {
    loop {
        ptrace::syscall(tracee_pid, None).map_err(|_| Error::from(ErrorKind::PtraceFailed))?;

        let sample = wait_and_sample(tracee_pid)?;
        log::trace!("supervisor {} wait status: {:?}", supervisor_id, sample.status);
        let sampled = resident_bytes(&sample.rusage);
        if sampled > *exec_mem {
            *exec_mem = sampled;
        }

        if let WaitStatus::Exited(_, _) = sample.status {
            guard.disarm();
            return Ok(ExecResult {
                code: Verdict::Ok,
                exec_time: user_cpu_seconds(&sample.rusage),
                exec_mem: *exec_mem,
                syscall: None,
                termsig: None,
            });
        }

        if registry::check(supervisor_id) {
            log::warn!("supervisor {} wall-clock timeout fired for tracee {}", supervisor_id, tracee_pid);
            // The signal handler may already have sent this SIGKILL; a
            // redundant one here is harmless.
            kill_tracee(tracee_pid);
            guard.disarm();
            let _ = waitpid(tracee_pid, None);
            return Ok(ExecResult {
                code: Verdict::TimeLimitExceeded,
                exec_time: user_cpu_seconds(&sample.rusage),
                exec_mem: *exec_mem,
                syscall: None,
                termsig: None,
            });
        }

        if let WaitStatus::Signaled(_, sig, _) = sample.status {
            log::warn!("tracee {} terminated by signal {:?}", tracee_pid, sig);
            kill_tracee(tracee_pid);
            guard.disarm();
            let (code, termsig) = classify_signal(sig, *exec_mem, cfg.memory_limit);
            return Ok(ExecResult {
                code,
                exec_time: user_cpu_seconds(&sample.rusage),
                exec_mem: *exec_mem,
                syscall: None,
                termsig,
            });
        }

        if let WaitStatus::Stopped(_, sig) = sample.status {
            if sig != Signal::SIGTRAP && sig != Signal::SIGCHLD {
                // The tracee is stopped in an unsafe state by a signal we
                // did not expect; kill it and disambiguate using that
                // signal, same as a signalled termination would be.
                log::warn!("tracee {} stopped by unexpected signal {:?}; killing", tracee_pid, sig);
                kill_tracee(tracee_pid);
                guard.disarm();
                let _ = waitpid(tracee_pid, None);
                let (code, termsig) = classify_signal(sig, *exec_mem, cfg.memory_limit);
                return Ok(ExecResult {
                    code,
                    exec_time: user_cpu_seconds(&sample.rusage),
                    exec_mem: *exec_mem,
                    syscall: None,
                    termsig,
                });
            }

            if sig == Signal::SIGTRAP {
                let syscall_no = read_syscall_number(tracee_pid)?;
                if cfg.disallowed_syscalls.contains(&syscall_no) {
                    log::warn!("tracee {} attempted disallowed syscall {}", tracee_pid, syscall_no);
                    kill_tracee(tracee_pid);
                    guard.disarm();
                    let _ = waitpid(tracee_pid, None);
                    return Ok(ExecResult {
                        code: Verdict::SyscallError,
                        exec_time: user_cpu_seconds(&sample.rusage),
                        exec_mem: *exec_mem,
                        syscall: Some(syscall_no),
                        termsig: None,
                    });
                }
            }

            // SIGTRAP with an allowed syscall, or SIGCHLD: keep observing.
            continue;
        }

        // Any other wait status (PTRACE_EVENT stops, continued, etc.) is
        // not part of the plain PTRACE_SYSCALL protocol used here; resume
        // and keep observing.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_sigxcpu_as_tle() {
        let (code, termsig) = classify_signal(Signal::SIGXCPU, 0, 0);
        assert_eq!(code, Verdict::TimeLimitExceeded);
        assert_eq!(termsig, None);
    }

    #[test]
    fn classify_sigsegv_over_limit_as_mle() {
        let (code, termsig) = classify_signal(Signal::SIGSEGV, 100, 50);
        assert_eq!(code, Verdict::MemoryLimitExceeded);
        assert_eq!(termsig, None);
    }

    #[test]
    fn classify_sigsegv_under_limit_as_re() {
        let (code, termsig) = classify_signal(Signal::SIGSEGV, 10, 50);
        assert_eq!(code, Verdict::RuntimeError);
        assert_eq!(termsig, Some(Signal::SIGSEGV));
    }

    #[test]
    fn classify_sigsegv_with_no_limit_as_re() {
        let (code, termsig) = classify_signal(Signal::SIGSEGV, 1_000_000, 0);
        assert_eq!(code, Verdict::RuntimeError);
        assert_eq!(termsig, Some(Signal::SIGSEGV));
    }

    #[test]
    fn classify_other_signal_as_re() {
        let (code, termsig) = classify_signal(Signal::SIGABRT, 0, 0);
        assert_eq!(code, Verdict::RuntimeError);
        assert_eq!(termsig, Some(Signal::SIGABRT));
    }
}
