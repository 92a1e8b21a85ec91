//! Process-wide table routing a wall-clock alarm back to the tracee its
//! supervisor is responsible for.
//!
//! An alarm is thread-directed: it only fires on the thread that armed it.
//! But the signal handler that receives it has no context of its own beyond
//! "which thread am I running on", so it needs somewhere to look up the pid
//! to kill. This module is that lookup, keyed by kernel thread id and
//! serialized by a single mutex, mirroring the role `t_list` plays in the
//! original C implementation this crate's verdict semantics are ported
//! from.

use std::sync::{Mutex, OnceLock};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::{Error, ErrorKind, Result};

/// Identifies the thread of execution running one supervisor loop. Equal to
/// the kernel thread id, which is exactly what a signal handler running on
/// that thread can discover about itself.
pub type SupervisorId = libc::pid_t;

/// Get the kernel thread id of the calling thread.
pub fn current_supervisor_id() -> SupervisorId {
    // SAFETY: SYS_gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

struct TimeoutEntry {
    supervisor_id: SupervisorId,
    tracee_pid: Pid,
    fired: bool,
}

fn table() -> &'static Mutex<Vec<TimeoutEntry>> {
    static TABLE: OnceLock<Mutex<Vec<TimeoutEntry>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register `tracee_pid` as the responsibility of `supervisor_id`. At most
/// one entry exists per `supervisor_id` at any time; the supervisor loop
/// registers immediately *before* arming its alarm — so the lookup this
/// entry provides already exists by the time any `SIGALRM` for this thread
/// can possibly be delivered — and deregisters on every exit path.
pub fn register(supervisor_id: SupervisorId, tracee_pid: Pid) {
    let mut entries = table().lock().unwrap();
    debug_assert!(
        entries.iter().all(|e| e.supervisor_id != supervisor_id),
        "supervisor {} registered twice",
        supervisor_id
    );
    entries.push(TimeoutEntry {
        supervisor_id,
        tracee_pid,
        fired: false,
    });
    log::debug!("registered supervisor {} for tracee {}", supervisor_id, tracee_pid);
}

/// Mark the entry for `supervisor_id` as fired and return its tracee pid.
/// Called only from the alarm signal handler.
fn mark_and_get(supervisor_id: SupervisorId) -> Option<Pid> {
    let mut entries = table().lock().unwrap();
    entries
        .iter_mut()
        .find(|e| e.supervisor_id == supervisor_id)
        .map(|e| {
            e.fired = true;
            e.tracee_pid
        })
}

/// Return whether the wall-clock alarm for `supervisor_id` has fired.
/// Returns `false` if no entry exists.
pub fn check(supervisor_id: SupervisorId) -> bool {
    table()
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.supervisor_id == supervisor_id && e.fired)
}

/// Remove the entry for `supervisor_id`. No-op if absent.
pub fn deregister(supervisor_id: SupervisorId) {
    table()
        .lock()
        .unwrap()
        .retain(|e| e.supervisor_id != supervisor_id);
    log::debug!("deregistered supervisor {}", supervisor_id);
}

/// Number of entries currently tracked, for tests asserting the registry
/// is left empty once every supervisor using it has returned.
#[cfg(test)]
pub(crate) fn len() -> usize {
    table().lock().unwrap().len()
}

extern "C" fn timeout_handler(_sig: libc::c_int) {
    let sid = current_supervisor_id();
    if let Some(pid) = mark_and_get(sid) {
        // A kill we ourselves issue against a pid we do not recognize would
        // violate the "never SIGKILL a pid other than a registered tracee's"
        // invariant; `mark_and_get` only ever returns a pid it holds under
        // the registry's own bookkeeping.
        let _ = signal::kill(pid, Signal::SIGKILL);
    }
}

/// Install the wall-clock alarm handler and arm `alarm(seconds)` on the
/// calling thread. A no-op if `seconds == 0`: no handler is installed and
/// no alarm is armed, so the supervisor can never itself source a
/// `SIGKILL` via this path.
pub fn arm_timeout(seconds: u64) -> Result<()> {
    if seconds == 0 {
        return Ok(());
    }

    let action = SigAction::new(SigHandler::Handler(timeout_handler), SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: `timeout_handler` only calls the registry's mutex-guarded
    // lookup and `kill(2)`, both of which it is safe to call from a signal
    // handler in this crate's single-alarm-per-thread usage pattern.
    unsafe { signal::sigaction(Signal::SIGALRM, &action) }
        .map_err(|_| Error::from(ErrorKind::SignalSetupFailed))?;

    // SAFETY: alarm(2) cannot fail in a way that is observable here; its
    // return value (seconds remaining on any previous alarm) is unused
    // because this crate never arms more than one alarm per thread.
    unsafe {
        libc::alarm(seconds as libc::c_uint);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_check_deregister_round_trip() {
        let sid = 424_242;
        assert!(!check(sid));

        register(sid, Pid::from_raw(1));
        assert!(!check(sid));

        deregister(sid);
        assert!(!check(sid));
    }

    #[test]
    fn mark_and_get_requires_registration() {
        let sid = 424_243;
        assert_eq!(mark_and_get(sid), None);

        register(sid, Pid::from_raw(2));
        assert_eq!(mark_and_get(sid), Some(Pid::from_raw(2)));
        assert!(check(sid));

        deregister(sid);
        assert_eq!(mark_and_get(sid), None);
    }

    #[test]
    fn at_most_one_entry_per_supervisor() {
        let sid = 424_244;
        register(sid, Pid::from_raw(3));
        assert_eq!(
            table().lock().unwrap().iter().filter(|e| e.supervisor_id == sid).count(),
            1
        );
        deregister(sid);
    }
}
