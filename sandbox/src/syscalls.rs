//! Syscalls identified by their conventional x86-64 mnemonic, for callers
//! who would rather write `Syscall::from_name("openat")` than look up a raw
//! syscall number by hand.
//!
//! Only a representative subset used in judging scenarios (file I/O,
//! process control, networking, tracing) is covered; callers needing a
//! syscall outside this table can still ban it by raw number via
//! [`crate::ProcessBuilder::disallow_id`].

use crate::{ErrorKind, Result, SyscallId};

macro_rules! syscalls {
    ($($variant:ident => $name:literal = $number:expr),+ $(,)?) => {
        /// A syscall identified by its conventional x86-64 mnemonic.
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
        #[non_exhaustive]
        pub enum Syscall {
            $(
                #[allow(missing_docs)]
                $variant
            ),+
        }

        impl Syscall {
            /// Look up a syscall by its conventional name, e.g. `"openat"`.
            pub fn from_name(name: &str) -> Result<Syscall> {
                match name {
                    $($name => Ok(Syscall::$variant),)+
                    _ => bail!(ErrorKind::UnknownSyscall(name.to_owned())),
                }
            }

            /// The raw x86-64 syscall number.
            pub fn id(self) -> SyscallId {
                match self {
                    $(Syscall::$variant => $number),+
                }
            }
        }
    };
}

syscalls! {
    Read => "read" = 0,
    Write => "write" = 1,
    Open => "open" = 2,
    Close => "close" = 3,
    Stat => "stat" = 4,
    Fstat => "fstat" = 5,
    Mmap => "mmap" = 9,
    Mprotect => "mprotect" = 10,
    Munmap => "munmap" = 11,
    Brk => "brk" = 12,
    RtSigaction => "rt_sigaction" = 13,
    Ioctl => "ioctl" = 16,
    Pread64 => "pread64" = 17,
    Pwrite64 => "pwrite64" = 18,
    Access => "access" = 21,
    Pipe => "pipe" = 22,
    Dup => "dup" = 32,
    Dup2 => "dup2" = 33,
    Socket => "socket" = 41,
    Connect => "connect" = 42,
    Accept => "accept" = 43,
    Bind => "bind" = 49,
    Listen => "listen" = 50,
    Clone => "clone" = 56,
    Fork => "fork" = 57,
    Vfork => "vfork" = 58,
    Execve => "execve" = 59,
    Exit => "exit" = 60,
    Wait4 => "wait4" = 61,
    Kill => "kill" = 62,
    Fcntl => "fcntl" = 72,
    Truncate => "truncate" = 76,
    Ftruncate => "ftruncate" = 77,
    Getdents => "getdents" = 78,
    Getcwd => "getcwd" = 79,
    Chdir => "chdir" = 80,
    Rename => "rename" = 82,
    Mkdir => "mkdir" = 83,
    Rmdir => "rmdir" = 84,
    Unlink => "unlink" = 87,
    Symlink => "symlink" = 88,
    Chmod => "chmod" = 90,
    Chown => "chown" = 92,
    Ptrace => "ptrace" = 101,
    Setuid => "setuid" = 105,
    Setgid => "setgid" = 106,
    Setrlimit => "setrlimit" = 160,
    Mount => "mount" = 165,
    Umount2 => "umount2" = 166,
    Reboot => "reboot" = 169,
    Gettid => "gettid" = 186,
    Fadvise64 => "fadvise64" = 221,
    ExitGroup => "exit_group" = 231,
    Openat => "openat" = 257,
    Unlinkat => "unlinkat" = 263,
    Unshare => "unshare" = 272,
    Pipe2 => "pipe2" = 293,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_by_name() {
        assert_eq!(Syscall::from_name("openat").unwrap().id(), 257);
        assert_eq!(Syscall::from_name("fork").unwrap().id(), 57);
    }

    #[test]
    fn rejects_unknown_name() {
        assert!(Syscall::from_name("not_a_real_syscall").is_err());
    }
}
