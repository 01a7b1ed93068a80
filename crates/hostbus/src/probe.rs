//! Process-liveness probe.
//!
//! Peer eviction must never act on a guess: the probe reports
//! [`Liveness::Unknown`] whenever the platform cannot distinguish a dead
//! process from an unreachable one, and every caller maps `Unknown` to
//! alive.

/// Result of probing a process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists.
    Alive,
    /// The process provably does not exist.
    Dead,
    /// The platform could not tell; treat as alive.
    Unknown,
}

impl Liveness {
    /// Conservative collapse: only a provably dead process counts as dead.
    #[must_use]
    pub const fn presumed_alive(self) -> bool {
        !matches!(self, Self::Dead)
    }
}

/// A platform liveness probe.
pub trait PidProbe: Send + Sync {
    /// Probes whether `pid` refers to a live process on this host.
    fn probe(&self, pid: u32) -> Liveness;
}

/// The host platform's native probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeProbe;

impl PidProbe for NativeProbe {
    fn probe(&self, pid: u32) -> Liveness {
        pid_liveness(pid)
    }
}

/// Signal-0 probe: "no such process" means dead, "not permitted" means the
/// process exists under another user, anything else is indeterminate.
#[cfg(unix)]
fn pid_liveness(pid: u32) -> Liveness {
    if pid == 0 {
        return Liveness::Unknown;
    }
    // SAFETY: `kill(pid, 0)` is a standard POSIX existence check that sends
    // no signal and cannot cause undefined behavior. The cast is safe
    // because valid pids fit in `pid_t`.
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return Liveness::Alive;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(code) if code == libc::ESRCH => Liveness::Dead,
        Some(code) if code == libc::EPERM => Liveness::Alive,
        _ => Liveness::Unknown,
    }
}

/// Limited-query probe: `STILL_ACTIVE` (259) means alive, access denied
/// means alive, any other failure to open means dead.
#[cfg(windows)]
fn pid_liveness(pid: u32) -> Liveness {
    use windows_sys::Win32::Foundation::{CloseHandle, ERROR_ACCESS_DENIED, GetLastError};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    const STILL_ACTIVE: u32 = 259;

    if pid == 0 {
        return Liveness::Unknown;
    }
    // SAFETY: OpenProcess/GetExitCodeProcess/CloseHandle are used per their
    // documented contracts; the handle is closed on every path.
    #[allow(unsafe_code)]
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return if GetLastError() == ERROR_ACCESS_DENIED {
                Liveness::Alive
            } else {
                Liveness::Dead
            };
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        if ok == 0 {
            return Liveness::Unknown;
        }
        if code == STILL_ACTIVE {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn pid_liveness(_pid: u32) -> Liveness {
    Liveness::Unknown
}
