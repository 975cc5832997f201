//! OS-level process suspension.
//!
//! Pause must stop the encoder from consuming CPU/GPU time, so it operates on
//! the process itself rather than any internal state. Platform-specific code
//! is confined to this module. A pid that no longer exists is a benign race
//! with process exit and is swallowed silently.

#[cfg(unix)]
mod imp {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    pub fn suspend(pid: u32) {
        signal(pid, Signal::SIGSTOP);
    }

    pub fn resume(pid: u32) {
        signal(pid, Signal::SIGCONT);
    }

    fn signal(pid: u32, sig: Signal) {
        let pid = Pid::from_raw(pid as i32);
        match kill(pid, sig) {
            Ok(()) => {}
            // Process already exited between the pid read and the signal
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => log::warn!("Failed to send {:?} to pid {}: {}", sig, pid, e),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub fn suspend(pid: u32) {
        log::warn!("Process suspension is not supported on this platform (pid {})", pid);
    }

    pub fn resume(pid: u32) {
        log::warn!("Process resumption is not supported on this platform (pid {})", pid);
    }
}

/// Suspend the process with the given pid; no-op if it has already exited
pub fn suspend(pid: u32) {
    imp::suspend(pid);
}

/// Resume the process with the given pid; no-op if it has already exited
pub fn resume(pid: u32) {
    imp::resume(pid);
}
