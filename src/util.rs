/// Ignore `SIGPIPE` so that writing to a peer that has gone away returns
/// `EPIPE` from `write()` instead of killing the process.
///
/// Must be called once, early in `main()`, before any socket I/O happens.
pub(crate) fn ignore_sigpipe() {
    // SAFETY: `signal(2)` with `SIG_IGN` has no preconditions beyond the
    // signal number being valid, which `SIGPIPE` is.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Send `SIGTERM` to a process, ignoring `ESRCH` (already gone).
///
/// Returns `true` if the process was alive and the signal was delivered.
pub(crate) fn terminate(pid: i32) -> bool {
    // SAFETY: `kill(2)` is safe to call with any pid; failure is reported
    // via errno, not UB.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    rc == 0
}

/// Probe whether a process is alive via the null signal, per `kill(2)`.
pub(crate) fn is_alive(pid: i32) -> bool {
    // SAFETY: see `terminate`.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_alive_self() {
        let pid = std::process::id() as i32;
        assert!(is_alive(pid));
    }
}
