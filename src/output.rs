use anyhow::Result;

/// Status updates about the daemon's lifecycle and its three servers.
///
/// Each server goes through a `Starting` / `Up` (or `Down` on failure)
/// pair. Consumers (a GUI layer, or anything else the lifecycle guard's
/// status channel is wired into) should treat a `Down` as terminal for
/// that one server but not for the daemon as a whole: one server failing
/// to bind never kills the other two.
pub enum Status {
    /// The named server (`"router"`, `"tunnel"`, or `"events"`) is about to
    /// bind its vsock port.
    ServerStarting(&'static str),
    /// The named server bound successfully and is accepting connections.
    ServerUp(&'static str),
    /// The named server failed to bind, or was torn down after running.
    ServerDown(&'static str, Result<()>),

    /// The singleton takeover / lock acquisition sequence has begun.
    LockStart,
    /// Lock acquisition finished with the given result.
    LockEnd(Result<()>),

    /// A version-gate rescan has begun.
    RescanStart,
    /// A version-gate rescan finished. `Ok(true)` means a newer build was
    /// found and installed, and the daemon is about to relaunch.
    RescanEnd(Result<bool>),
}
