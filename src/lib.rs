#![deny(missing_docs)]
//! Library form of the guest-side VM integration daemon.
//!
//! Three vsock-bound servers (the request router `R`, the tunnel server
//! `T`, and the event push server `E`) share a small set of collaborators:
//! an outgoing-file queue (`Q`), a pending-URL queue (`U`), and the
//! singleton/lifecycle guard (`L`) that decides whether this process
//! should even be the one running.

/// Daemon configuration, loaded from `vmbridge.toml`.
pub mod config;
/// Status updates describing the daemon's lifecycle and its three servers.
pub mod output;

/// Transport abstraction (vsock and loopback TCP) shared by every server.
pub mod vsock;

/// The bidirectional byte-pipe shared by the tunnel server and the
/// host-side proxy binary.
pub mod bridge;
/// The event push server (component E).
pub mod events;
/// The singleton/lifecycle guard (component L).
pub mod lifecycle;
/// The outgoing-file and pending-URL queues (components Q and U).
pub mod queue;
/// The HTTP request router (component R).
pub mod router;
/// The tunnel server (component T).
pub mod tunnel;

mod util;

pub use crate::config::Config;
pub use crate::lifecycle::run;
pub use crate::output::Status;
