//! Component B: the bidirectional byte-pipe shared by the tunnel server (T)
//! and the host-side TCP→vsock listener.
//!
//! Each direction of the bridge runs on its own `std::thread` doing
//! blocking reads, the same worker-thread-per-direction shape used
//! elsewhere in this crate for pumping bytes between two endpoints.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::vsock::BridgeEndpoint;

/// Read chunk size for each pump direction.
const BUFFER_SIZE: usize = 64 * 1024;

/// Cooperative cancellation handle for a running bridge.
///
/// Cloning is cheap and shares the underlying flag and endpoint handles.
/// `cancel()` flips the flag and shuts down both endpoints so any thread
/// parked in a blocking read/write returns immediately.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    endpoints: Arc<(Box<dyn BridgeEndpoint>, Box<dyn BridgeEndpoint>)>,
}

impl CancelToken {
    fn new(left: Arc<dyn BridgeEndpoint>, right: Arc<dyn BridgeEndpoint>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            endpoints: Arc::new((ArcEndpoint(left).into(), ArcEndpoint(right).into())),
        }
    }

    /// Whether `cancel()` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation: unblocks any thread currently parked in a
    /// blocking read or write on either endpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.endpoints.0.close();
        let _ = self.endpoints.1.close();
    }
}

/// Adapter so an `Arc<dyn BridgeEndpoint>` can be boxed as a
/// `Box<dyn BridgeEndpoint>` for storage in `CancelToken`.
struct ArcEndpoint(Arc<dyn BridgeEndpoint>);

impl BridgeEndpoint for ArcEndpoint {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.0.shutdown_write()
    }

    fn close(&self) -> io::Result<()> {
        self.0.close()
    }
}

impl From<ArcEndpoint> for Box<dyn BridgeEndpoint> {
    fn from(e: ArcEndpoint) -> Self {
        Box::new(e)
    }
}

/// Classification of an I/O error: operational errors end the bridge
/// quietly, fatal errors propagate.
#[derive(Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The bridge should end quietly: a disconnect, not a real failure.
    Operational,
    /// The error should propagate to the caller.
    Fatal,
}

/// Classify an `io::Error`: connection reset, broken pipe, timed out, or
/// not-connected (post-shutdown reads/writes) are operational; everything
/// else is fatal.
pub fn classify_io_error(err: &io::Error) -> ErrorClass {
    use io::ErrorKind::*;
    match err.kind() {
        ConnectionReset | BrokenPipe | TimedOut | NotConnected | ConnectionAborted => {
            ErrorClass::Operational
        }
        _ => match err.raw_os_error() {
            Some(libc::ECONNRESET)
            | Some(libc::EPIPE)
            | Some(libc::ETIMEDOUT)
            | Some(libc::ENOTCONN) => ErrorClass::Operational,
            _ => ErrorClass::Fatal,
        },
    }
}

/// Copy from `src` to `dst` until EOF or error, then half-close `dst`.
///
/// Returns `Ok(())` on clean EOF or any operational error (already
/// classified and swallowed); returns `Err` only for a fatal error.
fn pump(src: &dyn BridgeEndpoint, dst: &dyn BridgeEndpoint, cancel: &CancelToken) -> io::Result<()> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match src.read(&mut buf) {
            Ok(0) => {
                // Clean EOF: half-close the peer and let the other
                // direction keep running.
                let _ = dst.shutdown_write();
                return Ok(());
            }
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]) {
                    return match classify_io_error(&e) {
                        ErrorClass::Operational => Ok(()),
                        ErrorClass::Fatal => Err(e),
                    };
                }
            }
            Err(e) => {
                return match classify_io_error(&e) {
                    ErrorClass::Operational => Ok(()),
                    ErrorClass::Fatal => Err(e),
                };
            }
        }
    }
}

/// Bridge two endpoints bidirectionally until both directions have seen
/// EOF or an operational error.
///
/// `left` and `right` are `Arc`-wrapped so both directional threads can
/// hold a reference to both endpoints (one to read, one to shut down on
/// EOF) without cloning the underlying socket.
pub fn pipe_bidirectional(
    left: Arc<dyn BridgeEndpoint>,
    right: Arc<dyn BridgeEndpoint>,
) -> (CancelToken, thread::JoinHandle<io::Result<()>>) {
    let cancel = CancelToken::new(Arc::clone(&left), Arc::clone(&right));
    let cancel_for_thread = cancel.clone();

    let handle = thread::spawn(move || {
        let l2r_cancel = cancel_for_thread.clone();
        let l2r_left = Arc::clone(&left);
        let l2r_right = Arc::clone(&right);
        let l2r = thread::spawn(move || pump(&*l2r_left, &*l2r_right, &l2r_cancel));

        let r2l_cancel = cancel_for_thread.clone();
        let r2l_left = Arc::clone(&left);
        let r2l_right = Arc::clone(&right);
        let r2l = thread::spawn(move || pump(&*r2l_right, &*r2l_left, &r2l_cancel));

        let l2r_result = l2r.join().unwrap_or(Ok(()));
        let r2l_result = r2l.join().unwrap_or(Ok(()));

        let _ = left.close();
        let _ = right.close();

        l2r_result.and(r2l_result)
    });

    (cancel, handle)
}

/// Cancel a running bridge and wait for it to finish.
///
/// Safe to call even if the bridge has already completed on its own.
pub fn cancel_and_join(
    cancel: CancelToken,
    handle: thread::JoinHandle<io::Result<()>>,
) -> io::Result<()> {
    cancel.cancel();
    handle.join().unwrap_or(Ok(()))
}
