//! Transport abstraction shared by R, T, and E.
//!
//! The virtual-socket family does not expose listen-queue readiness to the
//! guest's own event-notification facility, so every accept loop and every
//! bridge half in this daemon is written against blocking, synchronous I/O
//! on a dedicated thread rather than against an async reactor. This
//! module's job is to give the router, tunnel, and event servers one small
//! trait (`BridgeEndpoint`) they can all drive the same way, whether the
//! concrete transport is a real vsock socket or (in tests, and on the host
//! side for the TCP half of a tunnel) a loopback TCP socket.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

use vsock::{VsockListener, VsockStream};

/// A vsock address: hypervisor-assigned context id plus server-chosen port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsockAddress {
    /// Hypervisor-assigned context id of the guest.
    pub cid: u32,
    /// Server-chosen port within that context.
    pub port: u32,
}

impl VsockAddress {
    /// Construct an address from its parts.
    pub fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }

    fn to_vsock_addr(self) -> vsock::VsockAddr {
        vsock::VsockAddr::new(self.cid, self.port)
    }
}

/// One half of a byte-stream connection, driven with blocking syscalls.
///
/// Implementations must allow `read`/`write_all` to be called concurrently
/// from two different threads (one per bridge direction): this is safe
/// because reading and writing a socket touch independent kernel buffers,
/// so no internal locking is needed as long as each method only issues the
/// one syscall it's documented to issue.
pub trait BridgeEndpoint: Send + Sync {
    /// Read up to `buf.len()` bytes. `Ok(0)` means clean EOF.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write the entire buffer, looping over short writes.
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;
    /// Half-close the write side. A concurrent blocked `read` on the peer
    /// observes EOF once the peer's kernel buffer drains.
    fn shutdown_write(&self) -> io::Result<()>;
    /// Fully shut down both directions, idempotently. Used to unblock a
    /// thread parked in a blocking `read`/`write` on cancellation.
    fn close(&self) -> io::Result<()>;
}

fn shutdown_raw(fd: i32, how: i32) -> io::Result<()> {
    // SAFETY: fd is a valid, open socket for the lifetime of this call
    // (owned by the caller's endpoint wrapper).
    let rc = unsafe { libc::shutdown(fd, how) };
    if rc == 0 {
        Ok(())
    } else {
        let err = io::Error::last_os_error();
        // Already shut down / not connected: treat as success so calling
        // close() twice is always safe.
        match err.raw_os_error() {
            Some(libc::ENOTCONN) | Some(libc::EINVAL) => Ok(()),
            _ => Err(err),
        }
    }
}

fn read_raw(fd: i32, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: fd is valid and buf is a valid, writable slice for its length.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_all_raw(fd: i32, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: fd is valid and buf is a valid, readable slice for its length.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// A vsock-backed bridge endpoint.
pub struct VsockEndpoint(VsockStream);

impl VsockEndpoint {
    /// Dial a vsock address.
    pub fn connect(addr: VsockAddress) -> io::Result<Self> {
        VsockStream::connect(&addr.to_vsock_addr()).map(Self)
    }
}

impl From<VsockStream> for VsockEndpoint {
    fn from(stream: VsockStream) -> Self {
        Self(stream)
    }
}

impl BridgeEndpoint for VsockEndpoint {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        read_raw(self.0.as_raw_fd(), buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        write_all_raw(self.0.as_raw_fd(), buf)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        shutdown_raw(self.0.as_raw_fd(), libc::SHUT_WR)
    }

    fn close(&self) -> io::Result<()> {
        shutdown_raw(self.0.as_raw_fd(), libc::SHUT_RDWR)
    }
}

/// A TCP-backed bridge endpoint: used for the loopback connection inside
/// the guest that T dials, and for the host-local TCP accept that
/// `vmbridge-host` bridges to vsock.
pub struct TcpEndpoint(TcpStream);

impl From<TcpStream> for TcpEndpoint {
    fn from(stream: TcpStream) -> Self {
        Self(stream)
    }
}

impl BridgeEndpoint for TcpEndpoint {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        read_raw(self.0.as_raw_fd(), buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        write_all_raw(self.0.as_raw_fd(), buf)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        shutdown_raw(self.0.as_raw_fd(), libc::SHUT_WR)
    }

    fn close(&self) -> io::Result<()> {
        shutdown_raw(self.0.as_raw_fd(), libc::SHUT_RDWR)
    }
}

/// A listener that accepts connections and hands back a boxed
/// `BridgeEndpoint`, so R/T/E's accept loops don't need to know whether
/// they're bound to a real vsock port or (in tests) a loopback TCP port.
pub trait EndpointListener: Send {
    /// Block until the next connection arrives.
    fn accept(&self) -> io::Result<Box<dyn BridgeEndpoint>>;
}

/// A listener bound to a vsock port, accepting real vsock connections.
pub struct VsockEndpointListener(VsockListener);

impl VsockEndpointListener {
    /// Bind to `port` on any context id.
    pub fn bind(port: u32) -> io::Result<Self> {
        VsockListener::bind(&vsock::VsockAddr::new(vsock::VMADDR_CID_ANY, port)).map(Self)
    }
}

impl EndpointListener for VsockEndpointListener {
    fn accept(&self) -> io::Result<Box<dyn BridgeEndpoint>> {
        let (stream, _addr) = self.0.accept()?;
        Ok(Box::new(VsockEndpoint::from(stream)))
    }
}

/// A loopback TCP listener standing in for a vsock listener, for tests and
/// for the host-local half of a tunnel.
pub struct TcpEndpointListener(TcpListener);

impl TcpEndpointListener {
    /// Bind to a local address (`"127.0.0.1:0"` for an OS-assigned port).
    pub fn bind(addr: &str) -> io::Result<Self> {
        TcpListener::bind(addr).map(Self)
    }

    /// The address this listener actually bound to.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.0.local_addr()
    }
}

impl EndpointListener for TcpEndpointListener {
    fn accept(&self) -> io::Result<Box<dyn BridgeEndpoint>> {
        let (stream, _addr) = self.0.accept()?;
        Ok(Box::new(TcpEndpoint::from(stream)))
    }
}
