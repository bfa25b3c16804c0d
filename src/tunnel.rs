//! Component T: the tunnel server.
//!
//! Each accepted connection runs the tiny `CONNECT <port>\n` handshake on
//! its own thread, then hands both ends to the bridge primitive (`bridge.rs`)
//! for the duration of the session.

use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::bridge::{self, classify_io_error, ErrorClass};
use crate::vsock::{BridgeEndpoint, EndpointListener, TcpEndpoint};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_COMMAND_LINE_BYTES: usize = 256;

/// Accepts `CONNECT` handshakes and bridges each session to a loopback
/// TCP connection.
pub struct TunnelServer {
    stopped: Arc<AtomicBool>,
}

impl TunnelServer {
    /// Construct a tunnel server. Call `serve` to start accepting.
    pub fn new() -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the accept loop until `shutdown` is called or the listener
    /// errors out fatally. Blocks the calling thread.
    pub fn serve(&self, listener: Box<dyn EndpointListener>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok(endpoint) => {
                    let endpoint: Arc<dyn BridgeEndpoint> = Arc::from(endpoint);
                    thread::spawn(move || handle_session(endpoint));
                }
                Err(e) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    match classify_io_error(&e) {
                        ErrorClass::Operational => continue,
                        ErrorClass::Fatal => {
                            warn!("tunnel server accept failed fatally: {e}");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Stop accepting new sessions. In-flight sessions finish normally.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl Default for TunnelServer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Connect(u16),
    BadRequest,
}

/// Parse a `CONNECT <port>\n` line. Anything else, or a port outside
/// 1-65535, is rejected as a bad request rather than a parse error so the
/// caller always has a single place to send `ERROR bad request`.
fn parse_command(line: &str) -> Command {
    let line = line.trim_end_matches(['\n', '\r']);
    let Some(port_str) = line.strip_prefix("CONNECT ") else {
        return Command::BadRequest;
    };
    match port_str.parse::<u32>() {
        Ok(p) if p >= 1 && p <= 65535 => Command::Connect(p as u16),
        _ => Command::BadRequest,
    }
}

/// Read one line (up to and including `\n`) from `endpoint`, one byte at a
/// time. The command line is tiny and sent once, so this isn't worth a
/// buffered reader.
fn read_line(endpoint: &dyn BridgeEndpoint) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if line.len() > MAX_COMMAND_LINE_BYTES {
            return Ok(None);
        }
        match endpoint.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
            Err(e) => return Err(e),
        }
    }
    match String::from_utf8(line) {
        Ok(s) => Ok(Some(s)),
        Err(_) => Ok(None),
    }
}

fn handle_session(endpoint: Arc<dyn BridgeEndpoint>) {
    if let Err(e) = handle_session_inner(&endpoint) {
        debug!("tunnel session ended with an error: {e}");
    }
}

fn handle_session_inner(endpoint: &Arc<dyn BridgeEndpoint>) -> io::Result<()> {
    let Some(line) = read_line(&**endpoint)? else {
        endpoint.write_all(b"ERROR bad request\n")?;
        return Ok(());
    };

    let port = match parse_command(&line) {
        Command::Connect(port) => port,
        Command::BadRequest => {
            endpoint.write_all(b"ERROR bad request\n")?;
            return Ok(());
        }
    };

    let peer = match TcpStream::connect_timeout(
        &format!("127.0.0.1:{port}").parse().unwrap(),
        CONNECT_TIMEOUT,
    ) {
        Ok(s) => s,
        Err(_) => {
            endpoint.write_all(b"ERROR connect failed\n")?;
            return Ok(());
        }
    };

    endpoint.write_all(b"OK\n")?;

    let peer_endpoint: Arc<dyn BridgeEndpoint> = Arc::new(TcpEndpoint::from(peer));
    let (_cancel, handle) = bridge::pipe_bidirectional(Arc::clone(endpoint), peer_endpoint);
    let _ = handle.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_accepts_valid_port() {
        assert_eq!(parse_command("CONNECT 8080\n"), Command::Connect(8080));
        assert_eq!(parse_command("CONNECT 1\r\n"), Command::Connect(1));
    }

    #[test]
    fn test_parse_command_rejects_out_of_range_port() {
        assert_eq!(parse_command("CONNECT 0\n"), Command::BadRequest);
        assert_eq!(parse_command("CONNECT 65536\n"), Command::BadRequest);
    }

    #[test]
    fn test_parse_command_rejects_garbage() {
        assert_eq!(parse_command("HELLO\n"), Command::BadRequest);
        assert_eq!(parse_command("CONNECT abc\n"), Command::BadRequest);
    }

    #[test]
    fn test_full_tunnel_round_trip() {
        use crate::vsock::TcpEndpointListener;
        use std::io::{Read as _, Write as _};
        use std::net::TcpListener;
        use std::net::TcpStream as StdTcpStream;
        use std::thread;
        use std::time::Duration;

        // The "loopback TCP service inside the guest" that T dials.
        let echo_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let echo_port = echo_listener.local_addr().unwrap().port();
        thread::spawn(move || {
            if let Ok((mut s, _)) = echo_listener.accept() {
                let mut buf = [0u8; 64];
                if let Ok(n) = s.read(&mut buf) {
                    let _ = s.write_all(&buf[..n]);
                }
            }
        });

        let tunnel_listener = TcpEndpointListener::bind("127.0.0.1:0").unwrap();
        let addr = tunnel_listener.local_addr().unwrap();
        let server = TunnelServer::new();
        thread::spawn(move || server.serve(Box::new(tunnel_listener)));
        thread::sleep(Duration::from_millis(30));

        let mut client = StdTcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(format!("CONNECT {echo_port}\n").as_bytes()).unwrap();

        let mut ack = [0u8; 3];
        client.read_exact(&mut ack).unwrap();
        assert_eq!(&ack, b"OK\n");

        client.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[test]
    fn test_bad_command_gets_error_reply() {
        use crate::vsock::TcpEndpointListener;
        use std::io::{Read as _, Write as _};
        use std::net::TcpStream as StdTcpStream;
        use std::thread;
        use std::time::Duration;

        let listener = TcpEndpointListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = TunnelServer::new();
        thread::spawn(move || server.serve(Box::new(listener)));
        thread::sleep(Duration::from_millis(30));

        let mut client = StdTcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(b"nonsense\n").unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "ERROR bad request\n");
    }

    #[test]
    fn test_connect_refused_gets_error_reply() {
        use crate::vsock::TcpEndpointListener;
        use std::io::{Read as _, Write as _};
        use std::net::TcpStream as StdTcpStream;
        use std::thread;
        use std::time::Duration;

        let listener = TcpEndpointListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = TunnelServer::new();
        thread::spawn(move || server.serve(Box::new(listener)));
        thread::sleep(Duration::from_millis(30));

        // Port 1 is virtually guaranteed closed on loopback in CI sandboxes.
        let mut client = StdTcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"CONNECT 1\n").unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "ERROR connect failed\n");
    }
}
