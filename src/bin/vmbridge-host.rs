//! Host-side half of the tunnel: a thin TCP listener that dials the
//! guest's tunnel server (component T) over vsock for every accepted
//! connection, speaks the `CONNECT <port>\n` handshake, then bridges the
//! two sockets with the same primitive the guest side uses.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use vmbridge::bridge::{self, classify_io_error, ErrorClass};
use vmbridge::vsock::{BridgeEndpoint, TcpEndpoint, VsockAddress, VsockEndpoint};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// vsock context id of the guest to connect to
    #[clap(long)]
    cid: u32,
    /// vsock port the guest's tunnel server is bound to
    #[clap(long, default_value_t = 5001)]
    tunnel_port: u32,
    /// Loopback port inside the guest to reach, passed in the `CONNECT`
    /// handshake
    #[clap(long)]
    guest_port: u16,
    /// Local address to listen for TCP connections on
    #[clap(long, default_value = "127.0.0.1:0")]
    listen: String,
}

fn read_reply_line(endpoint: &dyn BridgeEndpoint) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match endpoint.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn handle_connection(local: TcpStream, guest_cid: u32, tunnel_port: u32, guest_port: u16) -> Result<()> {
    let vsock_endpoint: Arc<dyn BridgeEndpoint> =
        Arc::new(VsockEndpoint::connect(VsockAddress::new(guest_cid, tunnel_port))
            .context("failed to dial guest tunnel server")?);

    vsock_endpoint
        .write_all(format!("CONNECT {guest_port}\n").as_bytes())
        .context("failed to send CONNECT handshake")?;

    let reply = read_reply_line(&*vsock_endpoint).context("failed to read handshake reply")?;
    if reply != "OK" {
        bail!("guest tunnel server refused connection: {reply}");
    }

    let local_endpoint: Arc<dyn BridgeEndpoint> = Arc::new(TcpEndpoint::from(local));
    let (_cancel, handle) = bridge::pipe_bidirectional(local_endpoint, vsock_endpoint);
    let _ = handle.join();
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .default_format()
        .try_init()
        .context("Failed to init env_logger")?;

    let args = Args::parse();
    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(
        "listening on {}, forwarding to guest cid {} port {}",
        listener.local_addr()?,
        args.cid,
        args.guest_port
    );

    for conn in listener.incoming() {
        let stream = match conn {
            Ok(s) => s,
            Err(e) => match classify_io_error(&e) {
                ErrorClass::Operational => continue,
                ErrorClass::Fatal => return Err(e).context("accept failed fatally"),
            },
        };

        let cid = args.cid;
        let tunnel_port = args.tunnel_port;
        let guest_port = args.guest_port;
        thread::spawn(move || {
            if let Err(e) = handle_connection(stream, cid, tunnel_port, guest_port) {
                warn!("tunnel session failed: {e:#}");
            }
        });
    }

    Ok(())
}
