use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vmbridge::events::EventServer;
use vmbridge::queue::{EventSink, OutgoingFiles, PendingUrls};
use vmbridge::router::{NoopClipboardAdapter, NoopUploadNotifier, RouterServer};
use vmbridge::vsock::{EndpointListener, TcpEndpointListener};

/// A full R + E stack, wired together the same way
/// `lifecycle::ServerSupervisor` wires it, but bound to loopback TCP
/// instead of vsock: these tests run outside a hypervisor, and
/// `TcpEndpointListener`/`VsockEndpointListener` implement the same
/// `EndpointListener` shape, so the servers can't tell the difference.
pub struct Stack {
    pub router_addr: SocketAddr,
    pub events_addr: SocketAddr,
    pub files: Arc<OutgoingFiles>,
    pub urls: Arc<PendingUrls>,
}

/// Bring up the router and event servers on OS-assigned loopback ports and
/// return a handle to the shared queues. Server threads run for the
/// lifetime of the test process.
pub fn spawn_stack(downloads_dir: PathBuf) -> Stack {
    let (event_server, pusher) = EventServer::new();
    let pusher: Arc<dyn EventSink> = Arc::new(pusher);

    let files = Arc::new(OutgoingFiles::new(Arc::clone(&pusher)));
    let urls = Arc::new(PendingUrls::new(Arc::clone(&pusher)));

    let router = Arc::new(RouterServer::new(
        downloads_dir,
        Arc::new(NoopClipboardAdapter),
        Arc::new(NoopUploadNotifier),
        Arc::clone(&files),
        Arc::clone(&urls),
    ));

    let router_listener = TcpEndpointListener::bind("127.0.0.1:0").unwrap();
    let router_addr = router_listener.local_addr().unwrap();
    thread::spawn(move || router.serve(Box::new(router_listener)));

    let events_listener = TcpEndpointListener::bind("127.0.0.1:0").unwrap();
    let events_addr = events_listener.local_addr().unwrap();
    thread::spawn(move || event_server.serve(Box::new(events_listener)));

    // Give both accept loops a moment to start listening.
    thread::sleep(Duration::from_millis(30));

    Stack {
        router_addr,
        events_addr,
        files,
        urls,
    }
}

/// Send a raw HTTP/1.1 request over a plain TCP connection to `addr` and
/// return the full response text.
pub fn raw_request(addr: SocketAddr, req: &str) -> String {
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream;

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(req.as_bytes()).unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    out
}

/// Send a raw HTTP/1.1 request with a binary body and return the response
/// text (used for the upload path, where the body isn't valid UTF-8).
pub fn raw_request_with_body(addr: SocketAddr, head: &str, body: &[u8]) -> String {
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream;

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(head.as_bytes()).unwrap();
    stream.write_all(body).unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    out
}
