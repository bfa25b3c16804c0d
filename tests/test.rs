//! End-to-end coverage across the router, event, and tunnel servers
//! together, over real loopback `TcpListener`s standing in for vsock:
//! spinning up actual AF_VSOCK sockets needs a hypervisor context this
//! test environment doesn't have. Per-module unit tests already cover
//! each server in isolation; these exercise the seed scenarios as a
//! caller driving the whole stack would see them.

use std::io::{BufRead, BufReader, Read as _, Write as _};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rstest::rstest;
use test_log::test;

use vmbridge::bridge;
use vmbridge::queue::NullSink;
use vmbridge::queue::{OutgoingFiles, PendingUrls};
use vmbridge::tunnel::TunnelServer;
use vmbridge::vsock::{BridgeEndpoint, EndpointListener, TcpEndpointListener};

mod helpers;
use helpers::{raw_request, raw_request_with_body, spawn_stack};

#[test]
fn s1_health_check() {
    let stack = spawn_stack(tempfile::tempdir().unwrap().into_path());
    let resp = raw_request(
        stack.router_addr,
        "GET /health HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    assert!(resp.starts_with("HTTP/1.1 200 OK"));
    let body = resp.split("\r\n\r\n").nth(1).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(parsed["status"], "ok");
    assert!(parsed["version"].as_str().unwrap().len() > 0);
}

#[test]
fn s2_clipboard_round_trip() {
    let stack = spawn_stack(tempfile::tempdir().unwrap().into_path());

    let body = r#"{"content":"hello"}"#;
    let req = format!(
        "POST /api/v1/clipboard HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let resp = raw_request(stack.router_addr, &req);
    assert!(resp.starts_with("HTTP/1.1 200 OK"));

    // NoopClipboardAdapter always reports empty; the real integration is
    // wired up outside this crate, so this checks the wire contract, not
    // genuine persistence.
    let resp = raw_request(stack.router_addr, "GET /api/v1/clipboard HTTP/1.1\r\n\r\n");
    assert!(resp.starts_with("HTTP/1.1 204 No Content"));
}

#[test]
fn s3_file_receive_one_mebibyte() {
    let dir = tempfile::tempdir().unwrap();
    let stack = spawn_stack(dir.path().to_path_buf());

    let payload = vec![0xABu8; 1024 * 1024];
    let head = format!(
        "POST /api/v1/files/receive HTTP/1.1\r\nX-Filename: report.pdf\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    );
    let resp = raw_request_with_body(stack.router_addr, &head, &payload);
    assert!(resp.starts_with("HTTP/1.1 200 OK"));

    let dest = dir.path().join("report.pdf");
    assert!(resp.contains(&dest.to_string_lossy().to_string()));

    let on_disk = std::fs::read(&dest).unwrap();
    assert_eq!(on_disk.len(), 1024 * 1024);
    assert!(on_disk.iter().all(|&b| b == 0xAB));
}

#[test]
fn s3_file_receive_truncated_upload_is_rejected() {
    use std::net::Shutdown;

    let dir = tempfile::tempdir().unwrap();
    let stack = spawn_stack(dir.path().to_path_buf());

    let declared_len = 1024 * 1024;
    let actual_body = vec![0xABu8; 1024];
    let head = format!(
        "POST /api/v1/files/receive HTTP/1.1\r\nX-Filename: partial.pdf\r\nContent-Length: {declared_len}\r\n\r\n"
    );

    let mut stream = TcpStream::connect(stack.router_addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(head.as_bytes()).unwrap();
    stream.write_all(&actual_body).unwrap();
    // Half-close: the router has declared Content-Length bytes to read but
    // will never see them, the same way a dropped upload connection would.
    stream.shutdown(Shutdown::Write).unwrap();

    let mut resp = String::new();
    let _ = stream.read_to_string(&mut resp);
    assert!(
        !resp.starts_with("HTTP/1.1 200"),
        "truncated upload must not be reported as success, got: {resp:?}"
    );

    let dest = dir.path().join("partial.pdf");
    assert!(
        !dest.exists(),
        "truncated upload must be cleaned up, not left on disk"
    );
}

#[test]
fn s4_url_drain() {
    let stack = spawn_stack(tempfile::tempdir().unwrap().into_path());

    stack.urls.enqueue("https://a".to_string());
    stack.urls.enqueue("https://b".to_string());

    let resp = raw_request(stack.router_addr, "GET /api/v1/urls HTTP/1.1\r\n\r\n");
    assert!(resp.contains(r#""urls":["https://a","https://b"]"#));

    let resp = raw_request(stack.router_addr, "GET /api/v1/urls HTTP/1.1\r\n\r\n");
    assert!(resp.contains(r#""urls":[]"#));
}

#[test]
fn s5_tunnel_happy_path() {
    use std::net::TcpListener;

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

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client
        .write_all(format!("CONNECT {echo_port}\n").as_bytes())
        .unwrap();

    let mut ack = [0u8; 3];
    client.read_exact(&mut ack).unwrap();
    assert_eq!(&ack, b"OK\n");

    client.write_all(b"ping").unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping");

    // Closing the host end should let the bridge threads, and the guest
    // loopback socket, wind down without leaking.
    drop(client);
}

#[test]
fn s6_tunnel_bad_port() {
    let listener = TcpEndpointListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = TunnelServer::new();
    thread::spawn(move || server.serve(Box::new(listener)));
    thread::sleep(Duration::from_millis(30));

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.write_all(b"CONNECT 0\n").unwrap();

    let mut reply = String::new();
    client.read_to_string(&mut reply).unwrap();
    assert_eq!(reply, "ERROR bad request\n");
}

#[test]
fn s7_event_push_on_file_enqueue() {
    let dir = tempfile::tempdir().unwrap();
    let stack = spawn_stack(dir.path().to_path_buf());

    let mut s1 = TcpStream::connect(stack.events_addr).unwrap();
    s1.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    thread::sleep(Duration::from_millis(50));

    stack.files.enqueue(vec!["/tmp/report.pdf".to_string()]);

    let mut reader1 = BufReader::new(&mut s1);
    let mut line = String::new();
    reader1.read_line(&mut line).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(parsed["type"], "files");
    assert_eq!(parsed["files"], serde_json::json!(["/tmp/report.pdf"]));

    // A second subscriber evicts the first.
    let mut s2 = TcpStream::connect(stack.events_addr).unwrap();
    thread::sleep(Duration::from_millis(50));

    let mut buf = [0u8; 1];
    let n = s1.read(&mut buf).unwrap();
    assert_eq!(n, 0, "first subscriber should observe EOF after eviction");

    stack.files.clear();
    let mut reader2 = BufReader::new(&mut s2);
    let mut line2 = String::new();
    reader2.read_line(&mut line2).unwrap();
    let parsed2: serde_json::Value = serde_json::from_str(line2.trim_end()).unwrap();
    assert_eq!(parsed2["type"], "files");
    assert_eq!(parsed2["files"], serde_json::json!([]));
}

/// Invariant 1/2/3 together, but driven across real loopback sockets
/// rather than the in-process fakes `bridge.rs`'s unit tests use, as a
/// sanity check that the abstraction holds up end-to-end.
#[test]
fn bridge_completeness_and_cancellation_over_real_sockets() {
    let listener_a = TcpEndpointListener::bind("127.0.0.1:0").unwrap();
    let addr_a = listener_a.local_addr().unwrap();
    let listener_b = TcpEndpointListener::bind("127.0.0.1:0").unwrap();
    let addr_b = listener_b.local_addr().unwrap();

    let client_a = TcpStream::connect(addr_a).unwrap();
    let client_b = TcpStream::connect(addr_b).unwrap();
    let server_a: Arc<dyn BridgeEndpoint> = listener_a.accept().unwrap().into();
    let server_b: Arc<dyn BridgeEndpoint> = listener_b.accept().unwrap().into();

    let (cancel, handle) = bridge::pipe_bidirectional(server_a, server_b);

    let mut client_a = client_a;
    let mut client_b = client_b;
    client_a.write_all(b"hello-from-a").unwrap();
    drop(client_a);

    let mut received = Vec::new();
    client_b.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut chunk = [0u8; 64];
    loop {
        match client_b.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
        }
    }
    assert_eq!(received, b"hello-from-a");

    drop(client_b);
    let result = bridge::cancel_and_join(cancel, handle);
    assert!(result.is_ok());
}

/// Invariant 4 (route dispatch) as a parameterized table, covering the
/// cross-product of every registered path with a method it doesn't
/// support, plus the 404 fallthrough.
#[rstest]
#[case("/health", "POST", 405)]
#[case("/api/v1/clipboard", "DELETE", 405)]
#[case("/api/v1/files", "POST", 405)]
#[case("/api/v1/urls", "POST", 405)]
#[case("/api/v1/files/receive", "GET", 405)]
#[case("/not/a/real/route", "GET", 404)]
fn route_dispatch_table(#[case] path: &str, #[case] method: &str, #[case] expected_status: u16) {
    let stack = spawn_stack(tempfile::tempdir().unwrap().into_path());
    let resp = raw_request(
        stack.router_addr,
        &format!("{method} {path} HTTP/1.1\r\n\r\n"),
    );
    assert!(resp.starts_with(&format!("HTTP/1.1 {expected_status}")));
}

/// Invariant 6: dedup by exact path, preserving insertion order, exercised
/// with a table of duplicate-laden inputs.
#[rstest]
#[case(vec!["/a", "/a", "/a"], vec!["/a"])]
#[case(vec!["/a", "/b", "/a"], vec!["/a", "/b"])]
#[case(vec!["/a", "/b", "/c"], vec!["/a", "/b", "/c"])]
fn file_queue_dedup_table(#[case] input: Vec<&str>, #[case] expected: Vec<&str>) {
    let q = OutgoingFiles::new(Arc::new(NullSink));
    q.enqueue(input.into_iter().map(String::from).collect());
    let expected: Vec<String> = expected.into_iter().map(String::from).collect();
    assert_eq!(q.list(), expected);
}

/// Invariant 5: URL-queue drain is atomic — nothing enqueued before the
/// drain starts is both missing from its result and still present after.
#[test]
fn url_queue_drain_is_atomic() {
    let u = PendingUrls::new(Arc::new(NullSink));
    u.enqueue("https://a".to_string());
    u.enqueue("https://b".to_string());

    let drained = u.pop_all();
    assert_eq!(drained, vec!["https://a".to_string(), "https://b".to_string()]);
    assert!(u.pop_all().is_empty());
}
