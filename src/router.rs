//! Component R: the request router.
//!
//! One dedicated thread per accepted connection, spawned from a blocking
//! `accept()` loop, the same "accept loop on its own thread, worker per
//! connection" shape used by the event and tunnel servers. The wire parser
//! is hand-rolled: no HTTP crate earns its keep for a single-request,
//! no-pipelining, no-keep-alive server with nine routes.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};
use percent_encoding::percent_decode_str;
use serde_derive::{Deserialize, Serialize};
use serde_json::json;

use crate::bridge::{classify_io_error, ErrorClass};
use crate::queue::{FilesResponse, OutgoingFiles, PendingUrls, UrlsResponse};
use crate::vsock::{BridgeEndpoint, EndpointListener};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_PATH_BYTES: usize = 8 * 1024;
const READ_CHUNK: usize = 4096;

/// The guest clipboard, specified only via this contract: the real
/// integration (reading/writing the windowing system's clipboard) lives
/// outside this crate.
pub trait ClipboardAdapter: Send + Sync {
    /// Fetch the current clipboard contents, if any.
    fn get(&self) -> anyhow::Result<Option<String>>;
    /// Replace the clipboard contents.
    fn set(&self, content: String) -> anyhow::Result<()>;
}

/// Stand-in used when no real clipboard integration is wired up: always
/// reports empty, accepts writes as no-ops.
pub struct NoopClipboardAdapter;

impl ClipboardAdapter for NoopClipboardAdapter {
    fn get(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn set(&self, _content: String) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Notified once a streamed upload has landed on disk, so the out-of-scope
/// reveal/notify integration can surface it to the user. A no-op default
/// is used when nothing is wired up.
pub trait UploadNotifier: Send + Sync {
    /// Called once `path` has been fully written to disk.
    fn notify(&self, path: &Path);
}

/// Stand-in used when no reveal/notify integration is wired up.
pub struct NoopUploadNotifier;

impl UploadNotifier for NoopUploadNotifier {
    fn notify(&self, _path: &Path) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
}

type Headers = HashMap<String, String>;

struct RequestHead {
    method: Method,
    path: String,
    headers: Headers,
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
    extra_headers: Vec<(String, String)>,
}

impl Response {
    fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
            extra_headers: Vec::new(),
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
            extra_headers: Vec::new(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, json!({ "error": message }))
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

fn write_response(endpoint: &dyn BridgeEndpoint, resp: &Response) -> io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: {}\r\nConnection: close\r\n",
        resp.status,
        reason_phrase(resp.status),
        resp.body.len(),
        resp.content_type,
    );
    for (name, value) in &resp.extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    endpoint.write_all(head.as_bytes())?;
    if !resp.body.is_empty() {
        endpoint.write_all(&resp.body)?;
    }
    Ok(())
}

/// Read from `endpoint` until the header terminator is seen, returning the
/// header bytes (without the terminator) and whatever body bytes were read
/// past it in the same chunk. Rejects header blocks over 64 KiB.
fn read_head(endpoint: &dyn BridgeEndpoint) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(pos) = find_terminator(&buf) {
            let head = buf[..pos].to_vec();
            let rest = buf[pos + 4..].to_vec();
            return Ok(Some((head, rest)));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Ok(None);
        }
        let n = endpoint.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Option<RequestHead> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = Method::parse(parts.next()?)?;
    let path = parts.next()?.to_string();
    if path.len() > MAX_PATH_BYTES {
        return None;
    }
    if parts.next()? != "HTTP/1.1" {
        return None;
    }

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Some(RequestHead {
        method,
        path,
        headers,
    })
}

fn content_length(headers: &Headers) -> Option<usize> {
    headers.get("content-length").and_then(|v| v.parse().ok())
}

/// Read exactly `len` bytes of body, `leftover` first, then more from the
/// endpoint.
fn read_body(endpoint: &dyn BridgeEndpoint, leftover: Vec<u8>, len: usize) -> io::Result<Vec<u8>> {
    let mut body = leftover;
    let mut chunk = [0u8; READ_CHUNK];
    while body.len() < len {
        let want = (len - body.len()).min(chunk.len());
        let n = endpoint.read(&mut chunk[..want])?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(len);
    Ok(body)
}

/// Stream exactly `len` bytes of body straight to `file`, `leftover`
/// first. Used by the upload-receive path so the whole file is never held
/// in memory at once.
fn stream_body_to_file(
    endpoint: &dyn BridgeEndpoint,
    leftover: Vec<u8>,
    len: usize,
    file: &mut File,
) -> io::Result<()> {
    let mut written = 0usize;
    if !leftover.is_empty() {
        let take = leftover.len().min(len);
        file.write_all(&leftover[..take])?;
        written += take;
    }
    let mut chunk = [0u8; READ_CHUNK];
    while written < len {
        let want = (len - written).min(chunk.len());
        let n = endpoint.read(&mut chunk[..want])?;
        if n == 0 {
            break;
        }
        file.write_all(&chunk[..n])?;
        written += n;
    }
    if written < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("peer closed after {written} of {len} declared bytes"),
        ));
    }
    Ok(())
}

#[derive(Deserialize)]
struct ClipboardBody {
    content: String,
}

#[derive(Serialize)]
struct ClipboardResponse {
    content: String,
}

/// Shared state handed to every connection handler.
pub struct RouterServer {
    version: &'static str,
    downloads_dir: PathBuf,
    clipboard: Arc<dyn ClipboardAdapter>,
    upload_notifier: Arc<dyn UploadNotifier>,
    files: Arc<OutgoingFiles>,
    urls: Arc<PendingUrls>,
    stopped: Arc<AtomicBool>,
}

impl RouterServer {
    /// Construct a router with the given collaborators.
    pub fn new(
        downloads_dir: PathBuf,
        clipboard: Arc<dyn ClipboardAdapter>,
        upload_notifier: Arc<dyn UploadNotifier>,
        files: Arc<OutgoingFiles>,
        urls: Arc<PendingUrls>,
    ) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            downloads_dir,
            clipboard,
            upload_notifier,
            files,
            urls,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the accept loop until `shutdown` is called or the listener
    /// errors out fatally. Blocks the calling thread.
    pub fn serve(self: &Arc<Self>, listener: Box<dyn EndpointListener>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok(endpoint) => {
                    let server = Arc::clone(self);
                    thread::spawn(move || server.handle_connection(endpoint.into()));
                }
                Err(e) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    match classify_io_error(&e) {
                        ErrorClass::Operational => continue,
                        ErrorClass::Fatal => {
                            warn!("request router accept failed fatally: {e}");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Stop accepting new connections. In-flight connections finish normally.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn handle_connection(&self, endpoint: Arc<dyn BridgeEndpoint>) {
        if let Err(e) = self.handle_connection_inner(&*endpoint) {
            debug!("request router connection ended with an error: {e}");
        }
        let _ = endpoint.close();
    }

    fn handle_connection_inner(&self, endpoint: &dyn BridgeEndpoint) -> io::Result<()> {
        let (head, leftover) = match read_head(endpoint)? {
            Some(v) => v,
            None => {
                return write_response(
                    endpoint,
                    &Response::error(400, "Invalid HTTP request"),
                )
            }
        };

        let parsed = match parse_head(&head) {
            Some(p) => p,
            None => {
                return write_response(
                    endpoint,
                    &Response::error(400, "Invalid HTTP request"),
                )
            }
        };

        let response = self.dispatch(endpoint, parsed, leftover)?;
        write_response(endpoint, &response)
    }

    fn dispatch(
        &self,
        endpoint: &dyn BridgeEndpoint,
        req: RequestHead,
        leftover: Vec<u8>,
    ) -> io::Result<Response> {
        let RequestHead {
            method,
            path,
            headers,
        } = req;

        // Exact-match routes are tried before the file-download prefix
        // route, so `/api/v1/files/receive` can never be shadowed by it.
        match path.as_str() {
            "/health" => {
                return Ok(match method {
                    Method::Get => Response::json(
                        200,
                        json!({ "status": "ok", "version": self.version }),
                    ),
                    _ => Response::error(405, "Method Not Allowed"),
                });
            }
            "/api/v1/clipboard" => {
                return self.handle_clipboard(endpoint, method, headers, leftover);
            }
            "/api/v1/files" => {
                return Ok(match method {
                    Method::Get => Response::json(
                        200,
                        serde_json::to_value(FilesResponse {
                            files: self.files.list(),
                        })
                        .unwrap(),
                    ),
                    Method::Delete => {
                        self.files.clear();
                        Response::empty(200)
                    }
                    Method::Post => Response::error(405, "Method Not Allowed"),
                });
            }
            "/api/v1/files/receive" => {
                return match method {
                    Method::Post => self.handle_receive(endpoint, &headers, leftover),
                    _ => Ok(Response::error(405, "Method Not Allowed")),
                };
            }
            "/api/v1/urls" => {
                return Ok(match method {
                    Method::Get => Response::json(
                        200,
                        serde_json::to_value(UrlsResponse {
                            urls: self.urls.pop_all(),
                        })
                        .unwrap(),
                    ),
                    Method::Delete => {
                        self.urls.clear();
                        Response::empty(200)
                    }
                    Method::Post => Response::error(405, "Method Not Allowed"),
                });
            }
            _ => {}
        }

        if let Some(encoded) = path.strip_prefix("/api/v1/files/") {
            return Ok(match method {
                Method::Get => self.handle_download(encoded),
                _ => Response::error(405, "Method Not Allowed"),
            });
        }

        Ok(Response::error(404, "Not Found"))
    }

    fn handle_clipboard(
        &self,
        endpoint: &dyn BridgeEndpoint,
        method: Method,
        headers: Headers,
        leftover: Vec<u8>,
    ) -> io::Result<Response> {
        match method {
            Method::Get => Ok(match self.clipboard.get() {
                Ok(Some(content)) => {
                    Response::json(200, serde_json::to_value(ClipboardResponse { content }).unwrap())
                }
                Ok(None) => Response::empty(204),
                Err(e) => {
                    warn!("clipboard read failed: {e:#}");
                    Response::error(500, "clipboard adapter failure")
                }
            }),
            Method::Post => {
                let len = content_length(&headers).unwrap_or(0);
                let body = read_body(endpoint, leftover, len)?;
                let parsed: Result<ClipboardBody, _> = serde_json::from_slice(&body);
                Ok(match parsed {
                    Ok(ClipboardBody { content }) => match self.clipboard.set(content) {
                        Ok(()) => Response::empty(200),
                        Err(e) => {
                            warn!("clipboard write failed: {e:#}");
                            Response::error(500, "clipboard adapter failure")
                        }
                    },
                    Err(_) => Response::error(400, "invalid JSON body"),
                })
            }
            Method::Delete => Ok(Response::error(405, "Method Not Allowed")),
        }
    }

    fn handle_receive(
        &self,
        endpoint: &dyn BridgeEndpoint,
        headers: &Headers,
        leftover: Vec<u8>,
    ) -> io::Result<Response> {
        let Some(filename) = headers.get("x-filename") else {
            return Ok(Response::error(400, "missing X-Filename header"));
        };
        let Some(len) = content_length(headers) else {
            return Ok(Response::error(400, "missing Content-Length header"));
        };

        let basename = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.clone());
        if basename.is_empty() {
            return Ok(Response::error(400, "empty filename"));
        }

        if let Err(e) = fs::create_dir_all(&self.downloads_dir) {
            warn!("failed to create downloads directory: {e}");
            return Ok(Response::error(500, "could not prepare downloads directory"));
        }

        let dest = self.downloads_dir.join(&basename);
        let mut file = match File::create(&dest) {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to create upload destination {dest:?}: {e}");
                return Ok(Response::error(500, "could not create destination file"));
            }
        };

        if let Err(e) = stream_body_to_file(endpoint, leftover, len, &mut file) {
            warn!("upload write failed: {e}");
            drop(file);
            let _ = fs::remove_file(&dest);
            return Err(e);
        }
        drop(file);

        info!("received upload: {}", dest.display());
        self.upload_notifier.notify(&dest);

        Ok(Response::json(
            200,
            json!({ "path": dest.to_string_lossy() }),
        ))
    }

    fn handle_download(&self, encoded_path: &str) -> Response {
        if encoded_path.is_empty() {
            return Response::error(400, "empty path");
        }
        let decoded = match percent_decode_str(encoded_path).decode_utf8() {
            Ok(d) => d.into_owned(),
            Err(_) => return Response::error(400, "path is not valid UTF-8"),
        };

        match fs::read(&decoded) {
            Ok(body) => {
                let basename = Path::new(&decoded)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| decoded.clone());
                Response {
                    status: 200,
                    content_type: "application/octet-stream",
                    body,
                    extra_headers: vec![(
                        "Content-Disposition".to_string(),
                        format!("attachment; filename=\"{basename}\""),
                    )],
                }
            }
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => Response::error(404, "Not Found"),
                io::ErrorKind::PermissionDenied => Response::error(403, "Forbidden"),
                _ => Response::error(500, "could not read file"),
            },
        }
    }
}
