//! Component E: the event push server.
//!
//! A single subscriber slot, guarded by one mutex, is the only shared
//! mutable state between event producers (Q and U mutations, plus ad-hoc
//! log lines) and the accept/disconnect threads. The accept loop always
//! runs on its own dedicated thread: listen-readiness for this transport
//! is not visible to a reactor on the guest platform, so there is no
//! cooperative-reactor option here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};
use serde_derive::Serialize;

use crate::bridge::{classify_io_error, ErrorClass};
use crate::queue::EventSink;
use crate::vsock::{BridgeEndpoint, EndpointListener};

/// Wire shape of a pushed event.
#[derive(Serialize)]
#[serde(tag = "type")]
enum PushEvent {
    #[serde(rename = "files")]
    Files { files: Vec<String> },
    #[serde(rename = "urls")]
    Urls { urls: Vec<String> },
    #[serde(rename = "log")]
    Log { message: String },
}

type Subscriber = Arc<Mutex<Option<Arc<dyn BridgeEndpoint>>>>;

/// Handle producers use to push events. Cheaply cloneable; implements
/// `EventSink` so Q and U can hold one without knowing about the server.
#[derive(Clone)]
pub struct Pusher {
    subscriber: Subscriber,
}

impl Pusher {
    fn push_line(&self, event: &PushEvent) {
        // Never blocks on there being no subscriber, and never buffers or
        // retries: a push with nobody listening is simply dropped.
        let guard = self.subscriber.lock().unwrap();
        let Some(endpoint) = guard.as_ref() else {
            return;
        };
        let mut line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to serialize push event: {e}");
                return;
            }
        };
        line.push('\n');
        if let Err(e) = endpoint.write_all(line.as_bytes()) {
            // The disconnect-detection thread will notice and clear the
            // slot; we don't do it here to avoid a second mutex
            // acquisition in the hot path.
            debug!("push to subscriber failed (will be reaped): {e}");
        }
    }

    /// Push a free-form log line to the subscriber, if any.
    pub fn push_log(&self, message: impl Into<String>) {
        self.push_line(&PushEvent::Log {
            message: message.into(),
        });
    }
}

impl EventSink for Pusher {
    fn push_files(&self, files: Vec<String>) {
        self.push_line(&PushEvent::Files { files });
    }

    fn push_urls(&self, urls: Vec<String>) {
        self.push_line(&PushEvent::Urls { urls });
    }
}

/// The event push server itself: owns the subscriber slot and the accept
/// loop that fills it, enforcing the single-subscriber rule.
pub struct EventServer {
    subscriber: Subscriber,
    stopped: Arc<AtomicBool>,
}

impl EventServer {
    /// Construct a server and the `Pusher` handle that shares its
    /// subscriber slot.
    pub fn new() -> (Self, Pusher) {
        let subscriber: Subscriber = Arc::new(Mutex::new(None));
        let server = Self {
            subscriber: Arc::clone(&subscriber),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        (server, Pusher { subscriber })
    }

    /// Run the accept loop until `shutdown` is called or the listener
    /// itself errors out fatally. Blocks the calling thread; callers
    /// should invoke this from its own dedicated thread.
    pub fn serve(&self, listener: Box<dyn EndpointListener>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            match listener.accept() {
                Ok(endpoint) => self.install_subscriber(Arc::from(endpoint)),
                Err(e) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    match classify_io_error(&e) {
                        ErrorClass::Operational => continue,
                        ErrorClass::Fatal => {
                            warn!("event server accept failed fatally: {e}");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Stop accepting new subscribers and drop the current one, if any.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(old) = self.subscriber.lock().unwrap().take() {
            let _ = old.close();
        }
    }

    /// Install a newly accepted connection as the subscriber, evicting
    /// whoever was previously connected, then spawn the one-byte-at-a-time
    /// disconnect probe thread.
    fn install_subscriber(&self, endpoint: Arc<dyn BridgeEndpoint>) {
        {
            let mut guard = self.subscriber.lock().unwrap();
            if let Some(old) = guard.take() {
                let _ = old.close();
            }
            *guard = Some(Arc::clone(&endpoint));
        }

        let subscriber = Arc::clone(&self.subscriber);
        thread::spawn(move || {
            let mut probe = [0u8; 1];
            loop {
                match endpoint.read(&mut probe) {
                    Ok(0) | Err(_) => break,
                    // The protocol is guest-to-host only; any bytes the
                    // host sends back are simply discarded.
                    Ok(_) => continue,
                }
            }
            let mut guard = subscriber.lock().unwrap();
            if let Some(current) = guard.as_ref() {
                if Arc::ptr_eq(current, &endpoint) {
                    *guard = None;
                }
            }
        });
    }
}
