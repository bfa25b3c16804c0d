//! Components Q and U: the outgoing-file queue and the pending-URL queue.
//!
//! Both are small mutex-guarded stores. `router.rs` and `events.rs` each
//! hold an `Arc` to the same `OutgoingFiles`/`PendingUrls`, and mutations
//! push through an `EventSink` handle rather than reaching into global
//! state.

use std::sync::{Arc, Mutex};

use serde_derive::Serialize;

/// Sink for the events Q and U mutations must push (component E).
///
/// `events::Pusher` is the real implementation; tests use a
/// `Vec`-collecting fake.
pub trait EventSink: Send + Sync {
    /// Push the full current contents of Q.
    fn push_files(&self, files: Vec<String>);
    /// Push newly enqueued URLs from U.
    fn push_urls(&self, urls: Vec<String>);
}

/// An `EventSink` that drops every event. Used where a queue is
/// constructed before its event server, or in tests that don't care about
/// the push side.
pub struct NullSink;

impl EventSink for NullSink {
    fn push_files(&self, _files: Vec<String>) {}
    fn push_urls(&self, _urls: Vec<String>) {}
}

/// Component Q: the outgoing-file queue.
///
/// Entries are deduplicated by exact path string and ordered by insertion;
/// no I/O happens while the internal mutex is held.
pub struct OutgoingFiles {
    entries: Mutex<Vec<String>>,
    sink: Arc<dyn EventSink>,
}

impl OutgoingFiles {
    /// Construct an empty queue that pushes through `sink`.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink,
        }
    }

    /// Return the current queue contents in insertion order.
    pub fn list(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Add paths, deduplicating by exact string match and preserving
    /// insertion order. Always emits a `files` event with the resulting
    /// full list, even if nothing was newly added: subscribers see current
    /// state, not a delta.
    pub fn enqueue(&self, paths: Vec<String>) {
        let snapshot = {
            let mut entries = self.entries.lock().unwrap();
            for path in paths {
                if !entries.contains(&path) {
                    entries.push(path);
                }
            }
            entries.clone()
        };
        self.sink.push_files(snapshot);
    }

    /// Remove a single entry by exact path match, if present.
    pub fn remove(&self, path: &str) {
        let snapshot = {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|p| p != path);
            entries.clone()
        };
        self.sink.push_files(snapshot);
    }

    /// Clear all entries.
    pub fn clear(&self) {
        {
            let mut entries = self.entries.lock().unwrap();
            entries.clear();
        }
        self.sink.push_files(Vec::new());
    }
}

/// Component U: the pending-URL queue.
///
/// FIFO; `GET /api/v1/urls` maps directly to `pop_all`, an atomic
/// swap-with-empty so no URL visible at the start of the call can be both
/// missing from the response and still present in U afterwards.
pub struct PendingUrls {
    entries: Mutex<Vec<String>>,
    sink: Arc<dyn EventSink>,
}

impl PendingUrls {
    /// Construct an empty queue that pushes through `sink`.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink,
        }
    }

    /// Append a URL and push a `urls` event carrying just the new entry.
    pub fn enqueue(&self, url: String) {
        {
            let mut entries = self.entries.lock().unwrap();
            entries.push(url.clone());
        }
        self.sink.push_urls(vec![url]);
    }

    /// Atomically take and clear all pending URLs.
    pub fn pop_all(&self) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        std::mem::take(&mut *entries)
    }

    /// Clear without returning the contents.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.clear();
    }
}

/// Wire shape of the `files` and `urls` JSON responses.
#[derive(Serialize)]
pub struct FilesResponse {
    /// Current contents of Q, in insertion order.
    pub files: Vec<String>,
}

#[derive(Serialize)]
pub struct UrlsResponse {
    /// URLs drained from U by this call.
    pub urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CollectingSink {
        files: StdMutex<Vec<Vec<String>>>,
        urls: StdMutex<Vec<Vec<String>>>,
    }

    impl EventSink for CollectingSink {
        fn push_files(&self, files: Vec<String>) {
            self.files.lock().unwrap().push(files);
        }
        fn push_urls(&self, urls: Vec<String>) {
            self.urls.lock().unwrap().push(urls);
        }
    }

    #[test]
    fn test_dedup_preserves_insertion_order() {
        let sink = Arc::new(CollectingSink::default());
        let q = OutgoingFiles::new(sink.clone());
        q.enqueue(vec!["/a".into(), "/a".into(), "/a".into()]);
        assert_eq!(q.list(), vec!["/a".to_string()]);

        q.enqueue(vec!["/b".into(), "/a".into()]);
        assert_eq!(q.list(), vec!["/a".to_string(), "/b".to_string()]);
    }

    #[test]
    fn test_enqueue_emits_full_state() {
        let sink = Arc::new(CollectingSink::default());
        let q = OutgoingFiles::new(sink.clone());
        q.enqueue(vec!["/a".into()]);
        q.enqueue(vec!["/b".into()]);

        let pushes = sink.files.lock().unwrap();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0], vec!["/a".to_string()]);
        assert_eq!(pushes[1], vec!["/a".to_string(), "/b".to_string()]);
    }

    #[test]
    fn test_clear_emits_empty_list() {
        let sink = Arc::new(CollectingSink::default());
        let q = OutgoingFiles::new(sink.clone());
        q.enqueue(vec!["/a".into()]);
        q.clear();
        assert!(q.list().is_empty());
        assert_eq!(*sink.files.lock().unwrap().last().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_url_pop_all_is_atomic_and_fifo() {
        let sink = Arc::new(CollectingSink::default());
        let u = PendingUrls::new(sink);
        u.enqueue("https://a".into());
        u.enqueue("https://b".into());

        let popped = u.pop_all();
        assert_eq!(popped, vec!["https://a".to_string(), "https://b".to_string()]);
        assert!(u.pop_all().is_empty());
    }

    #[test]
    fn test_remove_single_entry() {
        let sink = Arc::new(CollectingSink::default());
        let q = OutgoingFiles::new(sink);
        q.enqueue(vec!["/a".into(), "/b".into()]);
        q.remove("/a");
        assert_eq!(q.list(), vec!["/b".to_string()]);
    }
}
