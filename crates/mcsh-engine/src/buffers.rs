//! Per-invocation buffer store for `save_to` snapshots.
//!
//! A buffer is the complete byte sequence a stage wrote downstream, captured
//! by teeing its output. The store is scoped to one pipeline invocation and
//! never shared across requests. Total captured bytes are bounded; because
//! adjacent `save_to` stages stream concurrently, every in-flight capture
//! reserves its bytes against the cap under the store's lock as it
//! accumulates, so two captures can never jointly overshoot by checking a
//! stale snapshot. An oversized stage fails fast instead of buffering first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mcsh_types::EngineError;

/// Named snapshots captured during one pipeline invocation.
pub struct BufferStore {
    inner: Mutex<Inner>,
    cap: usize,
}

struct Inner {
    map: HashMap<String, Vec<u8>>,
    /// Bytes held by committed snapshots.
    committed: usize,
    /// Bytes reserved by in-flight captures, not yet committed.
    reserved: usize,
}

impl BufferStore {
    /// A store bounded to `cap` total bytes across all buffers.
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                committed: 0,
                reserved: 0,
            }),
            cap,
        }
    }

    /// Bytes still available for capture (committed and reserved excluded).
    pub fn remaining(&self) -> usize {
        let inner = self.inner.lock().expect("buffer store lock poisoned");
        self.cap.saturating_sub(inner.committed + inner.reserved)
    }

    /// Reserve capacity for bytes an in-flight capture is accumulating.
    fn reserve(&self, bytes: usize) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("buffer store lock poisoned");
        if inner.committed + inner.reserved + bytes > self.cap {
            return Err(EngineError::BufferLimitExceeded {
                limit: self.cap as u64,
            });
        }
        inner.reserved += bytes;
        Ok(())
    }

    /// Give back a reservation that will not be committed.
    fn release(&self, bytes: usize) {
        let mut inner = self.inner.lock().expect("buffer store lock poisoned");
        inner.reserved = inner.reserved.saturating_sub(bytes);
    }

    /// Turn a capture's reservation into a committed snapshot.
    fn commit_reserved(
        &self,
        name: &str,
        data: Vec<u8>,
        reserved: usize,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("buffer store lock poisoned");
        inner.reserved = inner.reserved.saturating_sub(reserved);
        let replaced = inner.map.get(name).map(|v| v.len()).unwrap_or(0);
        let committed = inner.committed - replaced + data.len();
        if committed + inner.reserved > self.cap {
            return Err(EngineError::BufferLimitExceeded {
                limit: self.cap as u64,
            });
        }
        inner.committed = committed;
        inner.map.insert(name.to_string(), data);
        Ok(())
    }

    /// Store a completed snapshot in one step. Duplicate names overwrite
    /// (the earlier snapshot's bytes are released against the cap).
    pub fn insert(&self, name: &str, data: Vec<u8>) -> Result<(), EngineError> {
        self.commit_reserved(name, data, 0)
    }

    /// Fetch a snapshot's bytes by name.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().expect("buffer store lock poisoned");
        inner.map.get(name).cloned()
    }

    /// Render the requested names as a JSON object mapping name → contents
    /// (string) or `null` for unknown names. Unknown names produce warnings,
    /// not errors.
    pub fn render(&self, names: &[String]) -> (String, Vec<String>) {
        let inner = self.inner.lock().expect("buffer store lock poisoned");
        let mut warnings = Vec::new();
        let mut object = serde_json::Map::new();
        for name in names {
            match inner.map.get(name) {
                Some(bytes) => {
                    object.insert(
                        name.clone(),
                        serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
                    );
                }
                None => {
                    warnings.push(format!("buffer '{name}' was never saved"));
                    object.insert(name.clone(), serde_json::Value::Null);
                }
            }
        }
        let json = serde_json::Value::Object(object).to_string();
        (json, warnings)
    }
}

/// Accumulates one stage's tee while it streams, then commits to the store.
///
/// Every pushed chunk is reserved against the store's cap first; dropping an
/// uncommitted capture (stage error, cancellation) gives the reservation
/// back.
pub struct Capture {
    name: String,
    data: Vec<u8>,
    reserved: usize,
    store: Arc<BufferStore>,
}

impl Capture {
    pub fn new(name: impl Into<String>, store: Arc<BufferStore>) -> Self {
        Self {
            name: name.into(),
            data: Vec::new(),
            reserved: 0,
            store,
        }
    }

    /// Append a chunk, failing as soon as the store cannot cover it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), EngineError> {
        self.store.reserve(chunk.len())?;
        self.reserved += chunk.len();
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Commit the accumulated bytes under the capture's name.
    pub fn commit(mut self) -> Result<(), EngineError> {
        let data = std::mem::take(&mut self.data);
        let reserved = std::mem::take(&mut self.reserved);
        let store = self.store.clone();
        store.commit_reserved(&self.name, data, reserved)
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if self.reserved > 0 {
            self.store.release(self.reserved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_render() {
        let store = BufferStore::new(1024);
        store.insert("raw", b"{\"x\":7}\n".to_vec()).unwrap();

        let (json, warnings) = store.render(&["raw".into(), "missing".into()]);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["raw"], "{\"x\":7}\n");
        assert!(value["missing"].is_null());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("missing"));
    }

    #[test]
    fn duplicate_names_overwrite() {
        let store = BufferStore::new(64);
        store.insert("b", vec![0u8; 40]).unwrap();
        store.insert("b", vec![1u8; 40]).unwrap();
        assert_eq!(store.get("b").unwrap(), vec![1u8; 40]);
        assert_eq!(store.remaining(), 24);
    }

    #[test]
    fn cap_is_enforced_across_buffers() {
        let store = BufferStore::new(100);
        store.insert("a", vec![0u8; 60]).unwrap();
        let err = store.insert("b", vec![0u8; 60]).unwrap_err();
        assert_eq!(err.kind(), "buffer_limit_exceeded");
    }

    #[test]
    fn capture_fails_fast_while_streaming() {
        let store = Arc::new(BufferStore::new(16));
        let mut capture = Capture::new("big", store);
        capture.push(&[0u8; 10]).unwrap();
        let err = capture.push(&[0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), "buffer_limit_exceeded");
    }

    #[test]
    fn concurrent_captures_share_the_cap() {
        // Two in-flight captures, each under the cap alone, must not jointly
        // reserve past it.
        let store = Arc::new(BufferStore::new(100));
        let mut first = Capture::new("a", store.clone());
        let mut second = Capture::new("b", store.clone());

        first.push(&[0u8; 60]).unwrap();
        let err = second.push(&[0u8; 60]).unwrap_err();
        assert_eq!(err.kind(), "buffer_limit_exceeded");

        first.commit().unwrap();
        assert_eq!(store.get("a").unwrap().len(), 60);
    }

    #[test]
    fn dropping_an_uncommitted_capture_releases_its_reservation() {
        let store = Arc::new(BufferStore::new(100));
        {
            let mut abandoned = Capture::new("gone", store.clone());
            abandoned.push(&[0u8; 80]).unwrap();
        }
        assert_eq!(store.remaining(), 100);
        store.insert("kept", vec![0u8; 80]).unwrap();
    }

    #[test]
    fn overwrite_through_captures_keeps_accounting_consistent() {
        let store = Arc::new(BufferStore::new(64));
        let mut first = Capture::new("b", store.clone());
        first.push(&[0u8; 40]).unwrap();
        first.commit().unwrap();

        let mut second = Capture::new("b", store.clone());
        second.push(&[0u8; 20]).unwrap();
        second.commit().unwrap();

        assert_eq!(store.get("b").unwrap(), vec![0u8; 20]);
        assert_eq!(store.remaining(), 44);
    }
}
