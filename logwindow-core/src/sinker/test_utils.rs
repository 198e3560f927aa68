use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::sinker::{BlobStore, PutOutcome};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    objects: HashMap<String, (Bytes, &'static str)>,
    put_log: Vec<String>,
    fail_puts: usize,
    failed_puts: usize,
    deny_writes: bool,
    delayed_puts: usize,
    put_delay: Duration,
}

/// In-memory [BlobStore] with fault injection for sink and pipeline tests. Puts are
/// create-if-absent under a single lock, like a conditional put on a real bucket.
#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub(crate) fn insert(&self, path: &str, bytes: &'static [u8]) {
        self.state.lock().objects.insert(
            path.to_string(),
            (Bytes::from_static(bytes), "application/octet-stream"),
        );
    }

    pub(crate) fn object(&self, path: &str) -> Option<Bytes> {
        self.state.lock().objects.get(path).map(|(b, _)| b.clone())
    }

    pub(crate) fn content_type(&self, path: &str) -> Option<&'static str> {
        self.state.lock().objects.get(path).map(|(_, ct)| *ct)
    }

    /// All stored objects, sorted by path.
    pub(crate) fn objects(&self) -> Vec<(String, Bytes)> {
        let mut objects: Vec<_> = self
            .state
            .lock()
            .objects
            .iter()
            .map(|(k, (b, _))| (k.clone(), b.clone()))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        objects
    }

    /// Paths of puts that created an object, in order.
    pub(crate) fn put_log(&self) -> Vec<String> {
        self.state.lock().put_log.clone()
    }

    pub(crate) fn failed_puts(&self) -> usize {
        self.state.lock().failed_puts
    }

    /// The next `n` puts fail with a retryable error.
    pub(crate) fn fail_next_puts(&self, n: usize) {
        self.state.lock().fail_puts = n;
    }

    /// Every put fails with a permission error.
    pub(crate) fn deny_writes(&self) {
        self.state.lock().deny_writes = true;
    }

    /// The next `n` puts stall for `delay` before storing.
    pub(crate) fn delay_next_puts(&self, n: usize, delay: Duration) {
        let mut state = self.state.lock();
        state.delayed_puts = n;
        state.put_delay = delay;
    }
}

impl BlobStore for MemoryStore {
    async fn put_object(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &'static str,
    ) -> Result<PutOutcome> {
        let delay = {
            let mut state = self.state.lock();
            if state.deny_writes {
                state.failed_puts += 1;
                return Err(Error::SinkFatal(format!("permission denied: {path}")));
            }
            if state.fail_puts > 0 {
                state.fail_puts -= 1;
                state.failed_puts += 1;
                return Err(Error::Sink(format!("service unavailable: {path}")));
            }
            if state.delayed_puts > 0 {
                state.delayed_puts -= 1;
                Some(state.put_delay)
            } else {
                None
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.objects.contains_key(path) {
            return Ok(PutOutcome::AlreadyExists);
        }
        state
            .objects
            .insert(path.to_string(), (bytes, content_type));
        state.put_log.push(path.to_string());
        Ok(PutOutcome::Created)
    }

    async fn head_object(&self, path: &str) -> Result<Option<u64>> {
        Ok(self
            .state
            .lock()
            .objects
            .get(path)
            .map(|(b, _)| b.len() as u64))
    }

    async fn get_object(&self, path: &str) -> Result<Option<Bytes>> {
        Ok(self.object(path))
    }
}
