//! Test doubles shared by the unit tests

use crate::transport::{HttpTransport, OutboundRequest, TransportError, TransportResponse};
use async_trait::async_trait;
use formhook_core::{InMemoryKeyValueStore, KeyValueStore, StoreError, StoreResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

type Scripted = std::result::Result<TransportResponse, TransportError>;

/// Transport answering from a script and recording when it was called.
///
/// Once the script runs out every further call gets HTTP 200.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<(Instant, OutboundRequest)>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn statuses(statuses: &[u16]) -> Self {
        Self::new(
            statuses
                .iter()
                .map(|status| Ok(TransportResponse::new(*status, format!("status {}", status))))
                .collect(),
        )
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.calls.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    /// Time between consecutive calls, in whole milliseconds
    pub fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock();
        calls
            .windows(2)
            .map(|pair| {
                let gap = pair[1].0 - pair[0].0;
                Duration::from_millis(gap.as_millis() as u64)
            })
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn post(&self, request: OutboundRequest) -> Scripted {
        self.calls.lock().push((Instant::now(), request));
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(TransportResponse::new(200, "ok")))
    }
}

/// In-memory store whose writes can be switched to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryKeyValueStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.put(key, value).await
    }
}
