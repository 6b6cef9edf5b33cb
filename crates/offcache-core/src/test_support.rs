//! Scripted collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{NetworkError, StoreError};
use crate::http::{Fetcher, Request, Response};
use crate::store::{MemoryBackend, StoreBackend, StoreRecord};

/// Fetcher that answers from a per-URL script.
/// Unscripted URLs answer 404.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<HashMap<String, Response>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, response: Response) {
        self.responses.lock().unwrap().insert(url.to_string(), response);
    }

    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        let url = request.url.to_string();
        self.calls.lock().unwrap().push(url.clone());

        let delay = self.delays.lock().unwrap().get(&url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::Offline);
        }
        if self.failing.lock().unwrap().contains(&url) {
            return Err(NetworkError::Transport(format!("scripted failure for {}", url)));
        }

        let scripted = self.responses.lock().unwrap().get(&url).cloned();
        Ok(scripted.unwrap_or_else(|| Response::new(404, "not found")))
    }
}

/// Backend whose every operation fails, to force the fallback path
pub struct FailingBackend;

#[async_trait]
impl StoreBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn read(&self, _key: &str) -> Result<Option<StoreRecord>, StoreError> {
        Err(StoreError::Unavailable("disk gone".to_string()))
    }

    async fn write(&self, _record: &StoreRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk gone".to_string()))
    }

    async fn remove(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("disk gone".to_string()))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("disk gone".to_string()))
    }
}

/// Backend that keeps reading fine but refuses writes once flipped
#[derive(Default)]
pub struct ReadOnlyAfterFlip {
    inner: MemoryBackend,
    read_only: AtomicBool,
}

impl ReadOnlyAfterFlip {
    pub fn flip(&self) {
        self.read_only.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for ReadOnlyAfterFlip {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn read(&self, key: &str) -> Result<Option<StoreRecord>, StoreError> {
        self.inner.read(key).await
    }

    async fn write(&self, record: &StoreRecord) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write(record).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.keys().await
    }
}
