//! The background worker: lifecycle, request interception and message dispatch.
//!
//! One `Worker` is built at process start and owns every component. Handlers
//! receive it by reference; there is no global state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, CacheStorage};
use crate::clients::{ClientConnection, Clients};
use crate::config::Config;
use crate::error::{ConfigError, NetworkError, ProtocolError, RouteError, StoreError, WorkerError};
use crate::http::{Fetcher, HttpFetcher, Request, Response};
use crate::protocol::{ClientId, ClientMessage, Envelope, WorkerMessage};
use crate::router::{RequestRouter, ResponseSource, Routed, Strategy};
use crate::store::{DurableStore, GAME_STATE_KEY};
use crate::sync::{Connectivity, SyncReconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Built but not yet installed
    Parsed,
    Installing,
    Installed,
    Activating,
    /// Intercepting requests
    Activated,
    /// Install failed; this version will never activate
    Redundant,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Parsed => "parsed",
            Lifecycle::Installing => "installing",
            Lifecycle::Installed => "installed",
            Lifecycle::Activating => "activating",
            Lifecycle::Activated => "activated",
            Lifecycle::Redundant => "redundant",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refuses every request while the platform reports no connectivity.
struct GatedFetcher {
    inner: Arc<dyn Fetcher>,
    connectivity: Connectivity,
}

#[async_trait]
impl Fetcher for GatedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        if !self.connectivity.is_online() {
            return Err(NetworkError::Offline);
        }
        self.inner.fetch(request).await
    }
}

/// Who receives a handler's reply
enum Audience {
    Origin,
    Everyone,
}

/// Shallow key-wise overwrite. A missing or non-object state starts empty.
fn merge_state(current: Option<Value>, partial: Map<String, Value>) -> Value {
    let mut merged = match current {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    merged.extend(partial);
    Value::Object(merged)
}

fn store_failure(kind: &str, e: StoreError) -> WorkerMessage {
    warn!(kind, error = %e, "Store operation failed, replying CACHE_ERROR");
    WorkerMessage::CacheError {
        error: e.to_string(),
    }
}

pub struct Worker {
    assets: Vec<String>,
    store: Arc<DurableStore>,
    caches: Arc<CacheManager>,
    router: RequestRouter,
    clients: Arc<Clients>,
    reconciler: Arc<SyncReconciler>,
    connectivity: Connectivity,
    lifecycle: RwLock<Lifecycle>,
    sync_interval: Duration,
}

impl Worker {
    pub fn new(
        config: &Config,
        store: Arc<DurableStore>,
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ConfigError> {
        let origin = config.origin_url()?;
        let root_document = config.root_document_url()?;
        let connectivity = Connectivity::new(true);
        let fetcher: Arc<dyn Fetcher> = Arc::new(GatedFetcher {
            inner: fetcher,
            connectivity: connectivity.clone(),
        });

        let caches = Arc::new(CacheManager::new(
            &config.cache_prefix,
            &config.version,
            origin,
            storage,
            fetcher.clone(),
            config.fetch_timeout(),
        ));
        let router = RequestRouter::new(caches.clone(), fetcher, &root_document, config.fetch_timeout());
        let clients = Arc::new(Clients::new());
        let reconciler = Arc::new(SyncReconciler::new(store.clone(), clients.clone()));

        Ok(Self {
            assets: config.assets.clone(),
            store,
            caches,
            router,
            clients,
            reconciler,
            connectivity,
            lifecycle: RwLock::new(Lifecycle::Parsed),
            sync_interval: config.sync_interval(),
        })
    }

    /// Build a worker on the configured directories and the real network
    pub async fn start(config: &Config) -> Result<Self, ConfigError> {
        let store = Arc::new(DurableStore::open(config.store_dir()?).await);
        let storage = Arc::new(CacheStorage::open(config.cache_snapshot_dir()?).await);
        let fetcher = Arc::new(HttpFetcher::new(config.origin_url()?)?);
        let worker = Self::new(config, store, storage, fetcher)?;
        worker.resume().await;
        info!(
            version = %config.version,
            store = worker.store.backend_name(),
            lifecycle = %worker.lifecycle().await,
            "Worker started"
        );
        Ok(worker)
    }

    /// Pick up where a previous process left off: if this version's caches
    /// are already current, intercept immediately.
    pub async fn resume(&self) -> Lifecycle {
        let mut state = self.lifecycle.write().await;
        if *state == Lifecycle::Parsed && self.caches.is_active().await {
            *state = Lifecycle::Activated;
        }
        *state
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    pub fn caches(&self) -> &Arc<CacheManager> {
        &self.caches
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    async fn transition(&self, to: Lifecycle) {
        let mut state = self.lifecycle.write().await;
        debug!(from = state.as_str(), to = to.as_str(), "Lifecycle transition");
        *state = to;
    }

    /// Pre-warm the static cache. A failure makes this worker redundant.
    pub async fn install(&self) -> Result<usize, WorkerError> {
        {
            let mut state = self.lifecycle.write().await;
            if !matches!(*state, Lifecycle::Parsed | Lifecycle::Redundant) {
                return Err(WorkerError::InvalidTransition {
                    action: "install",
                    state: state.as_str(),
                });
            }
            *state = Lifecycle::Installing;
        }

        match self.caches.install(&self.assets).await {
            Ok(count) => {
                self.transition(Lifecycle::Installed).await;
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "Install failed, worker is redundant");
                self.transition(Lifecycle::Redundant).await;
                Err(e.into())
            }
        }
    }

    /// Delete superseded caches, notify every context, then claim them.
    /// Interception starts only after all of that completes.
    pub async fn activate(&self) -> Result<usize, WorkerError> {
        let previous = {
            let mut state = self.lifecycle.write().await;
            if !matches!(*state, Lifecycle::Installed | Lifecycle::Activated) {
                return Err(WorkerError::InvalidTransition {
                    action: "activate",
                    state: state.as_str(),
                });
            }
            std::mem::replace(&mut *state, Lifecycle::Activating)
        };

        let removed = match self.caches.activate().await {
            Ok(removed) => removed,
            Err(e) => {
                self.transition(previous).await;
                return Err(e.into());
            }
        };

        let version = self.caches.version().to_string();
        let notified = self
            .clients
            .broadcast(WorkerMessage::CachesActivated {
                version: version.clone(),
                removed,
            })
            .await;
        let claimed = self.clients.claim(&version).await;
        self.transition(Lifecycle::Activated).await;

        info!(%version, removed, notified, claimed, "Worker activated");
        Ok(removed)
    }

    pub async fn install_and_activate(&self) -> Result<usize, WorkerError> {
        self.install().await?;
        self.activate().await
    }

    /// Connect a foreground context. Contexts opened after activation are
    /// controlled from the start.
    pub async fn connect(&self) -> ClientConnection {
        let controller = match self.lifecycle().await {
            Lifecycle::Activated => Some(self.caches.version().to_string()),
            _ => None,
        };
        self.clients.connect(controller.as_deref()).await
    }

    /// Answer a request on behalf of `client`.
    ///
    /// Only an activated worker intercepts, and only for controlled contexts
    /// or navigations. Everything else goes straight to the network.
    pub async fn handle_fetch(
        &self,
        client: Option<&ClientId>,
        request: &Request,
    ) -> Result<Routed, RouteError> {
        let controlled = match client {
            Some(id) => request.is_navigation() || self.clients.controller_of(id).await.is_some(),
            None => true,
        };
        if self.lifecycle().await == Lifecycle::Activated && controlled {
            return self.router.route(request).await;
        }

        debug!(url = %request.url, "Not intercepting");
        self.router.passthrough(request).await
    }

    /// Compute the reply to one message. Every message type is answered.
    pub async fn respond(&self, message: ClientMessage) -> WorkerMessage {
        self.dispatch(message).await.0
    }

    async fn dispatch(&self, message: ClientMessage) -> (WorkerMessage, Audience) {
        match message {
            ClientMessage::CacheData { key, value } => {
                let reply = match self.store.put(&key, value).await {
                    Ok(record) => WorkerMessage::CacheSuccess {
                        key,
                        timestamp: record.updated_at,
                    },
                    Err(e) => store_failure("CACHE_DATA", e),
                };
                (reply, Audience::Origin)
            }
            ClientMessage::GetCachedData { key } => {
                let reply = match self.store.get(&key).await {
                    Ok(data) => WorkerMessage::CachedData {
                        key,
                        data: data.unwrap_or(Value::Null),
                        last_sync: self.store.last_sync().await,
                    },
                    Err(e) => store_failure("GET_CACHED_DATA", e),
                };
                (reply, Audience::Origin)
            }
            ClientMessage::UpdateOfflineState(partial) => {
                let reply = match self
                    .store
                    .update(GAME_STATE_KEY, |current| Ok(merge_state(current, partial)))
                    .await
                {
                    Ok(record) => WorkerMessage::OfflineStateUpdated {
                        merged_state: record.value,
                    },
                    Err(e) => store_failure("UPDATE_OFFLINE_STATE", e),
                };
                (reply, Audience::Origin)
            }
            ClientMessage::SyncWhenOnline {} => match self.reconciler.snapshot().await {
                Ok(payload) => (WorkerMessage::SyncRequest(payload), Audience::Everyone),
                Err(e) => (store_failure("SYNC_WHEN_ONLINE", e), Audience::Origin),
            },
            ClientMessage::QueueAction { action } => {
                let reply = match self.store.enqueue_action(action).await {
                    Ok(queued) => WorkerMessage::ActionQueued { seq: queued.seq },
                    Err(e) => store_failure("QUEUE_ACTION", e),
                };
                (reply, Audience::Origin)
            }
            ClientMessage::AckActions { up_to } => {
                let reply = match self.store.ack_actions(up_to).await {
                    Ok(remaining) => WorkerMessage::ActionsAcked { remaining },
                    Err(e) => store_failure("ACK_ACTIONS", e),
                };
                (reply, Audience::Origin)
            }
            ClientMessage::DropData { key } => {
                let reply = match self.store.drop_key(&key).await {
                    Ok(existed) => WorkerMessage::DataDropped { key, existed },
                    Err(e) => store_failure("DROP_DATA", e),
                };
                (reply, Audience::Origin)
            }
        }
    }

    /// Handle one message and deliver its reply.
    ///
    /// Replies go to the sender when it identified itself, otherwise to every
    /// context. `SYNC_REQUEST` always goes to every context.
    pub async fn handle_message(&self, envelope: Envelope<ClientMessage>) {
        let origin = envelope.client_id;
        let (reply, audience) = self.dispatch(envelope.message).await;
        let kind = reply.type_name();

        let delivered = match audience {
            Audience::Everyone => self.clients.broadcast(reply).await,
            Audience::Origin => self.clients.reply(origin.as_ref(), reply).await,
        };
        debug!(kind, delivered, client = ?origin, "Reply delivered");
    }

    /// Decode and handle a raw envelope. Malformed messages are dropped.
    pub async fn handle_raw(&self, raw: &str) {
        match Envelope::<ClientMessage>::decode(raw) {
            Ok(envelope) => self.handle_message(envelope).await,
            Err(e) => {
                warn!(error = %e, raw = %ProtocolError::preview(raw), "Dropping malformed message");
            }
        }
    }

    /// Handle inbound raw messages until the channel closes.
    /// Each message runs on its own task; per-key store locks keep them consistent.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<String>) {
        while let Some(raw) = inbox.recv().await {
            let worker = self.clone();
            tokio::spawn(async move {
                worker.handle_raw(&raw).await;
            });
        }
        debug!("Worker inbox closed");
    }

    /// Start the connectivity-driven reconciler
    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        self.reconciler
            .clone()
            .spawn(self.connectivity.subscribe(), self.sync_interval)
    }

    /// Describe how a routed response was produced, for logs and the CLI
    pub fn describe(routed: &Routed) -> String {
        let source = match routed.source {
            ResponseSource::Network => "network",
            ResponseSource::Cache => "cache",
            ResponseSource::Placeholder => "placeholder",
        };
        let strategy = match routed.strategy {
            Strategy::Passthrough => "passthrough",
            Strategy::Navigation => "navigation",
            Strategy::NetworkFirst => "network-first",
            Strategy::CacheFirst => "cache-first",
        };
        format!("{} via {} ({})", routed.response.status, source, strategy)
    }
}
