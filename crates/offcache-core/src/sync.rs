//! Connectivity tracking and the sync reconciler.
//!
//! The reconciler never touches the network. It snapshots the offline data
//! and tells every connected context to upload it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clients::Clients;
use crate::error::StoreError;
use crate::protocol::{SyncPayload, WorkerMessage};
use crate::store::{DurableStore, GAME_STATE_KEY, MESSAGES_KEY, PENDING_ACTIONS_KEY};

/// Current connectivity plus how many times it has come back.
///
/// `watch` keeps only the latest value, so a quick offline/online flap can
/// wake a subscriber once with `online` unchanged. `reconnects` still moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub online: bool,
    pub reconnects: u64,
}

/// Platform "is online" signal.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<Link>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(Link {
            online,
            reconnects: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    /// Returns true when the state actually changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|link| {
            if link.online == online {
                return false;
            }
            link.online = online;
            if online {
                link.reconnects += 1;
            }
            true
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<Link> {
        self.tx.subscribe()
    }
}

pub struct SyncReconciler {
    store: Arc<DurableStore>,
    clients: Arc<Clients>,
}

impl SyncReconciler {
    pub fn new(store: Arc<DurableStore>, clients: Arc<Clients>) -> Self {
        Self { store, clients }
    }

    /// Read everything a foreground context needs to upload.
    ///
    /// `lastSync` is read before the records, so a concurrent write makes the
    /// payload newer than its stamp rather than older. Consumers deduplicating
    /// on `lastSync` then still see that write on the next sync.
    pub async fn snapshot(&self) -> Result<SyncPayload, StoreError> {
        let last_sync = self.store.last_sync().await;
        let game_state = self.store.get(GAME_STATE_KEY).await?.unwrap_or(Value::Null);
        let messages = self
            .store
            .get(MESSAGES_KEY)
            .await?
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let pending_actions = self
            .store
            .get(PENDING_ACTIONS_KEY)
            .await?
            .unwrap_or_else(|| Value::Array(Vec::new()));

        Ok(SyncPayload {
            game_state,
            messages,
            pending_actions,
            last_sync,
        })
    }

    /// Broadcast exactly one `SYNC_REQUEST`. Returns how many contexts received it.
    pub async fn reconcile(&self) -> Result<usize, StoreError> {
        let payload = self.snapshot().await?;
        let last_sync = payload.last_sync.map(|t| t.timestamp_millis());
        let delivered = self
            .clients
            .broadcast(WorkerMessage::SyncRequest(payload))
            .await;
        info!(delivered, ?last_sync, "Sync request broadcast");
        Ok(delivered)
    }

    async fn reconcile_logged(&self, trigger: &str) {
        if let Err(e) = self.reconcile().await {
            warn!(trigger, error = %e, "Sync reconcile failed");
        }
    }

    /// Reconcile on every offline to online transition, and every `interval`
    /// while online. Stops when the connectivity sender is dropped.
    ///
    /// Transitions are counted from the moment of this call, not from when
    /// the task is first polled.
    pub fn spawn(self: Arc<Self>, mut link: watch::Receiver<Link>, interval: Duration) -> JoinHandle<()> {
        let mut seen = *link.borrow_and_update();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = link.changed() => {
                        if changed.is_err() {
                            debug!("Connectivity source closed, reconciler stopping");
                            break;
                        }
                        let now = *link.borrow_and_update();
                        if now.reconnects != seen.reconnects {
                            self.reconcile_logged("reconnect").await;
                        }
                        seen = now;
                    }
                    _ = ticker.tick() => {
                        if seen.online {
                            self.reconcile_logged("interval").await;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (Arc<DurableStore>, Arc<Clients>, Arc<SyncReconciler>) {
        let store = Arc::new(DurableStore::volatile());
        let clients = Arc::new(Clients::new());
        let reconciler = Arc::new(SyncReconciler::new(store.clone(), clients.clone()));
        (store, clients, reconciler)
    }

    fn expect_sync(message: Option<WorkerMessage>) -> SyncPayload {
        match message {
            Some(WorkerMessage::SyncRequest(payload)) => payload,
            other => panic!("expected SYNC_REQUEST, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_of_empty_store() {
        let (_, _, reconciler) = setup();
        let payload = reconciler.snapshot().await.unwrap();
        assert_eq!(payload.game_state, Value::Null);
        assert_eq!(payload.messages, json!([]));
        assert_eq!(payload.pending_actions, json!([]));
        assert_eq!(payload.last_sync, None);
    }

    #[tokio::test]
    async fn test_reconcile_sends_one_request_with_last_write_time() {
        let (store, clients, reconciler) = setup();
        let mut a = clients.connect(None).await;
        let mut b = clients.connect(None).await;

        store.put(GAME_STATE_KEY, json!({"score": 3})).await.unwrap();
        let last = store.put(MESSAGES_KEY, json!(["hi"])).await.unwrap();
        store.enqueue_action(json!({"move": "e4"})).await.unwrap();
        let last_sync = store.last_sync().await;
        assert!(last_sync >= Some(last.updated_at));

        assert_eq!(reconciler.reconcile().await.unwrap(), 2);

        let payload = expect_sync(a.rx.recv().await);
        assert_eq!(payload.game_state, json!({"score": 3}));
        assert_eq!(payload.messages, json!(["hi"]));
        assert_eq!(payload.pending_actions.as_array().map(Vec::len), Some(1));
        assert_eq!(payload.last_sync, last_sync);

        expect_sync(b.rx.recv().await);
        assert!(a.rx.try_recv().is_err());
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connectivity_reports_transitions() {
        let connectivity = Connectivity::new(false);
        assert!(!connectivity.is_online());
        assert!(connectivity.set_online(true));
        assert!(!connectivity.set_online(true));
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn test_spawned_reconciler_fires_on_reconnect() {
        let (_, clients, reconciler) = setup();
        let mut a = clients.connect(None).await;
        let connectivity = Connectivity::new(false);

        let handle = reconciler.spawn(connectivity.subscribe(), Duration::from_secs(3600));

        connectivity.set_online(true);
        let received = tokio::time::timeout(Duration::from_secs(2), a.rx.recv())
            .await
            .unwrap();
        expect_sync(received);

        // staying online does not resend
        connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.rx.try_recv().is_err());

        drop(connectivity);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_counter_survives_flap() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();
        connectivity.set_online(false);
        connectivity.set_online(true);

        let link = *rx.borrow_and_update();
        assert!(link.online);
        assert_eq!(link.reconnects, 1);
    }

    #[tokio::test]
    async fn test_spawned_reconciler_fires_after_quick_flap() {
        let (_, clients, reconciler) = setup();
        let mut a = clients.connect(None).await;
        let connectivity = Connectivity::new(true);

        let _handle = reconciler.spawn(connectivity.subscribe(), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(50)).await;

        connectivity.set_online(false);
        connectivity.set_online(true);
        let received = tokio::time::timeout(Duration::from_millis(500), a.rx.recv())
            .await
            .unwrap();
        expect_sync(received);
    }

    #[tokio::test]
    async fn test_spawned_reconciler_ticks_only_while_online() {
        let (_, clients, reconciler) = setup();
        let mut a = clients.connect(None).await;
        let connectivity = Connectivity::new(false);

        let _handle = reconciler.spawn(connectivity.subscribe(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(a.rx.try_recv().is_err());

        connectivity.set_online(true);
        // reconnect plus at least one interval tick
        for _ in 0..2 {
            let received = tokio::time::timeout(Duration::from_secs(2), a.rx.recv())
                .await
                .unwrap();
            expect_sync(received);
        }
    }
}
