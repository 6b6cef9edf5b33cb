//! Connected foreground contexts.
//!
//! Each context owns the receiving half of a bounded channel. Delivery is
//! at-most-once: a full or closed channel drops the message, and closed
//! contexts are pruned on the next delivery attempt.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::protocol::{ClientId, WorkerMessage};

/// Messages buffered per context before new ones are dropped
pub const CLIENT_CHANNEL_CAPACITY: usize = 32;

struct ClientSlot {
    tx: mpsc::Sender<WorkerMessage>,
    /// Version serving this context, if any
    controller: Option<String>,
}

/// The context's end of the connection.
pub struct ClientConnection {
    pub id: ClientId,
    pub rx: mpsc::Receiver<WorkerMessage>,
}

#[derive(Default)]
pub struct Clients {
    slots: RwLock<HashMap<ClientId, ClientSlot>>,
}

enum Delivery {
    Sent,
    Dropped,
    Closed,
}

fn try_deliver(id: &ClientId, slot: &ClientSlot, message: WorkerMessage) -> Delivery {
    match slot.tx.try_send(message) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(message)) => {
            warn!(client = %id, kind = message.type_name(), "Client inbox full, message dropped");
            Delivery::Dropped
        }
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new context, controlled by `controller` when given.
    pub async fn connect(&self, controller: Option<&str>) -> ClientConnection {
        let id = ClientId::generate();
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        self.slots.write().await.insert(
            id.clone(),
            ClientSlot {
                tx,
                controller: controller.map(str::to_string),
            },
        );
        debug!(client = %id, "Client connected");
        ClientConnection { id, rx }
    }

    pub async fn disconnect(&self, id: &ClientId) -> bool {
        self.slots.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub async fn controller_of(&self, id: &ClientId) -> Option<String> {
        self.slots
            .read()
            .await
            .get(id)
            .and_then(|slot| slot.controller.clone())
    }

    /// Deliver to one context. Returns whether the message was queued.
    pub async fn post(&self, id: &ClientId, message: WorkerMessage) -> bool {
        let outcome = {
            let slots = self.slots.read().await;
            match slots.get(id) {
                Some(slot) => try_deliver(id, slot, message),
                None => {
                    debug!(client = %id, kind = message.type_name(), "Reply for unknown client dropped");
                    return false;
                }
            }
        };

        match outcome {
            Delivery::Sent => true,
            Delivery::Dropped => false,
            Delivery::Closed => {
                self.slots.write().await.remove(id);
                debug!(client = %id, "Pruned closed client");
                false
            }
        }
    }

    /// Deliver to every context. Returns how many queued the message.
    pub async fn broadcast(&self, message: WorkerMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let slots = self.slots.read().await;
            for (id, slot) in slots.iter() {
                match try_deliver(id, slot, message.clone()) {
                    Delivery::Sent => delivered += 1,
                    Delivery::Dropped => {}
                    Delivery::Closed => closed.push(id.clone()),
                }
            }
        }

        if !closed.is_empty() {
            let mut slots = self.slots.write().await;
            for id in &closed {
                slots.remove(id);
            }
            debug!(pruned = closed.len(), "Pruned closed clients");
        }
        delivered
    }

    /// Reply to `origin` when known, otherwise broadcast.
    pub async fn reply(&self, origin: Option<&ClientId>, message: WorkerMessage) -> usize {
        match origin {
            Some(id) => usize::from(self.post(id, message).await),
            None => self.broadcast(message).await,
        }
    }

    /// Put every connected context under `version`. Returns how many changed.
    pub async fn claim(&self, version: &str) -> usize {
        let mut slots = self.slots.write().await;
        let mut claimed = 0;
        for slot in slots.values_mut() {
            if slot.controller.as_deref() != Some(version) {
                slot.controller = Some(version.to_string());
                claimed += 1;
            }
        }
        claimed
    }
}
