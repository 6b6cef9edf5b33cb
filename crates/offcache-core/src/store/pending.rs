//! Append-only queue of mutations made while offline.
//!
//! The queue is the `pendingActions` record: a JSON array of
//! `PendingAction` in insertion order. Sequence numbers come from a
//! companion counter record so they never repeat, even after the queue
//! drains, and always increase along the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::durable::DurableStore;
use super::PENDING_ACTIONS_KEY;
use crate::error::StoreError;

/// Counter record holding the next sequence number to hand out
const PENDING_SEQ_KEY: &str = "pendingActions.nextSeq";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub seq: u64,
    pub action: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub queued_at: DateTime<Utc>,
}

fn parse_queue(value: Option<Value>) -> Result<Vec<PendingAction>, StoreError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
            key: PENDING_ACTIONS_KEY.to_string(),
            reason: e.to_string(),
        }),
    }
}

impl DurableStore {
    /// Append an action to the back of the queue.
    pub async fn enqueue_action(&self, action: Value) -> Result<PendingAction, StoreError> {
        // queue before counter; nothing takes them in the other order
        let _queue = self.locks.acquire(PENDING_ACTIONS_KEY).await;
        let _counter = self.locks.acquire(PENDING_SEQ_KEY).await;

        let counter = self.read_record(PENDING_SEQ_KEY).await?;
        let previous = self.read_record(PENDING_ACTIONS_KEY).await?;
        let mut queue = parse_queue(previous.as_ref().map(|r| r.value.clone()))?;

        let from_counter = counter.as_ref().and_then(|r| r.value.as_u64()).unwrap_or(1);
        let after_last = queue.last().map(|a| a.seq + 1).unwrap_or(1);
        let entry = PendingAction {
            seq: from_counter.max(after_last),
            action,
            queued_at: Utc::now(),
        };
        queue.push(entry.clone());

        self.write_value(PENDING_ACTIONS_KEY, serde_json::to_value(&queue)?, previous.as_ref())
            .await?;
        self.write_value(PENDING_SEQ_KEY, Value::from(entry.seq + 1), counter.as_ref())
            .await?;
        Ok(entry)
    }

    /// Actions still awaiting acknowledgement, oldest first
    pub async fn pending_actions(&self) -> Result<Vec<PendingAction>, StoreError> {
        parse_queue(self.get(PENDING_ACTIONS_KEY).await?)
    }

    /// Remove every action with `seq <= up_to`. Returns how many remain.
    pub async fn ack_actions(&self, up_to: u64) -> Result<usize, StoreError> {
        let mut remaining = 0;
        self.update(PENDING_ACTIONS_KEY, |current| {
            let mut queue = parse_queue(current)?;
            queue.retain(|a| a.seq > up_to);
            remaining = queue.len();
            Ok(serde_json::to_value(queue)?)
        })
        .await?;
        Ok(remaining)
    }
}
