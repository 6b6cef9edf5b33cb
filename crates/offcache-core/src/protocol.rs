//! Typed messages exchanged between foreground contexts and the worker.
//!
//! On the wire every message is a JSON envelope:
//!
//! ```json
//! {"type": "CACHE_DATA", "payload": {"key": "gameState", "value": {}}, "clientId": "3f9c..."}
//! ```
//!
//! `clientId` is optional. A missing or null `payload` is read as `{}`.
//! Timestamps are epoch milliseconds.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[cfg(feature = "ts")]
use ts_rs::TS;

use crate::error::ProtocolError;

/// Identifies one connected foreground context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        ClientId(id.into())
    }

    /// A fresh random 128-bit identifier, hex encoded
    pub fn generate() -> Self {
        let bits: u128 = rand::thread_rng().gen();
        ClientId(format!("{:032x}", bits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Requests a foreground context can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Persist `value` under `key`
    CacheData { key: String, value: Value },
    GetCachedData { key: String },
    /// Shallow-merge the payload object into the stored `gameState`
    UpdateOfflineState(
        #[cfg_attr(feature = "ts", ts(type = "Record<string, unknown>"))] Map<String, Value>,
    ),
    SyncWhenOnline {},
    /// Append a mutation to the offline queue
    QueueAction { action: Value },
    /// Acknowledge uploaded actions up to and including `upTo`
    AckActions {
        #[serde(rename = "upTo")]
        up_to: u64,
    },
    /// Delete a stored record
    DropData { key: String },
}

/// Everything `SYNC_REQUEST` carries for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub game_state: Value,
    pub messages: Value,
    pub pending_actions: Value,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    #[cfg_attr(feature = "ts", ts(type = "number | null"))]
    pub last_sync: Option<DateTime<Utc>>,
}

/// Replies and notifications the worker sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    CacheSuccess {
        key: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        #[cfg_attr(feature = "ts", ts(type = "number"))]
        timestamp: DateTime<Utc>,
    },
    CacheError { error: String },
    CachedData {
        key: String,
        data: Value,
        #[serde(rename = "lastSync", with = "chrono::serde::ts_milliseconds_option")]
        #[cfg_attr(feature = "ts", ts(type = "number | null"))]
        last_sync: Option<DateTime<Utc>>,
    },
    OfflineStateUpdated {
        #[serde(rename = "mergedState")]
        merged_state: Value,
    },
    SyncRequest(SyncPayload),
    ActionQueued { seq: u64 },
    ActionsAcked { remaining: usize },
    DataDropped { key: String, existed: bool },
    /// Sent once per activation with the number of caches deleted
    CachesActivated { version: String, removed: usize },
}

impl WorkerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            WorkerMessage::CacheSuccess { .. } => "CACHE_SUCCESS",
            WorkerMessage::CacheError { .. } => "CACHE_ERROR",
            WorkerMessage::CachedData { .. } => "CACHED_DATA",
            WorkerMessage::OfflineStateUpdated { .. } => "OFFLINE_STATE_UPDATED",
            WorkerMessage::SyncRequest(_) => "SYNC_REQUEST",
            WorkerMessage::ActionQueued { .. } => "ACTION_QUEUED",
            WorkerMessage::ActionsAcked { .. } => "ACTIONS_ACKED",
            WorkerMessage::DataDropped { .. } => "DATA_DROPPED",
            WorkerMessage::CachesActivated { .. } => "CACHES_ACTIVATED",
        }
    }
}

/// A message plus the context it came from or is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    pub message: M,
    pub client_id: Option<ClientId>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(rename = "clientId", default)]
    client_id: Option<ClientId>,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            client_id: None,
        }
    }

    pub fn from_client(message: M, client_id: ClientId) -> Self {
        Self {
            message,
            client_id: Some(client_id),
        }
    }
}

impl<M: DeserializeOwned> Envelope<M> {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(raw)?;
        let kind = raw.kind.ok_or(ProtocolError::MissingType)?;
        let payload = match raw.payload {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(payload) => payload,
        };

        let mut tagged = Map::new();
        tagged.insert("type".to_string(), Value::String(kind));
        tagged.insert("payload".to_string(), payload);
        let message = serde_json::from_value(Value::Object(tagged))
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

        Ok(Self {
            message,
            client_id: raw.client_id,
        })
    }
}

impl<M: Serialize> Envelope<M> {
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        let mut value = serde_json::to_value(&self.message)?;
        if let (Some(id), Value::Object(map)) = (&self.client_id, &mut value) {
            map.insert("clientId".to_string(), Value::String(id.to_string()));
        }
        Ok(value)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn decode(raw: &str) -> Result<Envelope<ClientMessage>, ProtocolError> {
        Envelope::decode(raw)
    }

    #[test]
    fn test_decode_cache_data() {
        let env = decode(
            r#"{"type":"CACHE_DATA","payload":{"key":"gameState","value":{"score":0}},"clientId":"c1"}"#,
        )
        .unwrap();
        assert_eq!(
            env.message,
            ClientMessage::CacheData {
                key: "gameState".to_string(),
                value: json!({"score": 0}),
            }
        );
        assert_eq!(env.client_id, Some(ClientId::new("c1")));
    }

    #[test]
    fn test_decode_update_offline_state_payload_is_the_partial() {
        let env = decode(r#"{"type":"UPDATE_OFFLINE_STATE","payload":{"score":5}}"#).unwrap();
        let ClientMessage::UpdateOfflineState(partial) = env.message else {
            panic!("wrong variant");
        };
        assert_eq!(partial.get("score"), Some(&json!(5)));
        assert_eq!(env.client_id, None);
    }

    #[test]
    fn test_decode_sync_without_payload() {
        for raw in [
            r#"{"type":"SYNC_WHEN_ONLINE"}"#,
            r#"{"type":"SYNC_WHEN_ONLINE","payload":null}"#,
            r#"{"type":"SYNC_WHEN_ONLINE","payload":{}}"#,
        ] {
            assert_eq!(decode(raw).unwrap().message, ClientMessage::SyncWhenOnline {});
        }
    }

    #[test]
    fn test_decode_ack_uses_camel_case() {
        let env = decode(r#"{"type":"ACK_ACTIONS","payload":{"upTo":7}}"#).unwrap();
        assert_eq!(env.message, ClientMessage::AckActions { up_to: 7 });
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode(r#"{"payload":{}}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode(r#"{"type":"LAUNCH_MISSILES"}"#),
            Err(ProtocolError::InvalidPayload(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"GET_CACHED_DATA","payload":{}}"#),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_encode_worker_message_wire_shape() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let env = Envelope::from_client(
            WorkerMessage::CacheSuccess {
                key: "messages".to_string(),
                timestamp: at,
            },
            ClientId::new("c9"),
        );

        assert_eq!(
            env.to_value().unwrap(),
            json!({
                "type": "CACHE_SUCCESS",
                "payload": {"key": "messages", "timestamp": 1_700_000_000_123i64},
                "clientId": "c9"
            })
        );
    }

    #[test]
    fn test_encode_sync_request_wire_shape() {
        let env = Envelope::new(WorkerMessage::SyncRequest(SyncPayload {
            game_state: json!({"score": 1}),
            messages: json!([]),
            pending_actions: json!([]),
            last_sync: None,
        }));

        assert_eq!(
            env.to_value().unwrap(),
            json!({
                "type": "SYNC_REQUEST",
                "payload": {
                    "gameState": {"score": 1},
                    "messages": [],
                    "pendingActions": [],
                    "lastSync": null
                }
            })
        );
    }

    #[test]
    fn test_worker_message_decodes_back() {
        let original = WorkerMessage::OfflineStateUpdated {
            merged_state: json!({"score": 5}),
        };
        let raw = Envelope::new(original.clone()).encode().unwrap();
        assert!(raw.contains("\"mergedState\""));
        assert_eq!(Envelope::<WorkerMessage>::decode(&raw).unwrap().message, original);
    }

    #[test]
    fn test_type_name_matches_tag() {
        let msg = WorkerMessage::CachesActivated {
            version: "v2".to_string(),
            removed: 2,
        };
        let value = Envelope::new(msg.clone()).to_value().unwrap();
        assert_eq!(value["type"], json!(msg.type_name()));
    }

    #[test]
    fn test_generated_client_ids_differ() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
