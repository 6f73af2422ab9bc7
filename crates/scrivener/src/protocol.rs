//! Wire format: JSON messages carrying operation records, each one a
//! complete transport frame (see [`crate::transport`]) — or, for failure
//! replies, plain UTF-8 text (see [`Reply::Raw`]).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::RESERVED_CURSOR_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpName {
  Subscribe,
  Unsubscribe,
  CreateCursor,
  RemoveCursor,
  MoveCursor,
  InsertChar,
  EchoResponse,
}

impl OpName {
  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      OpName::Subscribe => "subscribe",
      OpName::Unsubscribe => "unsubscribe",
      OpName::CreateCursor => "create_cursor",
      OpName::RemoveCursor => "remove_cursor",
      OpName::MoveCursor => "move_cursor",
      OpName::InsertChar => "insert_char",
      OpName::EchoResponse => "echo_response",
    }
  }

  fn parse(s: &str) -> Option<Self> {
    Some(match s {
      "subscribe" => OpName::Subscribe,
      "unsubscribe" => OpName::Unsubscribe,
      "create_cursor" => OpName::CreateCursor,
      "remove_cursor" => OpName::RemoveCursor,
      "move_cursor" => OpName::MoveCursor,
      "insert_char" => OpName::InsertChar,
      "echo_response" => OpName::EchoResponse,
      _ => return None,
    })
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
  #[error("decode error: {0}")]
  Decode(#[from] serde_json::Error),
  #[error("unknown operation: {0}")]
  UnknownOperation(String),
  #[error("message too old")]
  Stale,
}

/// An operation record as it appears on the wire: `{uuid, name, args, time?}`.
/// `time`, like `uuid`/`name`/`args`, is carried as a decimal string on the
/// wire, not a bare JSON number — the one exception being the subscribe
/// reply's `other.uuid`, which is numeric for an unrelated reason (see
/// [`SubscribedInfo`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
  pub uuid: String,
  pub name: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none", default, with = "time_as_decimal_string")]
  pub time: Option<f64>,
}

mod time_as_decimal_string {
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S>(time: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    match time {
      Some(t) => serializer.serialize_str(&t.to_string()),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
  where
    D: Deserializer<'de>,
  {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw
      .map(|s| s.parse::<f64>().map_err(serde::de::Error::custom))
      .transpose()
  }
}

impl OperationRecord {
  #[must_use]
  pub fn new(uuid: impl Into<String>, name: OpName, args: Vec<String>, time: Option<f64>) -> Self {
    Self {
      uuid: uuid.into(),
      name: name.as_str().to_string(),
      args,
      time,
    }
  }

  #[must_use]
  pub fn control(uuid: impl Into<String>, name: OpName, args: Vec<String>) -> Self {
    Self::new(uuid, name, args, None)
  }

  /// The record's `name`, parsed into the closed [`OpName`] set.
  pub fn op_name(&self) -> Result<OpName, ProtocolError> {
    OpName::parse(&self.name).ok_or_else(|| ProtocolError::UnknownOperation(self.name.clone()))
  }

  #[must_use]
  pub fn encode(&self) -> String {
    // Construction always goes through `new`/`control`, so this can't fail.
    serde_json::to_string(self).expect("operation record is always serializable")
  }

  pub fn decode(text: &str) -> Result<Self, ProtocolError> {
    Ok(serde_json::from_str(text)?)
  }
}

/// A time-sorted group of operations, as broadcast together.
pub type Batch = Vec<OperationRecord>;

#[must_use]
pub fn encode_batch(batch: &Batch) -> String {
  serde_json::to_string(batch).expect("batch of operation records is always serializable")
}

pub fn decode_batch(text: &str) -> Result<Batch, ProtocolError> {
  Ok(serde_json::from_str(text)?)
}

/// `{"cx": <col>, "cy": <line>}`, the wire shape of a cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCursor {
  pub cx: usize,
  pub cy: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribedInfo {
  /// The newly minted cursor's id, carried as a bare numeric value on the
  /// wire (matching the original's raw `uuid.uuid4().int`, see the design
  /// note in SPEC_FULL.md §9), not the decimal-string form used everywhere
  /// else a cursor id appears (`cursors`' keys, `args`, `OperationRecord.uuid`).
  /// `cursors[&uuid.to_string()]` is always this same cursor's position.
  pub uuid: u128,
  pub file: Vec<String>,
  pub cursors: HashMap<String, WireCursor>,
}

/// The envelope every interactive-socket reply to `subscribe` is wrapped
/// in. Deserializing straight into this (rather than a generic
/// [`Value`]) is what lets `uuid` keep its full numeric precision instead
/// of being downgraded to a lossy float along the way.
#[derive(Debug, Deserialize)]
pub struct SubscribeReplyEnvelope {
  pub status: String,
  pub other: SubscribedInfo,
}

/// A reply to an interactive-socket request. Most replies are JSON values;
/// failure replies are plain, unquoted text, matching §6's wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
  Subscribed(SubscribedInfo),
  Dropped,
  Fail(&'static str),
  Null,
  Raw(String),
}

impl Reply {
  #[must_use]
  pub fn failure(reason: &str, original: &str) -> Self {
    Reply::Raw(format!("Failure ({reason}): {original}"))
  }

  #[must_use]
  pub fn to_wire_string(&self) -> String {
    match self {
      // Built by hand rather than through `serde_json::json!`/`Value`:
      // routing `info.uuid` (a u128) through the generic `Value` number
      // representation would silently downgrade it to an approximate f64.
      Reply::Subscribed(info) => {
        #[derive(Serialize)]
        struct Wire<'a> {
          status: &'static str,
          other: &'a SubscribedInfo,
        }
        serde_json::to_string(&Wire {
          status: "subscribed",
          other: info,
        })
        .expect("subscribed reply is always serializable")
      }
      Reply::Dropped => {
        serde_json::json!({"status": "dropped", "other": "message_too_old"}).to_string()
      }
      Reply::Fail(reason) => {
        serde_json::json!({"status": "fail", "other": reason}).to_string()
      }
      Reply::Null => Value::Null.to_string(),
      Reply::Raw(s) => s.clone(),
    }
  }
}

/// Reserve a subscribe request's originator id before a real cursor exists.
#[must_use]
pub fn unassigned_cursor_id() -> &'static str {
  RESERVED_CURSOR_ID
}
