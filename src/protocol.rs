//! Wire format of the flag delivery protocol.
//!
//! The streaming endpoint sends these events as server-sent events; the polling endpoint returns
//! the same events batched in a single JSON document ([`PollingPayload`]).
use derive_more::Display;
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::{
    changeset::{ChangeSet, ChangeSetBuilder, IntentCode, ObjectKind},
    Error, Result, Selector,
};

/// Names of protocol events.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    /// Keeps the connection alive; carries no data.
    #[display(fmt = "heart-beat")]
    Heartbeat,
    /// Announces what the following events are.
    #[display(fmt = "server-intent")]
    ServerIntent,
    /// Upserts an object.
    #[display(fmt = "put-object")]
    PutObject,
    /// Deletes an object.
    #[display(fmt = "delete-object")]
    DeleteObject,
    /// The server is about to close the connection.
    #[display(fmt = "goodbye")]
    Goodbye,
    /// The server failed mid-transfer; everything since the last intent must be forgotten.
    #[display(fmt = "error")]
    Error,
    /// Completes a transfer and carries the resulting selector.
    #[display(fmt = "payload-transferred")]
    PayloadTransferred,
}

impl EventName {
    /// Parse a wire event name.
    pub fn from_wire(name: &str) -> Option<EventName> {
        Some(match name {
            "heart-beat" => EventName::Heartbeat,
            "server-intent" => EventName::ServerIntent,
            "put-object" => EventName::PutObject,
            "delete-object" => EventName::DeleteObject,
            "goodbye" => EventName::Goodbye,
            "error" => EventName::Error,
            "payload-transferred" => EventName::PayloadTransferred,
            _ => return None,
        })
    }
}

/// One entry of a `server-intent` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerIntentPayload {
    /// Payload identifier.
    #[serde(default)]
    pub id: String,
    /// Version the payload is moving towards.
    #[serde(default)]
    pub target: u64,
    /// What kind of transfer follows.
    pub intent_code: IntentCode,
    /// Why the server chose this intent.
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct RawServerIntent {
    payloads: Vec<ServerIntentPayload>,
}

/// Body of a `server-intent` event. Only the first payload is used.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerIntent {
    /// The announced payload.
    pub payload: ServerIntentPayload,
}

/// Body of a `put-object` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PutObject {
    /// Version of the object.
    pub version: u64,
    /// Wire name of the object kind.
    pub kind: String,
    /// Key of the object.
    pub key: String,
    /// The object itself. `null` when the event carries no object.
    #[serde(default)]
    pub object: serde_json::Value,
}

/// Body of a `delete-object` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeleteObject {
    /// Version of the deletion.
    pub version: u64,
    /// Wire name of the object kind.
    pub kind: String,
    /// Key of the deleted object.
    pub key: String,
}

/// Body of a `goodbye` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Goodbye {
    /// Why the stream is closing.
    #[serde(default)]
    pub reason: String,
    /// Expected closure that need not be logged as an error.
    #[serde(default)]
    pub silent: bool,
    /// The server failed badly.
    #[serde(default)]
    pub catastrophe: bool,
}

/// Body of an `error` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    /// Payload that failed.
    #[serde(default)]
    pub payload_id: String,
    /// What went wrong.
    #[serde(default)]
    pub reason: String,
}

/// A decoded protocol event. Variants mirror [`EventName`].
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ProtocolEvent {
    Heartbeat,
    ServerIntent(ServerIntent),
    PutObject(PutObject),
    DeleteObject(DeleteObject),
    Goodbye(Goodbye),
    Error(ErrorEvent),
    PayloadTransferred(Selector),
    /// An event this SDK does not understand, by name.
    Unknown(String),
}

impl ProtocolEvent {
    /// Decode an event from its name and JSON body.
    ///
    /// Fails with [`Error::MalformedData`] if the body does not match the event.
    pub fn parse(name: &str, data: &str) -> Result<ProtocolEvent> {
        let Some(event_name) = EventName::from_wire(name) else {
            return Ok(ProtocolEvent::Unknown(name.to_owned()));
        };

        let event = match event_name {
            EventName::Heartbeat => ProtocolEvent::Heartbeat,
            EventName::ServerIntent => {
                let raw: RawServerIntent = serde_json::from_str(data)?;
                let payload = raw.payloads.into_iter().next().ok_or_else(|| {
                    Error::MalformedData("server-intent has no payloads".to_owned())
                })?;
                ProtocolEvent::ServerIntent(ServerIntent { payload })
            }
            EventName::PutObject => ProtocolEvent::PutObject(serde_json::from_str(data)?),
            EventName::DeleteObject => ProtocolEvent::DeleteObject(serde_json::from_str(data)?),
            EventName::Goodbye => ProtocolEvent::Goodbye(serde_json::from_str(data)?),
            EventName::Error => ProtocolEvent::Error(serde_json::from_str(data)?),
            EventName::PayloadTransferred => {
                ProtocolEvent::PayloadTransferred(serde_json::from_str(data)?)
            }
        };

        Ok(event)
    }
}

/// A single event inside a polling response.
#[derive(Debug, Deserialize)]
pub struct PollingEvent {
    /// Event name.
    pub event: String,
    /// Undecoded event body.
    pub data: Box<RawValue>,
}

/// Body of a polling response.
#[derive(Debug, Deserialize)]
pub struct PollingPayload {
    /// Events in arrival order.
    pub events: Vec<PollingEvent>,
}

impl PollingPayload {
    /// Decode a polling response body.
    pub fn parse(body: &str) -> Result<PollingPayload> {
        Ok(serde_json::from_str(body)?)
    }

    /// Translate the batched events into exactly one change set.
    pub fn into_change_set(self) -> Result<ChangeSet> {
        let mut builder = ChangeSetBuilder::new();

        for event in self.events {
            match ProtocolEvent::parse(&event.event, event.data.get())? {
                ProtocolEvent::ServerIntent(intent) => {
                    if intent.payload.intent_code == IntentCode::None {
                        return Ok(ChangeSetBuilder::no_changes());
                    }
                    builder.start(intent.payload.intent_code);
                }
                ProtocolEvent::PutObject(put) => {
                    if let Some(kind) = known_kind(&put.kind) {
                        builder
                            .add_put(kind, put.key, put.version, put.object)
                            .map_err(out_of_order)?;
                    }
                }
                ProtocolEvent::DeleteObject(delete) => {
                    if let Some(kind) = known_kind(&delete.kind) {
                        builder
                            .add_delete(kind, delete.key, delete.version)
                            .map_err(out_of_order)?;
                    }
                }
                ProtocolEvent::Error(error) => {
                    log::warn!(target: "flagsync", payload_id = error.payload_id.as_str(); "error in polling response: {}", error.reason);
                    builder.reset();
                }
                ProtocolEvent::PayloadTransferred(selector) => {
                    return builder.finish(selector).map_err(out_of_order);
                }
                ProtocolEvent::Heartbeat | ProtocolEvent::Goodbye(_) | ProtocolEvent::Unknown(_) => {}
            }
        }

        Err(Error::MalformedData(
            "polling response did not complete a payload".to_owned(),
        ))
    }
}

/// Map a wire kind to a known [`ObjectKind`], logging and skipping unknown ones.
pub(crate) fn known_kind(kind: &str) -> Option<ObjectKind> {
    let known = ObjectKind::from_wire(kind);
    if known.is_none() {
        log::debug!(target: "flagsync", kind = kind; "ignoring object of unknown kind");
    }
    known
}

fn out_of_order(err: Error) -> Error {
    match err {
        Error::NoServerIntent => {
            Error::MalformedData("object received before a server-intent".to_owned())
        }
        err => err,
    }
}
