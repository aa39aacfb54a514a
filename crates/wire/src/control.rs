//! Control channel messages.
//!
//! Every control message is a JSON array whose first element is the verb.
//! Shapes by direction:
//!
//! ```text
//! client -> relay   ["HANDSHAKE", room]
//!                   [verb, payload]                 broadcast to the room
//!                   [verb, recipient_id, payload]   direct to one member
//! relay -> client   ["HANDSHAKE", session_id]
//!                   ["UPDATE_USERS", [ids...]]
//!                   [verb, sender_id, payload]      relayed peer message
//! ```
//!
//! The relay always fills the middle field of a relayed message with the
//! authoritative sender id, so clients cannot spoof each other.

use std::collections::BTreeMap;

use fastsync_core::{SessionId, SyncId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

/// Application-level keepalive request (plain text, not JSON).
pub const PING: &str = "__ping__";

/// Application-level keepalive reply (plain text, not JSON).
pub const PONG: &str = "__pong__";

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while parsing or building a control message.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control message is not a JSON array")]
    NotAnArray,

    #[error("control message has no verb")]
    MissingVerb,

    #[error("unknown verb {0:?}")]
    UnknownVerb(String),

    #[error("{verb} does not take {len} elements")]
    BadArity { verb: &'static str, len: usize },

    #[error("{0} is not valid in this direction")]
    UnexpectedVerb(&'static str),

    #[error("{verb}: field {field} has the wrong type")]
    InvalidField {
        verb: &'static str,
        field: &'static str,
    },
}

// ============================================================================
// Verbs
// ============================================================================

/// Discriminant of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Handshake,
    UpdateUsers,
    UpdateRemoteEl,
    RemoveRemoteEl,
    UpdateHtml,
    StealEl,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "HANDSHAKE",
            Self::UpdateUsers => "UPDATE_USERS",
            Self::UpdateRemoteEl => "UPDATE_REMOTE_EL",
            Self::RemoveRemoteEl => "REMOVE_REMOTE_EL",
            Self::UpdateHtml => "UPDATE_HTML",
            Self::StealEl => "STEAL_EL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "HANDSHAKE" => Self::Handshake,
            "UPDATE_USERS" => Self::UpdateUsers,
            "UPDATE_REMOTE_EL" => Self::UpdateRemoteEl,
            "REMOVE_REMOTE_EL" => Self::RemoveRemoteEl,
            "UPDATE_HTML" => Self::UpdateHtml,
            "STEAL_EL" => Self::StealEl,
            _ => return None,
        })
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Per-object sync configuration carried in templates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Comma-separated attribute names copied into the remote representation.
    pub components: String,
    /// Comma-separated attribute names whose values follow the object across
    /// an ownership transfer.
    pub transferables: String,
    /// Sample world-space instead of local transforms.
    pub world: bool,
}

impl SyncConfig {
    /// Normalised (trimmed, lower-case, non-empty) transferable attribute names.
    pub fn transferable_names(&self) -> Vec<String> {
        split_names(&self.transferables)
    }

    pub fn component_names(&self) -> Vec<String> {
        split_names(&self.components)
    }
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Identity of an object as `(creator-of-record, sync_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdData {
    pub original_creator: SessionId,
    pub sync_id: SyncId,
}

/// Attribute values keyed by attribute name; `None` means "not set".
pub type AttributeValues = BTreeMap<String, Option<String>>;

/// `UPDATE_REMOTE_EL` payload: how to create or re-key a remote mirror.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteElTemplate {
    pub sync_id: SyncId,
    /// Serialized representation to instantiate on the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// Clone-by-reference configuration, used instead of `html`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<Value>,
    #[serde(default)]
    pub config: SyncConfig,
    #[serde(default)]
    pub transferables: AttributeValues,
    /// Previous identity after an ownership transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub was: Option<IdData>,
}

/// `REMOVE_REMOTE_EL` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveRemoteEl {
    pub sync_id: SyncId,
}

/// `UPDATE_HTML` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtmlUpdate {
    pub sync_id: SyncId,
    pub html_string: String,
}

/// Options of a steal request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StealOptions {
    /// Attributes stripped from the old owner and reapplied by the new one.
    pub transfer: Vec<String>,
}

/// `STEAL_EL` payload.
///
/// Sent as a broadcast by the requester and echoed back directly to the
/// requester by the current owner, who fills `handoff` with the values of
/// the transferred attributes at the moment it let go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StealRequest {
    pub id_data: IdData,
    #[serde(default)]
    pub options: StealOptions,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub handoff: AttributeValues,
}

// ============================================================================
// Peer Messages
// ============================================================================

/// Messages one session addresses to others through the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    UpdateRemoteEl(RemoteElTemplate),
    RemoveRemoteEl(RemoveRemoteEl),
    UpdateHtml(HtmlUpdate),
    StealEl(StealRequest),
}

impl PeerMessage {
    pub fn verb(&self) -> Verb {
        match self {
            Self::UpdateRemoteEl(_) => Verb::UpdateRemoteEl,
            Self::RemoveRemoteEl(_) => Verb::RemoveRemoteEl,
            Self::UpdateHtml(_) => Verb::UpdateHtml,
            Self::StealEl(_) => Verb::StealEl,
        }
    }

    fn payload(&self) -> Result<Value, ControlError> {
        Ok(match self {
            Self::UpdateRemoteEl(p) => serde_json::to_value(p)?,
            Self::RemoveRemoteEl(p) => serde_json::to_value(p)?,
            Self::UpdateHtml(p) => serde_json::to_value(p)?,
            Self::StealEl(p) => serde_json::to_value(p)?,
        })
    }

    fn from_parts(verb: Verb, payload: Value) -> Result<Self, ControlError> {
        Ok(match verb {
            Verb::UpdateRemoteEl => Self::UpdateRemoteEl(payload_as(verb, payload)?),
            Verb::RemoveRemoteEl => Self::RemoveRemoteEl(payload_as(verb, payload)?),
            Verb::UpdateHtml => Self::UpdateHtml(payload_as(verb, payload)?),
            Verb::StealEl => Self::StealEl(payload_as(verb, payload)?),
            Verb::Handshake | Verb::UpdateUsers => {
                return Err(ControlError::UnexpectedVerb(verb.as_str()));
            }
        })
    }
}

fn payload_as<T: DeserializeOwned>(verb: Verb, payload: Value) -> Result<T, ControlError> {
    serde_json::from_value(payload).map_err(|_| ControlError::InvalidField {
        verb: verb.as_str(),
        field: "payload",
    })
}

fn session_id_field(verb: Verb, value: &Value, field: &'static str) -> Result<SessionId, ControlError> {
    value
        .as_u64()
        .and_then(|n| SessionId::try_from(n).ok())
        .ok_or(ControlError::InvalidField {
            verb: verb.as_str(),
            field,
        })
}

/// Split a control frame into its verb and remaining elements.
fn split_frame(text: &str) -> Result<(Verb, Vec<Value>), ControlError> {
    let Value::Array(mut items) = serde_json::from_str::<Value>(text)? else {
        return Err(ControlError::NotAnArray);
    };
    if items.is_empty() {
        return Err(ControlError::MissingVerb);
    }
    let verb = match items.remove(0) {
        Value::String(s) => Verb::parse(&s).ok_or(ControlError::UnknownVerb(s))?,
        _ => return Err(ControlError::MissingVerb),
    };
    Ok((verb, items))
}

fn bad_arity(verb: Verb, args: &[Value]) -> ControlError {
    ControlError::BadArity {
        verb: verb.as_str(),
        len: args.len() + 1,
    }
}

// ============================================================================
// Client -> Relay
// ============================================================================

/// A control message as sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Join a room.
    Handshake { room: String },
    /// Relay to every other member of the sender's room.
    Broadcast(PeerMessage),
    /// Relay to a single member of the sender's room.
    Direct {
        recipient: SessionId,
        message: PeerMessage,
    },
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String, ControlError> {
        let frame = match self {
            Self::Handshake { room } => serde_json::json!([Verb::Handshake.as_str(), room]),
            Self::Broadcast(message) => {
                serde_json::json!([message.verb().as_str(), message.payload()?])
            }
            Self::Direct { recipient, message } => {
                serde_json::json!([message.verb().as_str(), recipient, message.payload()?])
            }
        };
        Ok(frame.to_string())
    }

    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let (verb, mut args) = split_frame(text)?;
        match verb {
            Verb::Handshake => match args.as_slice() {
                [Value::String(room)] => Ok(Self::Handshake { room: room.clone() }),
                [_] => Err(ControlError::InvalidField {
                    verb: verb.as_str(),
                    field: "room",
                }),
                _ => Err(bad_arity(verb, &args)),
            },
            Verb::UpdateUsers => Err(ControlError::UnexpectedVerb(verb.as_str())),
            _ => match args.len() {
                1 => {
                    let payload = args.remove(0);
                    Ok(Self::Broadcast(PeerMessage::from_parts(verb, payload)?))
                }
                2 => {
                    let recipient = session_id_field(verb, &args[0], "recipient")?;
                    let payload = args.remove(1);
                    Ok(Self::Direct {
                        recipient,
                        message: PeerMessage::from_parts(verb, payload)?,
                    })
                }
                _ => Err(bad_arity(verb, &args)),
            },
        }
    }
}

// ============================================================================
// Relay -> Client
// ============================================================================

/// A control message as delivered by the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Assigned session id; first message on every connection.
    Handshake { session_id: SessionId },
    /// Full roster of the room.
    UpdateUsers { members: Vec<SessionId> },
    /// Peer message stamped with its authoritative sender.
    Relayed {
        sender: SessionId,
        message: PeerMessage,
    },
}

impl ServerMessage {
    pub fn to_text(&self) -> Result<String, ControlError> {
        let frame = match self {
            Self::Handshake { session_id } => {
                serde_json::json!([Verb::Handshake.as_str(), session_id])
            }
            Self::UpdateUsers { members } => {
                serde_json::json!([Verb::UpdateUsers.as_str(), members])
            }
            Self::Relayed { sender, message } => {
                serde_json::json!([message.verb().as_str(), sender, message.payload()?])
            }
        };
        Ok(frame.to_string())
    }

    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let (verb, mut args) = split_frame(text)?;
        match verb {
            Verb::Handshake => match args.as_slice() {
                [id] => Ok(Self::Handshake {
                    session_id: session_id_field(verb, id, "session_id")?,
                }),
                _ => Err(bad_arity(verb, &args)),
            },
            Verb::UpdateUsers => match args.len() {
                1 => {
                    let members = serde_json::from_value(args.remove(0)).map_err(|_| {
                        ControlError::InvalidField {
                            verb: verb.as_str(),
                            field: "members",
                        }
                    })?;
                    Ok(Self::UpdateUsers { members })
                }
                _ => Err(bad_arity(verb, &args)),
            },
            _ => match args.len() {
                2 => {
                    let sender = session_id_field(verb, &args[0], "sender")?;
                    let payload = args.remove(1);
                    Ok(Self::Relayed {
                        sender,
                        message: PeerMessage::from_parts(verb, payload)?,
                    })
                }
                _ => Err(bad_arity(verb, &args)),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn steal() -> PeerMessage {
        PeerMessage::StealEl(StealRequest {
            id_data: IdData {
                original_creator: 3,
                sync_id: 3072,
            },
            options: StealOptions {
                transfer: vec!["color".to_string()],
            },
            handoff: AttributeValues::new(),
        })
    }

    #[test]
    fn test_handshake_shapes() {
        let text = ClientMessage::Handshake {
            room: "demo".to_string(),
        }
        .to_text()
        .unwrap();
        assert_eq!(text, r#"["HANDSHAKE","demo"]"#);

        let text = ServerMessage::Handshake { session_id: 7 }.to_text().unwrap();
        assert_eq!(text, r#"["HANDSHAKE",7]"#);
        assert_eq!(
            ServerMessage::parse(&text).unwrap(),
            ServerMessage::Handshake { session_id: 7 }
        );
    }

    #[test]
    fn test_update_users_parses() {
        let msg = ServerMessage::parse(r#"["UPDATE_USERS",[3,7,9]]"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::UpdateUsers {
                members: vec![3, 7, 9]
            }
        );
    }

    #[test]
    fn test_broadcast_and_direct_arity() {
        let broadcast = ClientMessage::Broadcast(steal()).to_text().unwrap();
        let value: Value = serde_json::from_str(&broadcast).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert_eq!(value[0], "STEAL_EL");
        assert_eq!(value[1]["idData"]["originalCreator"], 3);
        assert_eq!(value[1]["options"]["transfer"][0], "color");
        assert!(value[1].get("handoff").is_none());

        let direct = ClientMessage::Direct {
            recipient: 9,
            message: steal(),
        }
        .to_text()
        .unwrap();
        match ClientMessage::parse(&direct).unwrap() {
            ClientMessage::Direct { recipient, message } => {
                assert_eq!(recipient, 9);
                assert_eq!(message, steal());
            }
            other => panic!("expected direct, got {other:?}"),
        }
    }

    #[test]
    fn test_template_wire_names() {
        let template = RemoteElTemplate {
            sync_id: 3072,
            html: Some("<a-box></a-box>".to_string()),
            config: SyncConfig {
                components: "material".to_string(),
                transferables: "color".to_string(),
                world: false,
            },
            transferables: [("color".to_string(), Some("red".to_string()))].into(),
            ..Default::default()
        };
        let text = ServerMessage::Relayed {
            sender: 3,
            message: PeerMessage::UpdateRemoteEl(template.clone()),
        }
        .to_text()
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[0], "UPDATE_REMOTE_EL");
        assert_eq!(value[1], 3);
        assert_eq!(value[2]["syncId"], 3072);
        assert_eq!(value[2]["config"]["transferables"], "color");
        assert!(value[2].get("was").is_none());

        match ServerMessage::parse(&text).unwrap() {
            ServerMessage::Relayed {
                message: PeerMessage::UpdateRemoteEl(got),
                ..
            } => assert_eq!(got, template),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_template_accepts_missing_optional_fields() {
        let msg = ServerMessage::parse(r#"["UPDATE_REMOTE_EL",4,{"syncId":4096,"was":{"originalCreator":3,"syncId":4096}}]"#)
            .unwrap();
        let ServerMessage::Relayed {
            sender,
            message: PeerMessage::UpdateRemoteEl(t),
        } = msg
        else {
            panic!("wrong variant");
        };
        assert_eq!(sender, 4);
        assert_eq!(
            t.was,
            Some(IdData {
                original_creator: 3,
                sync_id: 4096
            })
        );
        assert_eq!(t.config, SyncConfig::default());
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(matches!(ClientMessage::parse("{nope"), Err(ControlError::Json(_))));
        assert!(matches!(ClientMessage::parse(r#"{"a":1}"#), Err(ControlError::NotAnArray)));
        assert!(matches!(ClientMessage::parse("[]"), Err(ControlError::MissingVerb)));
        assert!(matches!(
            ClientMessage::parse(r#"["DANCE",{}]"#),
            Err(ControlError::UnknownVerb(v)) if v == "DANCE"
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["UPDATE_USERS",[1]]"#),
            Err(ControlError::UnexpectedVerb(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["REMOVE_REMOTE_EL",1,2,{}]"#),
            Err(ControlError::BadArity { len: 4, .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["REMOVE_REMOTE_EL",{"syncId":"x"}]"#),
            Err(ControlError::InvalidField { .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["UPDATE_HTML",-1,{"syncId":1,"htmlString":""}]"#),
            Err(ControlError::InvalidField {
                field: "recipient",
                ..
            })
        ));
    }

    #[test]
    fn test_transferable_names_normalised() {
        let config = SyncConfig {
            transferables: " Color, ,material ".to_string(),
            ..Default::default()
        };
        assert_eq!(config.transferable_names(), vec!["color", "material"]);
        assert!(SyncConfig::default().component_names().is_empty());
    }
}
