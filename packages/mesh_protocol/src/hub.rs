//! Hub wire protocol: JSON text frames tagged by `type`.
//!
//! One hub session per transport connection. The hub speaks first with a
//! `binding`; after that either side may send at any time. `forward.data` is
//! opaque to the hub and is relayed verbatim.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Longest hostname the hub accepts.
pub const MAX_HOSTNAME_LEN: usize = 253;

/// One STUN/TURN server entry, in the shape browsers expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE configuration handed to every peer connection a node creates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfiguration {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// Address assignment delivered once per hub session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubBinding {
    pub address: String,
    pub configuration: IceConfiguration,
}

/// Messages sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every session.
    Binding {
        address: String,
        configuration: IceConfiguration,
    },

    /// Relayed signaling payload; `from` is stamped by the hub.
    Forward {
        from: String,
        to: String,
        data: serde_json::Value,
    },

    RegisterOk {
        request_id: String,
        hostname: String,
    },

    RegisterFail {
        request_id: String,
        reason: String,
    },

    LookupOk {
        request_id: String,
        hostname: String,
        /// Empty when the hostname is unknown.
        addresses: Vec<String>,
    },

    LookupFail {
        request_id: String,
        reason: String,
    },
}

/// Messages sent by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Relay `data` to `to`. A client-supplied `from` is ignored by the hub.
    Forward {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        data: serde_json::Value,
    },

    Register {
        request_id: String,
        hostname: String,
    },

    Lookup {
        request_id: String,
        hostname: String,
    },
}

impl ClientMessage {
    /// Parse one text frame; anything unrecognised is a protocol violation.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Reject hostnames the directory should never hold.
pub fn validate_hostname(hostname: &str) -> Result<(), ProtocolError> {
    if hostname.is_empty()
        || hostname.len() > MAX_HOSTNAME_LEN
        || hostname.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ProtocolError::InvalidHostname(hostname.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binding_wire_shape() {
        let msg = ServerMessage::Binding {
            address: "0.0.0.1".into(),
            configuration: IceConfiguration {
                ice_servers: vec![IceServer {
                    urls: vec!["stun:stun.l.google.com:19302".into()],
                    username: None,
                    credential: None,
                }],
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "binding",
                "address": "0.0.0.1",
                "configuration": {
                    "iceServers": [{ "urls": ["stun:stun.l.google.com:19302"] }]
                }
            })
        );
    }

    #[test]
    fn forward_without_from_parses() {
        let msg = ClientMessage::parse(r#"{"type":"forward","to":"0.0.0.2","data":{"k":1}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Forward {
                from: None,
                to: "0.0.0.2".into(),
                data: json!({"k": 1}),
            }
        );
    }

    #[test]
    fn unknown_type_is_violation() {
        let err = ClientMessage::parse(r#"{"type":"shout","to":"x"}"#).unwrap_err();
        assert_eq!(err.error_code(), "protocol_violation");
        let err = ClientMessage::parse("not json").unwrap_err();
        assert_eq!(err.error_code(), "protocol_violation");
        let err = ClientMessage::parse(r#"{"type":"register","hostname":"a"}"#).unwrap_err();
        assert_eq!(err.error_code(), "protocol_violation");
    }

    #[test]
    fn lookup_reply_tags() {
        let text = ServerMessage::LookupOk {
            request_id: "7".into(),
            hostname: "printer".into(),
            addresses: vec![],
        }
        .to_text()
        .unwrap();
        assert!(text.contains(r#""type":"lookup_ok""#));
        assert!(text.contains(r#""addresses":[]"#));
    }

    #[test]
    fn hostname_validation() {
        assert!(validate_hostname("printer").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("two words").is_err());
        assert!(validate_hostname(&"a".repeat(MAX_HOSTNAME_LEN + 1)).is_err());
    }
}
