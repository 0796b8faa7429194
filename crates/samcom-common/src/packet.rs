//! samcom wire packets.
//!
//! Every packet is one JSON object per WebSocket text message. The `type`
//! field selects the body; `packet_id` and `relay_id` are envelope fields
//! shared by all types. A relay stamps `relay_id` on everything it sends
//! upstream, and the switching center trusts that stamp for routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// `relay_register` type tag: relay → center.
pub const TYPE_RELAY_REGISTER: &str = "relay_register";
/// `relay_register_ack` type tag: center → relay.
pub const TYPE_RELAY_REGISTER_ACK: &str = "relay_register_ack";
/// `auth` type tag: station → relay → center.
pub const TYPE_AUTH: &str = "auth";
/// `challenge` type tag: center → relay → station.
pub const TYPE_CHALLENGE: &str = "challenge";
/// `auth_response` type tag: station → relay → center.
pub const TYPE_AUTH_RESPONSE: &str = "auth_response";
/// `auth_result` type tag: center → relay → station.
pub const TYPE_AUTH_RESULT: &str = "auth_result";
/// `auth_logout` type tag: station → relay → center.
pub const TYPE_AUTH_LOGOUT: &str = "auth_logout";
/// `logout_result` type tag: center → relay → station.
pub const TYPE_LOGOUT_RESULT: &str = "logout_result";
/// `text` type tag: station ↔ relay ↔ center ↔ relay ↔ station.
pub const TYPE_TEXT: &str = "text";
/// `text_ack` type tag: center → relay → station.
pub const TYPE_TEXT_ACK: &str = "text_ack";
/// `error` type tag: any → any.
pub const TYPE_ERROR: &str = "error";

const KNOWN_TYPES: &[&str] = &[
    TYPE_RELAY_REGISTER,
    TYPE_RELAY_REGISTER_ACK,
    TYPE_AUTH,
    TYPE_CHALLENGE,
    TYPE_AUTH_RESPONSE,
    TYPE_AUTH_RESULT,
    TYPE_AUTH_LOGOUT,
    TYPE_LOGOUT_RESULT,
    TYPE_TEXT,
    TYPE_TEXT_ACK,
    TYPE_ERROR,
];

/// Outcome carried by `auth_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    /// The response matched; the user is now authenticated.
    Authenticated,
    /// The response did not match or no challenge was outstanding.
    Failed,
}

/// Outcome carried by `logout_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutStatus {
    /// The user's authentication and routing entry were cleared.
    LoggedOut,
    /// The user was not authenticated through the requesting relay.
    Failed,
}

/// Type-specific packet fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Relay announces itself; the relay id travels in the envelope.
    RelayRegister {},
    /// Center accepted the registration.
    RelayRegisterAck {
        /// Always [`crate::types::status::REGISTERED`].
        status: String,
    },
    /// Station asks to authenticate.
    Auth {
        /// User requesting authentication.
        user_id: String,
    },
    /// Center challenges the user.
    Challenge {
        /// User being challenged.
        user_id: String,
        /// Unguessable challenge value.
        challenge: String,
    },
    /// Station answers the challenge.
    AuthResponse {
        /// User answering.
        user_id: String,
        /// Echo of the challenge being answered.
        challenge: String,
        /// Keyed response computed with [`crate::crypto::respond`].
        response: String,
    },
    /// Center reports the authentication outcome.
    AuthResult {
        /// User the result is for.
        user_id: String,
        /// Success or failure.
        status: AuthStatus,
        /// Failure reason, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Station (or its relay, on disconnect) logs the user out.
    AuthLogout {
        /// User logging out.
        user_id: String,
    },
    /// Center reports the logout outcome.
    LogoutResult {
        /// User the result is for.
        user_id: String,
        /// Success or failure.
        status: LogoutStatus,
        /// Failure reason, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Application text message.
    Text {
        /// Sending user.
        source_user: String,
        /// Receiving user.
        target_user: String,
        /// Message body, forwarded unchanged.
        message: String,
    },
    /// Center confirms a text was forwarded to the target's relay.
    TextAck {
        /// The sender the ack is routed back to.
        user_id: String,
        /// The text's target.
        target_user: String,
        /// Always [`crate::types::status::FORWARDED`].
        status: String,
    },
    /// Protocol, routing or session error.
    Error {
        /// Human-readable reason.
        error: String,
        /// User the error concerns, so a relay can route it to a session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
}

/// A complete wire packet: envelope fields plus a typed body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Sender-scoped, monotonically increasing id. Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_id: Option<u64>,
    /// Relay stamp on relay → center traffic; the registering relay's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_id: Option<String>,
    /// Type-specific fields, tagged by `type`.
    #[serde(flatten)]
    pub body: Body,
}

/// Errors that can occur while decoding or encoding a packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The text is not valid JSON.
    #[error("malformed packet: {0}")]
    Malformed(String),
    /// The JSON value is not an object.
    #[error("packet is not a JSON object")]
    NotAnObject,
    /// The object has no `type` field.
    #[error("packet has no type")]
    MissingType,
    /// The `type` field is not a string.
    #[error("packet type is not a string")]
    InvalidType,
    /// The `type` names no known packet.
    #[error("unknown packet type: {0}")]
    UnknownType(String),
    /// A required field is absent.
    #[error("{kind} packet missing field {field}")]
    MissingField {
        /// Packet type.
        kind: &'static str,
        /// Name of the missing field.
        field: &'static str,
    },
    /// A field is missing or has the wrong shape.
    #[error("invalid {kind} packet: {reason}")]
    InvalidField {
        /// Packet type.
        kind: String,
        /// Decoder message.
        reason: String,
    },
    /// The packet could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for PacketError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

impl Packet {
    /// Wraps a body with no envelope fields set.
    #[must_use]
    pub const fn new(body: Body) -> Self {
        Self {
            packet_id: None,
            relay_id: None,
            body,
        }
    }

    /// Sets the packet id.
    #[must_use]
    pub const fn with_packet_id(mut self, packet_id: Option<u64>) -> Self {
        self.packet_id = packet_id;
        self
    }

    /// Stamps the packet with a relay id.
    #[must_use]
    pub fn stamped(mut self, relay_id: &str) -> Self {
        self.relay_id = Some(relay_id.to_string());
        self
    }

    /// Creates a `relay_register` packet.
    #[must_use]
    pub fn relay_register(relay_id: &str) -> Self {
        Self::new(Body::RelayRegister {}).stamped(relay_id)
    }

    /// Creates a `relay_register_ack` packet.
    #[must_use]
    pub fn relay_register_ack(relay_id: &str) -> Self {
        Self::new(Body::RelayRegisterAck {
            status: crate::types::status::REGISTERED.to_string(),
        })
        .stamped(relay_id)
    }

    /// Creates an `auth` packet.
    #[must_use]
    pub fn auth(user_id: &str) -> Self {
        Self::new(Body::Auth {
            user_id: user_id.to_string(),
        })
    }

    /// Creates a `challenge` packet.
    #[must_use]
    pub fn challenge(user_id: &str, challenge: &str) -> Self {
        Self::new(Body::Challenge {
            user_id: user_id.to_string(),
            challenge: challenge.to_string(),
        })
    }

    /// Creates an `auth_response` packet.
    #[must_use]
    pub fn auth_response(user_id: &str, challenge: &str, response: &str) -> Self {
        Self::new(Body::AuthResponse {
            user_id: user_id.to_string(),
            challenge: challenge.to_string(),
            response: response.to_string(),
        })
    }

    /// Creates an `auth_result` packet.
    #[must_use]
    pub fn auth_result(user_id: &str, status: AuthStatus, error: Option<&str>) -> Self {
        Self::new(Body::AuthResult {
            user_id: user_id.to_string(),
            status,
            error: error.map(str::to_string),
        })
    }

    /// Creates an `auth_logout` packet.
    #[must_use]
    pub fn auth_logout(user_id: &str) -> Self {
        Self::new(Body::AuthLogout {
            user_id: user_id.to_string(),
        })
    }

    /// Creates a `logout_result` packet.
    #[must_use]
    pub fn logout_result(user_id: &str, status: LogoutStatus, error: Option<&str>) -> Self {
        Self::new(Body::LogoutResult {
            user_id: user_id.to_string(),
            status,
            error: error.map(str::to_string),
        })
    }

    /// Creates a `text` packet.
    #[must_use]
    pub fn text(source_user: &str, target_user: &str, message: &str) -> Self {
        Self::new(Body::Text {
            source_user: source_user.to_string(),
            target_user: target_user.to_string(),
            message: message.to_string(),
        })
    }

    /// Creates a `text_ack` packet for the sender `user_id`.
    #[must_use]
    pub fn text_ack(user_id: &str, target_user: &str) -> Self {
        Self::new(Body::TextAck {
            user_id: user_id.to_string(),
            target_user: target_user.to_string(),
            status: crate::types::status::FORWARDED.to_string(),
        })
    }

    /// Creates a connection-level `error` packet.
    #[must_use]
    pub fn error(reason: &str) -> Self {
        Self::new(Body::Error {
            error: reason.to_string(),
            user_id: None,
        })
    }

    /// Creates an `error` packet addressed to one user's session.
    #[must_use]
    pub fn user_error(user_id: &str, reason: &str) -> Self {
        Self::new(Body::Error {
            error: reason.to_string(),
            user_id: Some(user_id.to_string()),
        })
    }

    /// Returns the wire type tag of this packet.
    ///
    /// # Examples
    ///
    /// ```
    /// use samcom_common::packet::{Packet, TYPE_AUTH};
    /// assert_eq!(Packet::auth("A").kind(), TYPE_AUTH);
    /// ```
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self.body {
            Body::RelayRegister {} => TYPE_RELAY_REGISTER,
            Body::RelayRegisterAck { .. } => TYPE_RELAY_REGISTER_ACK,
            Body::Auth { .. } => TYPE_AUTH,
            Body::Challenge { .. } => TYPE_CHALLENGE,
            Body::AuthResponse { .. } => TYPE_AUTH_RESPONSE,
            Body::AuthResult { .. } => TYPE_AUTH_RESULT,
            Body::AuthLogout { .. } => TYPE_AUTH_LOGOUT,
            Body::LogoutResult { .. } => TYPE_LOGOUT_RESULT,
            Body::Text { .. } => TYPE_TEXT,
            Body::TextAck { .. } => TYPE_TEXT_ACK,
            Body::Error { .. } => TYPE_ERROR,
        }
    }

    /// Returns the user whose session a relay should deliver this packet to.
    ///
    /// `text` is routed by its target; everything user-scoped by `user_id`.
    /// Relay-level packets and connection-level errors return `None`.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        match &self.body {
            Body::Auth { user_id }
            | Body::Challenge { user_id, .. }
            | Body::AuthResponse { user_id, .. }
            | Body::AuthResult { user_id, .. }
            | Body::AuthLogout { user_id }
            | Body::LogoutResult { user_id, .. }
            | Body::TextAck { user_id, .. } => Some(user_id),
            Body::Text { target_user, .. } => Some(target_user),
            Body::Error { user_id, .. } => user_id.as_deref(),
            Body::RelayRegister {} | Body::RelayRegisterAck { .. } => None,
        }
    }

    /// Returns the user a packet speaks for: the author of a request or text.
    ///
    /// Errors about a packet are routed back to this user's session.
    #[must_use]
    pub fn originator(&self) -> Option<&str> {
        match &self.body {
            Body::Text { source_user, .. } => Some(source_user),
            _ => self.recipient(),
        }
    }

    /// Serializes this packet to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Encode`] if serialization fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use samcom_common::packet::Packet;
    /// let json = Packet::auth("A").encode().unwrap();
    /// assert_eq!(json, r#"{"type":"auth","user_id":"A"}"#);
    /// ```
    pub fn encode(&self) -> Result<String, PacketError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses one JSON text message into a typed `Packet`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] describing why the text is not a valid packet:
    /// malformed JSON, no or non-string `type`, an unknown `type`, or a known
    /// type with missing or ill-typed fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use samcom_common::packet::{Packet, PacketError};
    /// let p = Packet::parse(r#"{"type":"auth","user_id":"A","packet_id":7}"#).unwrap();
    /// assert_eq!(p.packet_id, Some(7));
    /// assert!(matches!(
    ///     Packet::parse(r#"{"type":"bogus"}"#),
    ///     Err(PacketError::UnknownType(_))
    /// ));
    /// ```
    pub fn parse(text: &str) -> Result<Self, PacketError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| PacketError::Malformed(e.to_string()))?;
        let Some(object) = value.as_object() else {
            return Err(PacketError::NotAnObject);
        };
        let kind = match object.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(PacketError::InvalidType),
            None => return Err(PacketError::MissingType),
        };
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(PacketError::UnknownType(kind));
        }

        let packet: Self = serde_json::from_value(value).map_err(|e| PacketError::InvalidField {
            kind: kind.clone(),
            reason: e.to_string(),
        })?;

        if packet.relay_id.is_none()
            && matches!(
                packet.body,
                Body::RelayRegister {} | Body::RelayRegisterAck { .. }
            )
        {
            return Err(PacketError::MissingField {
                kind: packet.kind(),
                field: "relay_id",
            });
        }
        Ok(packet)
    }
}
