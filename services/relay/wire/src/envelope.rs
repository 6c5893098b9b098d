//! Message envelope for the relay wire protocol.
//!
//! Every frame carries one [`Envelope`]: optional sequencing/correlation
//! fields plus a tagged [`Body`]. Connection-scoped (sequenced) messages
//! carry `msg_id` and are retained until cumulatively acked; control
//! messages carry at most the piggybacked `last_received` ack.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Complete wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender's per-connection sequence number (sequenced messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    /// Cumulative ack: highest peer sequence number seen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_received: Option<u64>,
    /// Request id, set on messages expecting a reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    /// Echo of a request's `reply_to`, set on responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_ack: Option<u64>,
    /// The message body, tagged by kind
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// Create a bare envelope with no sequencing or correlation fields
    pub fn new(body: Body) -> Self {
        Self {
            msg_id: None,
            last_received: None,
            reply_to: None,
            msg_ack: None,
            body,
        }
    }

    /// Whether this envelope is a response that must be routed to a
    /// pending request
    pub fn is_response(&self) -> bool {
        self.msg_ack.is_some()
    }
}

/// Message kinds recognized by the relay core.
///
/// Control kinds (`Welcome` through `Bye`) are transport-scoped: they are
/// never assigned a sequence number and are not replayed after a reconnect.
/// Everything else is sequenced through the resuming queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Server greeting, sent on every freshly opened transport
    Welcome {
        /// Protocol version the server speaks
        protocol_version: u8,
        /// Stable server identifier
        server_id: String,
        /// Human-readable server banner
        banner: String,
    },
    /// Client handshake, names the identity behind the transport
    Hello {
        /// Stable client identity, e.g. `mmsi://265547240`
        client_id: String,
        /// Human-readable client banner
        banner: String,
        /// Previous connection id, when resuming after a reconnect
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_token: Option<String>,
        /// Protocol version the client speaks
        protocol_version: u8,
        /// Latitude at handshake time (decimal degrees)
        lat: f64,
        /// Longitude at handshake time (decimal degrees)
        lon: f64,
    },
    /// Server handshake acknowledgment
    Connected {
        /// Connection id assigned (or re-confirmed) by the server
        connection_id: String,
        /// Highest client sequence number the server has received,
        /// the client's replay baseline
        last_received_msg_id: u64,
    },
    /// Keep-alive probe
    Ping {
        /// Correlation id echoed by the matching pong
        corr_id: u64,
    },
    /// Keep-alive response
    Pong {
        /// Correlation id from the ping being answered
        corr_id: u64,
    },
    /// Close notification, sent best-effort before the socket goes down
    Bye {
        /// Close reason code, see [`crate::CloseReason`]
        code: u16,
        /// Human-readable close reason
        reason: String,
    },
    /// Vessel position update
    PositionReport {
        /// Latitude in decimal degrees
        lat: f64,
        /// Longitude in decimal degrees
        lon: f64,
    },
    /// Advertise a named service on this connection (request)
    RegisterService {
        /// Service name
        name: String,
    },
    /// Response to [`Body::RegisterService`]
    RegisterServiceResult {
        /// Whether the registration was recorded
        accepted: bool,
        /// Rejection reason when not accepted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Proximity lookup of service providers (request)
    FindService {
        /// Service name to look for
        name: String,
        /// Maximum great-circle distance from the caller, in meters
        max_distance_m: f64,
        /// Maximum number of identities to return
        max_count: u32,
    },
    /// Response to [`Body::FindService`]
    FindServiceResult {
        /// Matching identities, ascending by distance from the caller
        targets: Vec<String>,
    },
    /// Invoke a service on a remote identity (request)
    InvokeService {
        /// Registered service name to run on the target
        service: String,
        /// Identity offering the service
        target: String,
        /// Calling identity, stamped by the server when forwarding
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
        /// Opaque invocation payload
        payload: Value,
    },
    /// Response to [`Body::InvokeService`]
    InvokeServiceResult {
        /// Application-level failure, when the invocation did not succeed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Result payload on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Fire-and-forget broadcast, fanned out by the server
    BroadcastSend {
        /// Channel (topic) name the payload belongs to
        channel: String,
        /// Geofence radius around the sender, in meters; `None` reaches
        /// every other live connection
        #[serde(default, skip_serializing_if = "Option::is_none")]
        radius_m: Option<f64>,
        /// Whether recipients should acknowledge delivery
        #[serde(default)]
        ack: bool,
        /// Opaque broadcast payload
        payload: Value,
    },
    /// Server-to-client broadcast delivery
    BroadcastDeliver {
        /// Channel (topic) name the payload belongs to
        channel: String,
        /// Identity of the broadcasting vessel
        origin: String,
        /// Whether the origin asked for a delivery acknowledgment
        #[serde(default)]
        ack: bool,
        /// Opaque broadcast payload
        payload: Value,
    },
    /// Delivery acknowledgment for an acked broadcast
    BroadcastAck {
        /// Channel of the acknowledged broadcast
        channel: String,
        /// Identity the acknowledgment is destined for
        origin: String,
    },
    /// Generic client-to-client relay
    Relay {
        /// Destination identity
        to: String,
        /// Sending identity, stamped by the server when forwarding
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Opaque relay payload
        payload: Value,
    },
}

impl Body {
    /// Whether this kind is transport-scoped control traffic (never
    /// sequenced, never replayed)
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Body::Welcome { .. }
                | Body::Hello { .. }
                | Body::Connected { .. }
                | Body::Ping { .. }
                | Body::Pong { .. }
                | Body::Bye { .. }
        )
    }

    /// Short kind name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Welcome { .. } => "welcome",
            Body::Hello { .. } => "hello",
            Body::Connected { .. } => "connected",
            Body::Ping { .. } => "ping",
            Body::Pong { .. } => "pong",
            Body::Bye { .. } => "bye",
            Body::PositionReport { .. } => "position_report",
            Body::RegisterService { .. } => "register_service",
            Body::RegisterServiceResult { .. } => "register_service_result",
            Body::FindService { .. } => "find_service",
            Body::FindServiceResult { .. } => "find_service_result",
            Body::InvokeService { .. } => "invoke_service",
            Body::InvokeServiceResult { .. } => "invoke_service_result",
            Body::BroadcastSend { .. } => "broadcast_send",
            Body::BroadcastDeliver { .. } => "broadcast_deliver",
            Body::BroadcastAck { .. } => "broadcast_ack",
            Body::Relay { .. } => "relay",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let mut env = Envelope::new(Body::PositionReport {
            lat: 57.7,
            lon: 11.97,
        });
        env.msg_id = Some(42);
        env.last_received = Some(17);

        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn test_tag_is_flattened() {
        let env = Envelope::new(Body::Ping { corr_id: 7 });
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(json["type"], "ping");
        assert_eq!(json["corr_id"], 7);
        // absent correlation fields must not be serialized at all
        assert!(json.get("msg_id").is_none());
        assert!(json.get("reply_to").is_none());
    }

    #[test]
    fn test_request_response_fields() {
        let mut req = Envelope::new(Body::FindService {
            name: "Ping".to_string(),
            max_distance_m: 10_000.0,
            max_count: 5,
        });
        req.reply_to = Some(3);
        assert!(!req.is_response());

        let mut resp = Envelope::new(Body::FindServiceResult {
            targets: vec!["mmsi://1".to_string()],
        });
        resp.msg_ack = Some(3);
        assert!(resp.is_response());
    }

    #[test]
    fn test_control_kinds() {
        assert!(Body::Ping { corr_id: 1 }.is_control());
        assert!(Body::Bye {
            code: 1000,
            reason: String::new()
        }
        .is_control());
        assert!(!Body::PositionReport { lat: 0.0, lon: 0.0 }.is_control());
        assert!(!Body::Relay {
            to: "mmsi://2".to_string(),
            from: None,
            payload: Value::Null,
        }
        .is_control());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<Envelope, _> =
            serde_json::from_str(r#"{"type":"warp_drive","factor":9}"#);
        assert!(result.is_err());
    }
}
