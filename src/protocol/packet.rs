//! MQTT v3.1.1 Packet Definitions

use std::time::SystemTime;

use bytes::Bytes;

use super::{ConnectReturnCode, PacketType, QoS, SubackReturnCode, PROTOCOL_LEVEL};

/// MQTT Control Packet
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name from the variable header ("MQTT")
    pub protocol_name: String,
    /// Protocol level (4 for v3.1.1)
    pub protocol_level: u8,
    /// Client identifier
    pub client_id: String,
    /// Clean session flag
    pub clean_start: bool,
    /// Keep alive interval in seconds (0 = disabled)
    pub keep_alive: u16,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<Bytes>,
    /// Will message (optional)
    pub will: Option<Will>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: PROTOCOL_LEVEL,
            client_id: String::new(),
            clean_start: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
        }
    }
}

impl Connect {
    /// Validate the variable header, returning the CONNACK code to reply with
    /// on failure.
    pub fn validate(&self) -> Result<(), ConnectReturnCode> {
        if self.protocol_name != "MQTT" {
            return Err(ConnectReturnCode::UnacceptableProtocolVersion);
        }
        if self.protocol_level != PROTOCOL_LEVEL {
            return Err(ConnectReturnCode::UnacceptableProtocolVersion);
        }
        // [MQTT-3.1.3-7] a zero-byte client id requires a clean session
        if self.client_id.is_empty() && !self.clean_start {
            return Err(ConnectReturnCode::IdentifierRejected);
        }
        Ok(())
    }
}

/// Will message carried in CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    /// Will topic
    pub topic: String,
    /// Will payload
    pub payload: Bytes,
    /// Will QoS
    pub qos: QoS,
    /// Will retain flag
    pub retain: bool,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnAck {
    /// Session present flag
    pub session_present: bool,
    /// Connect return code
    pub return_code: ConnectReturnCode,
}

/// PUBLISH packet (bidirectional)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name
    pub topic: String,
    /// Packet identifier (present only for QoS > 0)
    pub packet_id: Option<u16>,
    /// Payload
    pub payload: Bytes,
    /// Server-assigned receive timestamp; never on the wire
    pub received: Option<SystemTime>,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: String::new(),
            packet_id: None,
            payload: Bytes::new(),
            received: None,
        }
    }
}

impl Publish {
    /// The ack this packet expects from the receiver, by QoS
    pub fn response(&self) -> Option<Packet> {
        let packet_id = self.packet_id.unwrap_or_default();
        match self.qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(Packet::PubAck(PubAck { packet_id })),
            QoS::ExactlyOnce => Some(Packet::PubRec(PubRec { packet_id })),
        }
    }
}

/// PUBACK packet (QoS 1 acknowledgment)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
}

/// PUBREC packet (QoS 2 assured delivery, part 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub packet_id: u16,
}

impl PubRec {
    pub fn response(&self) -> PubRel {
        PubRel {
            packet_id: self.packet_id,
        }
    }
}

/// PUBREL packet (QoS 2 assured delivery, part 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub packet_id: u16,
}

impl PubRel {
    pub fn response(&self) -> PubComp {
        PubComp {
            packet_id: self.packet_id,
        }
    }
}

/// PUBCOMP packet (QoS 2 assured delivery, part 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub packet_id: u16,
}

/// A requested subscription inside SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRequest {
    /// Topic filter
    pub filter: String,
    /// Requested maximum QoS
    pub qos: QoS,
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Requested subscriptions
    pub filters: Vec<FilterRequest>,
}

impl Subscribe {
    /// A SUBACK skeleton with one failure slot per requested filter
    pub fn response(&self) -> SubAck {
        SubAck {
            packet_id: self.packet_id,
            return_codes: vec![SubackReturnCode::Failure; self.filters.len()],
        }
    }
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier
    pub packet_id: u16,
    /// One return code per requested filter, in request order
    pub return_codes: Vec<SubackReturnCode>,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Topic filters to remove
    pub filters: Vec<String>,
}

impl Unsubscribe {
    pub fn response(&self) -> UnsubAck {
        UnsubAck {
            packet_id: self.packet_id,
        }
    }
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
}
