//! MQTT v3.1.1 Packet Decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, FilterRequest, Packet, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, SubackReturnCode, Subscribe, UnsubAck, Unsubscribe, Will,
};

/// MQTT Packet Decoder
///
/// Feeds on a byte buffer filled from any transport. `decode` returns
/// `Ok(None)` until a complete packet is buffered, then the packet and the
/// number of bytes it occupied.
pub struct Decoder {
    /// Maximum accepted packet size
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer.
    /// Returns (packet, bytes_consumed) or an error.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Fixed header: 4-bit type, 4-bit flags
        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        // Wait for the complete packet
        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => decode_connect(flags, payload)?,
            2 => decode_connack(flags, payload)?,
            3 => decode_publish(flags, payload)?,
            4 => Packet::PubAck(PubAck {
                packet_id: decode_ack(flags, payload)?,
            }),
            5 => Packet::PubRec(PubRec {
                packet_id: decode_ack(flags, payload)?,
            }),
            6 => {
                // PUBREL carries the 0010 flag pattern [MQTT-3.6.1-1]
                if flags != 0x02 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PubRel(PubRel {
                    packet_id: decode_ack(0, payload)?,
                })
            }
            7 => Packet::PubComp(PubComp {
                packet_id: decode_ack(flags, payload)?,
            }),
            8 => decode_subscribe(flags, payload)?,
            9 => decode_suback(flags, payload)?,
            10 => decode_unsubscribe(flags, payload)?,
            11 => decode_unsuback(flags, payload)?,
            12 => decode_empty(flags, payload, Packet::PingReq)?,
            13 => decode_empty(flags, payload, Packet::PingResp)?,
            14 => decode_empty(flags, payload, Packet::Disconnect)?,
            t => return Err(DecodeError::InvalidPacketType(t)),
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_connect(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let mut pos = 0;

    let (protocol_name, len) = read_string(&payload[pos..])?;
    let protocol_name = protocol_name.to_string();
    pos += len;

    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let protocol_level = payload[pos];
    pos += 1;

    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = payload[pos];
    pos += 1;

    // [MQTT-3.1.2-3] reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_start = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // [MQTT-3.1.2-22] if username flag is 0, password flag must be 0
    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    if will_qos > 2 {
        return Err(DecodeError::InvalidQoS(will_qos));
    }

    // [MQTT-3.1.2-11] will QoS and retain must be 0 without a will
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    if pos + 2 > payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let keep_alive = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
    pos += 2;

    let (client_id, len) = read_string(&payload[pos..])?;
    let client_id = client_id.to_string();
    pos += len;

    let will = if will_flag {
        let (will_topic, len) = read_string(&payload[pos..])?;
        let will_topic = will_topic.to_string();
        pos += len;

        let (will_payload, len) = read_binary(&payload[pos..])?;
        let will_payload = Bytes::copy_from_slice(will_payload);
        pos += len;

        Some(Will {
            topic: will_topic,
            payload: will_payload,
            qos: QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&payload[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, _len) = read_binary(&payload[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        protocol_name,
        protocol_level,
        client_id,
        clean_start,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("CONNACK payload must be 2 bytes"));
    }

    // Only bit 0 (session present) is valid in the acknowledge flags
    if (payload[0] & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code = ConnectReturnCode::from_u8(payload[1])
        .ok_or(DecodeError::MalformedPacket("unknown connect return code"))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (payload[0] & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    // [MQTT-3.3.1-2] DUP must be 0 for QoS 0
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP set on a QoS 0 message"));
    }

    let mut pos = 0;

    let (topic, len) = read_string(&payload[pos..])?;
    if crate::topic::validate_topic(topic).is_err() {
        return Err(DecodeError::MalformedPacket("invalid topic name"));
    }
    let topic = topic.to_string();
    pos += len;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&payload[pos..])?;
        if id == 0 {
            return Err(DecodeError::InvalidPacketIdentifier);
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(&payload[pos..]),
        received: None,
    }))
}

/// Decode the two-byte packet identifier shared by PUBACK, PUBREC, PUBREL
/// and PUBCOMP; the caller validates non-zero flag patterns first.
fn decode_ack(flags: u8, payload: &[u8]) -> Result<u16, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("ack payload must be 2 bytes"));
    }
    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    if packet_id == 0 {
        return Err(DecodeError::InvalidPacketIdentifier);
    }
    Ok(packet_id)
}

fn decode_subscribe(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    // SUBSCRIBE carries the 0010 flag pattern [MQTT-3.8.1-1]
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(payload)?;
    if packet_id == 0 {
        return Err(DecodeError::InvalidPacketIdentifier);
    }

    let mut pos = 2;
    let mut filters = Vec::new();
    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        if crate::topic::validate_filter(filter).is_err() {
            return Err(DecodeError::MalformedPacket("invalid topic filter"));
        }
        let filter = filter.to_string();
        pos += len;

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let qos_byte = payload[pos];
        pos += 1;

        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
        filters.push(FilterRequest { filter, qos });
    }

    // [MQTT-3.8.3-3] at least one filter is required
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must carry at least one filter",
        ));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(payload)?;
    if packet_id == 0 {
        return Err(DecodeError::InvalidPacketIdentifier);
    }

    let mut return_codes = Vec::with_capacity(payload.len() - 2);
    for &code in &payload[2..] {
        return_codes.push(
            SubackReturnCode::from_u8(code)
                .ok_or(DecodeError::MalformedPacket("unknown SUBACK return code"))?,
        );
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    // UNSUBSCRIBE carries the 0010 flag pattern [MQTT-3.10.1-1]
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(payload)?;
    if packet_id == 0 {
        return Err(DecodeError::InvalidPacketIdentifier);
    }

    let mut pos = 2;
    let mut filters = Vec::new();
    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        if crate::topic::validate_filter(filter).is_err() {
            return Err(DecodeError::MalformedPacket("invalid topic filter"));
        }
        filters.push(filter.to_string());
        pos += len;
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must carry at least one filter",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

fn decode_unsuback(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    Ok(Packet::UnsubAck(UnsubAck {
        packet_id: decode_ack(flags, payload)?,
    }))
}

fn decode_empty(flags: u8, payload: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if !payload.is_empty() {
        return Err(DecodeError::MalformedPacket("unexpected payload"));
    }
    Ok(packet)
}
