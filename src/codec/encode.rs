//! MQTT v3.1.1 Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// MQTT Packet Encoder
#[derive(Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => encode_connack(p, buf),
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(p) => encode_ack(0x40, p.packet_id, buf),
            Packet::PubRec(p) => encode_ack(0x50, p.packet_id, buf),
            // PUBREL carries the 0010 flag pattern [MQTT-3.6.1-1]
            Packet::PubRel(p) => encode_ack(0x62, p.packet_id, buf),
            Packet::PubComp(p) => encode_ack(0x70, p.packet_id, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_unsuback(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2 + packet.protocol_name.len() // protocol name
        + 1 // protocol level
        + 1 // connect flags
        + 2 // keep alive
        + 2 + packet.client_id.len();

    if let Some(ref will) = packet.will {
        remaining_length += 2 + will.topic.len();
        remaining_length += 2 + will.payload.len();
    }
    if let Some(ref username) = packet.username {
        remaining_length += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        remaining_length += 2 + password.len();
    }

    buf.put_u8(0x10);
    write_variable_int(buf, remaining_length as u32)?;

    write_string(buf, &packet.protocol_name)?;
    buf.put_u8(packet.protocol_level);

    let mut connect_flags: u8 = 0;
    if packet.clean_start {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);
    write_string(buf, &packet.client_id)?;

    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x20);
    buf.put_u8(0x02);
    buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
    buf.put_u8(packet.return_code as u8);
    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2 + packet.topic.len();
    if packet.qos != QoS::AtMostOnce {
        remaining_length += 2;
    }
    remaining_length += packet.payload.len();

    let mut first_byte: u8 = 0x30;
    if packet.dup {
        first_byte |= 0x08;
    }
    first_byte |= (packet.qos as u8) << 1;
    if packet.retain {
        first_byte |= 0x01;
    }
    buf.put_u8(first_byte);
    write_variable_int(buf, remaining_length as u32)?;

    write_string(buf, &packet.topic)?;
    if packet.qos != QoS::AtMostOnce {
        buf.put_u16(packet.packet_id.unwrap_or_default());
    }
    buf.put_slice(&packet.payload);

    Ok(())
}

/// Shared shape of PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK: a fixed
/// header byte plus the packet identifier.
fn encode_ack(first_byte: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2;
    for request in &packet.filters {
        remaining_length += 2 + request.filter.len() + 1;
    }

    // SUBSCRIBE carries the 0010 flag pattern [MQTT-3.8.1-1]
    buf.put_u8(0x82);
    write_variable_int(buf, remaining_length as u32)?;
    buf.put_u16(packet.packet_id);

    for request in &packet.filters {
        write_string(buf, &request.filter)?;
        buf.put_u8(request.qos as u8);
    }

    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length = 2 + packet.return_codes.len();

    buf.put_u8(0x90);
    write_variable_int(buf, remaining_length as u32)?;
    buf.put_u16(packet.packet_id);

    for code in &packet.return_codes {
        buf.put_u8(code.to_byte());
    }

    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2;
    for filter in &packet.filters {
        remaining_length += 2 + filter.len();
    }

    // UNSUBSCRIBE carries the 0010 flag pattern [MQTT-3.10.1-1]
    buf.put_u8(0xA2);
    write_variable_int(buf, remaining_length as u32)?;
    buf.put_u16(packet.packet_id);

    for filter in &packet.filters {
        write_string(buf, filter)?;
    }

    Ok(())
}

fn encode_unsuback(packet: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    encode_ack(0xB0, packet.packet_id, buf)
}
