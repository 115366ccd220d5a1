//! MQTT Codec Tests
//!
//! Round-trips every control packet through the encoder and decoder and
//! exercises the wire-format failure conditions.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use test_case::test_case;

use crate::codec::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, FilterRequest, Packet, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, SubAck, SubackReturnCode, Subscribe, UnsubAck,
    Unsubscribe, Will,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, _)) => Ok(packet),
        None => Err(DecodeError::InsufficientData),
    }
}

fn roundtrip(packet: Packet) {
    let encoded = encode_packet(&packet);
    let decoded = decode_packet(&encoded).unwrap();
    assert_eq!(packet, decoded);
}

// ============================================================================
// Remaining length encoding
// ============================================================================

#[test_case(0, &[0x00])]
#[test_case(127, &[0x7F])]
#[test_case(128, &[0x80, 0x01])]
#[test_case(16_383, &[0xFF, 0x7F])]
#[test_case(16_384, &[0x80, 0x80, 0x01])]
#[test_case(268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F])]
fn test_variable_int_vectors(value: u32, expected: &[u8]) {
    let mut buf = BytesMut::new();
    write_variable_int(&mut buf, value).unwrap();
    assert_eq!(&buf[..], expected);

    let (decoded, consumed) = read_variable_int(&buf).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(consumed, expected.len());
}

#[test]
fn test_variable_int_too_large() {
    let mut buf = BytesMut::new();
    assert_eq!(
        write_variable_int(&mut buf, 268_435_456),
        Err(EncodeError::PacketTooLarge)
    );
}

#[test]
fn test_variable_int_malformed() {
    // Five continuation bytes can never terminate
    assert_eq!(
        read_variable_int(&[0x80, 0x80, 0x80, 0x80, 0x01]),
        Err(DecodeError::MalformedRemainingLength)
    );
}

#[test]
fn test_variable_int_incomplete() {
    assert_eq!(
        read_variable_int(&[0x80, 0x80]),
        Err(DecodeError::InsufficientData)
    );
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

#[test]
fn test_connect_minimal() {
    roundtrip(Packet::Connect(Box::new(Connect {
        client_id: "client-1".to_string(),
        ..Default::default()
    })));
}

#[test]
fn test_connect_full() {
    roundtrip(Packet::Connect(Box::new(Connect {
        client_id: "client-1".to_string(),
        clean_start: false,
        keep_alive: 300,
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"secret")),
        will: Some(Will {
            topic: "last/will".to_string(),
            payload: Bytes::from_static(b"goodbye"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    })));
}

#[test]
fn test_connect_empty_client_id() {
    roundtrip(Packet::Connect(Box::new(Connect::default())));
}

#[test]
fn test_connect_reserved_flag_rejected() {
    let mut encoded = encode_packet(&Packet::Connect(Box::new(Connect::default())));
    // Flip the reserved bit of the connect flags:
    // fixed header (2) + protocol name (6) + level (1)
    encoded[9] |= 0x01;
    assert_eq!(decode_packet(&encoded), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_connect_validate() {
    let connect = Connect {
        client_id: "c".to_string(),
        ..Default::default()
    };
    assert!(connect.validate().is_ok());

    let bad_name = Connect {
        protocol_name: "MQIsdp".to_string(),
        ..connect.clone()
    };
    assert_eq!(
        bad_name.validate(),
        Err(ConnectReturnCode::UnacceptableProtocolVersion)
    );

    let bad_level = Connect {
        protocol_level: 3,
        ..connect.clone()
    };
    assert_eq!(
        bad_level.validate(),
        Err(ConnectReturnCode::UnacceptableProtocolVersion)
    );

    let empty_persistent = Connect {
        client_id: String::new(),
        clean_start: false,
        ..Default::default()
    };
    assert_eq!(
        empty_persistent.validate(),
        Err(ConnectReturnCode::IdentifierRejected)
    );
}

#[test]
fn test_connack_roundtrip() {
    roundtrip(Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
    }));
    roundtrip(Packet::ConnAck(ConnAck {
        session_present: false,
        return_code: ConnectReturnCode::NotAuthorized,
    }));
}

#[test]
fn test_connack_wire_format() {
    let encoded = encode_packet(&Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::IdentifierRejected,
    }));
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x01, 0x02]);
}

// ============================================================================
// PUBLISH and acks
// ============================================================================

#[test]
fn test_publish_qos0() {
    roundtrip(Packet::Publish(Publish {
        topic: "sensors/temp".to_string(),
        payload: Bytes::from_static(b"21.5"),
        ..Default::default()
    }));
}

#[test]
fn test_publish_qos1_retained() {
    roundtrip(Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "status".to_string(),
        packet_id: Some(42),
        payload: Bytes::from_static(b"ok"),
        ..Default::default()
    }));
}

#[test]
fn test_publish_qos2_dup() {
    roundtrip(Packet::Publish(Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        topic: "a/b/c".to_string(),
        packet_id: Some(7),
        payload: Bytes::new(),
        ..Default::default()
    }));
}

#[test]
fn test_publish_flags_wire_format() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        dup: true,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "t".to_string(),
        packet_id: Some(1),
        ..Default::default()
    }));
    // dup | qos1 | retain = 0b1011
    assert_eq!(encoded[0], 0x3B);
}

#[test]
fn test_publish_qos3_rejected() {
    // type 3, flags qos=3
    let encoded = [0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
    assert_eq!(decode_packet(&encoded), Err(DecodeError::InvalidQoS(3)));
}

#[test]
fn test_publish_dup_on_qos0_rejected() {
    let encoded = [0x38, 0x03, 0x00, 0x01, b't'];
    assert!(matches!(
        decode_packet(&encoded),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_publish_zero_packet_id_rejected() {
    let encoded = [0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00];
    assert_eq!(
        decode_packet(&encoded),
        Err(DecodeError::InvalidPacketIdentifier)
    );
}

#[test]
fn test_publish_wildcard_topic_rejected() {
    let publish = Packet::Publish(Publish {
        topic: "a/+/b".to_string(),
        ..Default::default()
    });
    let encoded = encode_packet(&publish);
    assert!(matches!(
        decode_packet(&encoded),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_ack_roundtrips() {
    roundtrip(Packet::PubAck(PubAck { packet_id: 1 }));
    roundtrip(Packet::PubRec(PubRec { packet_id: 2 }));
    roundtrip(Packet::PubRel(PubRel { packet_id: 3 }));
    roundtrip(Packet::PubComp(PubComp { packet_id: 4 }));
}

#[test]
fn test_pubrel_flags() {
    let encoded = encode_packet(&Packet::PubRel(PubRel { packet_id: 5 }));
    assert_eq!(&encoded[..], &[0x62, 0x02, 0x00, 0x05]);

    // PUBREL with flags 0000 is a protocol violation
    let bad = [0x60, 0x02, 0x00, 0x05];
    assert_eq!(decode_packet(&bad), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_puback_nonzero_flags_rejected() {
    let bad = [0x41, 0x02, 0x00, 0x05];
    assert_eq!(decode_packet(&bad), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_ack_zero_packet_id_rejected() {
    let bad = [0x40, 0x02, 0x00, 0x00];
    assert_eq!(
        decode_packet(&bad),
        Err(DecodeError::InvalidPacketIdentifier)
    );
}

// ============================================================================
// SUBSCRIBE / SUBACK / UNSUBSCRIBE / UNSUBACK
// ============================================================================

#[test]
fn test_subscribe_roundtrip() {
    roundtrip(Packet::Subscribe(Subscribe {
        packet_id: 10,
        filters: vec![
            FilterRequest {
                filter: "a/b".to_string(),
                qos: QoS::AtMostOnce,
            },
            FilterRequest {
                filter: "c/+".to_string(),
                qos: QoS::AtLeastOnce,
            },
            FilterRequest {
                filter: "#".to_string(),
                qos: QoS::ExactlyOnce,
            },
        ],
    }));
}

#[test]
fn test_subscribe_requires_0010_flags() {
    let encoded = encode_packet(&Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![FilterRequest {
            filter: "t".to_string(),
            qos: QoS::AtMostOnce,
        }],
    }));
    assert_eq!(encoded[0], 0x82);

    let mut bad = encoded.clone();
    bad[0] = 0x80;
    assert_eq!(decode_packet(&bad), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_subscribe_zero_packet_id_rejected() {
    let bad = [0x82, 0x06, 0x00, 0x00, 0x00, 0x01, b't', 0x00];
    assert_eq!(
        decode_packet(&bad),
        Err(DecodeError::InvalidPacketIdentifier)
    );
}

#[test]
fn test_subscribe_invalid_filter_rejected() {
    // "a+" is not a valid filter level
    let bad = [0x82, 0x07, 0x00, 0x01, 0x00, 0x02, b'a', b'+', 0x00];
    assert!(matches!(
        decode_packet(&bad),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_subscribe_empty_rejected() {
    let bad = [0x82, 0x02, 0x00, 0x01];
    assert!(matches!(
        decode_packet(&bad),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_suback_roundtrip() {
    roundtrip(Packet::SubAck(SubAck {
        packet_id: 10,
        return_codes: vec![
            SubackReturnCode::Granted(QoS::AtMostOnce),
            SubackReturnCode::Granted(QoS::ExactlyOnce),
            SubackReturnCode::Failure,
        ],
    }));
}

#[test]
fn test_suback_wire_format() {
    let encoded = encode_packet(&Packet::SubAck(SubAck {
        packet_id: 0x0102,
        return_codes: vec![
            SubackReturnCode::Granted(QoS::AtLeastOnce),
            SubackReturnCode::Failure,
        ],
    }));
    assert_eq!(&encoded[..], &[0x90, 0x04, 0x01, 0x02, 0x01, 0x80]);
}

#[test]
fn test_unsubscribe_roundtrip() {
    roundtrip(Packet::Unsubscribe(Unsubscribe {
        packet_id: 11,
        filters: vec!["a/b".to_string(), "c/#".to_string()],
    }));
}

#[test]
fn test_unsubscribe_requires_0010_flags() {
    let bad = [0xA0, 0x05, 0x00, 0x01, 0x00, 0x01, b't'];
    assert_eq!(decode_packet(&bad), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_unsuback_roundtrip() {
    roundtrip(Packet::UnsubAck(UnsubAck { packet_id: 12 }));
}

// ============================================================================
// PINGREQ / PINGRESP / DISCONNECT
// ============================================================================

#[test]
fn test_ping_roundtrip() {
    roundtrip(Packet::PingReq);
    roundtrip(Packet::PingResp);

    assert_eq!(&encode_packet(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(&encode_packet(&Packet::PingResp)[..], &[0xD0, 0x00]);
}

#[test]
fn test_disconnect_roundtrip() {
    roundtrip(Packet::Disconnect);
    assert_eq!(&encode_packet(&Packet::Disconnect)[..], &[0xE0, 0x00]);
}

#[test]
fn test_empty_packets_reject_payload() {
    let bad = [0xC0, 0x01, 0x00];
    assert!(matches!(
        decode_packet(&bad),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_empty_packets_reject_flags() {
    let bad = [0xC1, 0x00];
    assert_eq!(decode_packet(&bad), Err(DecodeError::InvalidFlags));
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn test_reserved_packet_types_rejected() {
    assert_eq!(
        decode_packet(&[0x00, 0x00]),
        Err(DecodeError::InvalidPacketType(0))
    );
    assert_eq!(
        decode_packet(&[0xF0, 0x00]),
        Err(DecodeError::InvalidPacketType(15))
    );
}

#[test]
fn test_partial_packet_returns_none() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        topic: "some/topic".to_string(),
        payload: Bytes::from_static(b"payload"),
        ..Default::default()
    }));

    let decoder = Decoder::new();
    for end in 1..encoded.len() {
        assert!(decoder.decode(&encoded[..end]).unwrap().is_none());
    }
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

#[test]
fn test_consumed_length_allows_pipelining() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_packet(&Packet::PingReq));
    buf.extend_from_slice(&encode_packet(&Packet::Publish(Publish {
        topic: "t".to_string(),
        ..Default::default()
    })));

    let decoder = Decoder::new();
    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingReq);
    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert!(matches!(second, Packet::Publish(_)));
}

#[test]
fn test_max_packet_size_enforced() {
    let decoder = Decoder::new().with_max_packet_size(16);
    let encoded = encode_packet(&Packet::Publish(Publish {
        topic: "topic".to_string(),
        payload: Bytes::from(vec![0u8; 64]),
        ..Default::default()
    }));
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}

#[test]
fn test_oversized_string_rejected_on_encode() {
    let publish = Packet::Publish(Publish {
        topic: "t".repeat(65536),
        ..Default::default()
    });
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    assert_eq!(
        encoder.encode(&publish, &mut buf),
        Err(EncodeError::InvalidLength)
    );
}
