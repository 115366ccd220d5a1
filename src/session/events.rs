//! `$SYS` event messages
//!
//! Broker-originated events are published as JSON payloads under the
//! reserved `$SYS` namespace. Only clients with an explicit `$SYS/...`
//! subscription receive them; the topic matcher keeps them away from
//! leading wildcards.

use std::time::SystemTime;

use bytes::Bytes;
use serde::Serialize;

use crate::protocol::Publish;

/// Metadata serialized into event payloads
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Build the PUBLISH for an event on the given `$SYS` topic
pub fn event_packet(topic: String, metadata: &EventMetadata) -> Publish {
    Publish {
        topic,
        payload: Bytes::from(serde_json::to_vec(metadata).unwrap_or_default()),
        received: Some(SystemTime::now()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_packet_payload() {
        let pkt = event_packet(
            "$SYS/server/events/session.connected".to_string(),
            &EventMetadata {
                client_id: Some("c1".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(pkt.topic, "$SYS/server/events/session.connected");
        let value: serde_json::Value = serde_json::from_slice(&pkt.payload).unwrap();
        assert_eq!(value["client_id"], "c1");
        assert!(value.get("username").is_none());
    }
}
