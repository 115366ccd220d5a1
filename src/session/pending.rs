//! Storage for unacknowledged packets
//!
//! A session keeps two of these lists: one for the outbound QoS flows
//! (PUBLISH awaiting PUBACK/PUBREC, PUBREL awaiting PUBCOMP) and one for
//! inbound QoS 2 PUBLISH packets awaiting PUBREL.

use parking_lot::Mutex;
use prometheus::IntGauge;

use crate::protocol::Packet;

/// Append-ordered list of pending packets keyed by packet identifier
#[derive(Default)]
pub struct PendingList {
    messages: Mutex<Vec<(u16, Packet)>>,
    gauge: Option<IntGauge>,
}

impl PendingList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list that reports its size through the given gauge
    pub fn with_gauge(gauge: IntGauge) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            gauge: Some(gauge),
        }
    }

    /// Add a pending packet at the end of the list. If the identifier is
    /// already present the entry is replaced in place and false is returned,
    /// which doubles as duplicate detection for inbound QoS 2 flows.
    pub fn add(&self, id: u16, packet: Packet) -> bool {
        let mut messages = self.messages.lock();
        for entry in messages.iter_mut() {
            if entry.0 == id {
                entry.1 = packet;
                return false;
            }
        }
        messages.push((id, packet));
        if let Some(gauge) = &self.gauge {
            gauge.inc();
        }
        true
    }

    /// Remove a pending packet, scanning from the front where acknowledged
    /// entries are expected. Order of the remainder is preserved.
    pub fn remove(&self, id: u16) -> bool {
        let mut messages = self.messages.lock();
        if let Some(i) = messages.iter().position(|(entry_id, _)| *entry_id == id) {
            messages.remove(i);
            if let Some(gauge) = &self.gauge {
                gauge.dec();
            }
            true
        } else {
            false
        }
    }

    /// Whether the identifier is currently pending
    pub fn contains(&self, id: u16) -> bool {
        self.messages.lock().iter().any(|(entry_id, _)| *entry_id == id)
    }

    pub fn clear(&self) {
        let mut messages = self.messages.lock();
        if let Some(gauge) = &self.gauge {
            gauge.sub(messages.len() as i64);
        }
        messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Snapshot of all pending packets in order
    pub fn packets(&self) -> Vec<Packet> {
        self.messages.lock().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PubRel, Publish, QoS};

    fn publish(id: u16) -> Packet {
        Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: "t".to_string(),
            packet_id: Some(id),
            ..Default::default()
        })
    }

    #[test]
    fn test_add_and_duplicate() {
        let list = PendingList::new();
        assert!(list.add(1, publish(1)));
        assert!(list.add(2, publish(2)));
        assert!(!list.add(1, publish(1)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_replace_keeps_position() {
        let list = PendingList::new();
        list.add(1, publish(1));
        list.add(2, publish(2));
        // QoS 2 flow: the PUBLISH is replaced by its PUBREL in place
        assert!(!list.add(1, Packet::PubRel(PubRel { packet_id: 1 })));
        let packets = list.packets();
        assert_eq!(packets[0], Packet::PubRel(PubRel { packet_id: 1 }));
        assert_eq!(packets[1], publish(2));
    }

    #[test]
    fn test_remove_preserves_order() {
        let list = PendingList::new();
        for id in 1..=4 {
            list.add(id, publish(id));
        }
        assert!(list.remove(2));
        assert!(!list.remove(2));
        let packets = list.packets();
        assert_eq!(packets, vec![publish(1), publish(3), publish(4)]);
    }

    #[test]
    fn test_clear() {
        let list = PendingList::new();
        list.add(1, publish(1));
        list.clear();
        assert!(list.is_empty());
        assert!(!list.contains(1));
    }
}
