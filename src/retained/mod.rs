//! Retained message store
//!
//! Keeps the last PUBLISH received with the retain flag set and a non-empty
//! payload, per topic. A retained publish with an empty payload deletes the
//! entry. New subscribers receive matching retained messages right after
//! their SUBACK.

use std::collections::HashMap;

use parking_lot::RwLock;
use prometheus::IntGauge;

use crate::protocol::Publish;
use crate::topic;

/// In-memory store of retained messages keyed by topic name
#[derive(Default)]
pub struct RetainedStore {
    messages: RwLock<HashMap<String, Publish>>,
    gauge: Option<IntGauge>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that reports its size through the given gauge
    pub fn with_gauge(gauge: IntGauge) -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            gauge: Some(gauge),
        }
    }

    /// Store the message if its retain flag is set.
    ///
    /// The flag is cleared on the routed original; the stored copy keeps
    /// retain=true so replays to new subscribers carry it. An empty payload
    /// deletes the entry.
    pub fn retain(&self, pkt: &mut Publish) {
        if !pkt.retain {
            return;
        }
        pkt.retain = false;
        let mut messages = self.messages.write();
        if pkt.payload.is_empty() {
            if messages.remove(&pkt.topic).is_some() {
                if let Some(gauge) = &self.gauge {
                    gauge.dec();
                }
            }
        } else {
            let mut retained = pkt.clone();
            retained.retain = true;
            if messages.insert(pkt.topic.clone(), retained).is_none() {
                if let Some(gauge) = &self.gauge {
                    gauge.inc();
                }
            }
        }
    }

    /// All retained messages whose topic matches any of the filters
    pub fn get<T: AsRef<str>>(&self, filters: &[T]) -> Vec<Publish> {
        let messages = self.messages.read();
        messages
            .values()
            .filter(|pkt| {
                let parts = topic::split(&pkt.topic);
                filters
                    .iter()
                    .any(|f| topic::matches_parts(&parts, &topic::split(f.as_ref())))
            })
            .cloned()
            .collect()
    }

    /// Snapshot of every retained message
    pub fn all(&self) -> Vec<Publish> {
        self.messages.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}
