//! Per-session topic subscriptions

use std::collections::HashMap;

use parking_lot::RwLock;
use prometheus::IntGauge;

use crate::protocol::QoS;
use crate::topic;

struct Subscription {
    filter: String,
    filter_parts: Vec<String>,
    qos: QoS,
}

impl Subscription {
    fn matches<T: AsRef<str>>(&self, topic_parts: &[T]) -> bool {
        topic::matches_parts(topic_parts, &self.filter_parts)
    }
}

/// Ordered list of a session's topic subscriptions.
///
/// Filters are unique within the list; re-adding an existing filter replaces
/// its QoS in place.
#[derive(Default)]
pub struct SubscriptionList {
    subscriptions: RwLock<Vec<Subscription>>,
    gauge: Option<IntGauge>,
}

impl SubscriptionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list that reports its size through the given gauge
    pub fn with_gauge(gauge: IntGauge) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            gauge: Some(gauge),
        }
    }

    /// Add a subscription. Returns false if the filter was already present
    /// (its QoS is replaced in place).
    pub fn add(&self, filter: &str, qos: QoS) -> bool {
        if filter.is_empty() {
            return false;
        }
        let sub = Subscription {
            filter: filter.to_string(),
            filter_parts: topic::split(filter).iter().map(|s| s.to_string()).collect(),
            qos,
        };
        let mut subscriptions = self.subscriptions.write();
        for existing in subscriptions.iter_mut() {
            if existing.filter == filter {
                *existing = sub;
                return false;
            }
        }
        subscriptions.push(sub);
        if let Some(gauge) = &self.gauge {
            gauge.inc();
        }
        true
    }

    /// Remove a subscription by filter. Returns whether it was present.
    pub fn remove(&self, filter: &str) -> bool {
        let mut subscriptions = self.subscriptions.write();
        if let Some(i) = subscriptions.iter().position(|s| s.filter == filter) {
            subscriptions.remove(i);
            if let Some(gauge) = &self.gauge {
                gauge.dec();
            }
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut subscriptions = self.subscriptions.write();
        if let Some(gauge) = &self.gauge {
            gauge.sub(subscriptions.len() as i64);
        }
        subscriptions.clear();
    }

    /// Match a topic against the list and return the maximum subscribed QoS
    pub fn matched_qos<T: AsRef<str>>(&self, topic_parts: &[T]) -> Option<QoS> {
        let subscriptions = self.subscriptions.read();
        let mut qos = None;
        for sub in subscriptions.iter() {
            if sub.matches(topic_parts) && qos.map_or(true, |q| sub.qos > q) {
                qos = Some(sub.qos);
            }
        }
        qos
    }

    /// All filters in the list that match the topic
    pub fn matching_filters<T: AsRef<str>>(&self, topic_parts: &[T]) -> Vec<String> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.matches(topic_parts))
            .map(|s| s.filter.clone())
            .collect()
    }

    /// Filter-to-QoS view of the list
    pub fn subscriptions(&self) -> HashMap<String, QoS> {
        self.subscriptions
            .read()
            .iter()
            .map(|s| (s.filter.clone(), s.qos))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic;

    #[test]
    fn test_add_replaces_qos() {
        let list = SubscriptionList::new();
        assert!(list.add("foo/bar", QoS::AtMostOnce));
        assert!(!list.add("foo/bar", QoS::ExactlyOnce));
        assert_eq!(list.count(), 1);
        assert_eq!(
            list.subscriptions().get("foo/bar"),
            Some(&QoS::ExactlyOnce)
        );
        assert!(!list.add("", QoS::AtMostOnce));
        assert_eq!(list.count(), 1);
    }

    #[test]
    fn test_remove() {
        let list = SubscriptionList::new();
        list.add("foo/bar", QoS::AtLeastOnce);
        assert!(list.remove("foo/bar"));
        assert!(!list.remove("foo/bar"));
        assert_eq!(list.count(), 0);
    }

    #[test]
    fn test_matched_qos_takes_maximum() {
        let list = SubscriptionList::new();
        list.add("+/up", QoS::AtMostOnce);
        list.add("foo/#", QoS::ExactlyOnce);
        list.add("#", QoS::AtLeastOnce);

        assert_eq!(
            list.matched_qos(&topic::split("foo/up")),
            Some(QoS::ExactlyOnce)
        );
        assert_eq!(
            list.matched_qos(&topic::split("other/up")),
            Some(QoS::AtLeastOnce)
        );
        assert_eq!(list.matched_qos(&topic::split("$SYS/x")), None);
    }

    #[test]
    fn test_matching_filters() {
        let list = SubscriptionList::new();
        list.add("+/up", QoS::AtMostOnce);
        list.add("foo/#", QoS::AtMostOnce);
        list.add("#", QoS::AtMostOnce);
        list.add("bar/down", QoS::AtMostOnce);

        let matches = list.matching_filters(&topic::split("foo/up"));
        assert_eq!(matches, vec!["+/up", "foo/#", "#"]);
    }

    #[test]
    fn test_clear() {
        let list = SubscriptionList::new();
        list.add("a", QoS::AtMostOnce);
        list.add("b", QoS::AtMostOnce);
        list.clear();
        assert_eq!(list.count(), 0);
        assert!(list.subscriptions().is_empty());
    }
}
