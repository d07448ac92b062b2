// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::{BTreeMap, HashMap};

use codec::{QoS, Topic, TopicFilter};

use crate::types::SessionId;

/// A single retained message: the last payload published with the retain flag set
/// on some topic, delivered to any session that subscribes to a matching filter
/// afterwards.
#[derive(Clone, Debug)]
struct Retained {
    payload: Vec<u8>,
    qos: QoS,
}

/// Owns the subscription index and the retained-message store.
///
/// Never shared behind a lock: a single task (the broker core's run loop) owns this
/// value exclusively and mutates it in response to `Subscribe`/`Unsubscribe`/
/// `Publish`/session-removal events, which keeps matching and delivery
/// single-writer and lock-free.
#[derive(Debug, Default)]
pub struct TopicRouter {
    subscriptions: HashMap<SessionId, BTreeMap<TopicFilter, QoS>>,
    retained: HashMap<String, Retained>,
}

impl TopicRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session_id` wants messages matching `filter` at up to `qos`.
    /// Replaces any existing subscription to the same filter.
    pub fn subscribe(&mut self, session_id: SessionId, filter: TopicFilter, qos: QoS) {
        self.subscriptions.entry(session_id).or_default().insert(filter, qos);
    }

    /// Remove one subscription. A no-op if `session_id` has no such filter.
    pub fn unsubscribe(&mut self, session_id: SessionId, filter: &TopicFilter) {
        if let Some(filters) = self.subscriptions.get_mut(&session_id) {
            filters.remove(filter);
        }
    }

    /// Drop every subscription owned by `session_id`, e.g. on disconnect.
    pub fn remove_session(&mut self, session_id: SessionId) {
        self.subscriptions.remove(&session_id);
    }

    /// Every session with at least one filter matching `topic`, paired with the
    /// maximum QoS granted among its matching filters.
    #[must_use]
    pub fn matching(&self, topic: &Topic) -> Vec<(SessionId, QoS)> {
        let mut out = Vec::new();
        for (session_id, filters) in &self.subscriptions {
            let best = filters
                .iter()
                .filter(|(filter, _)| filter.is_match(topic))
                .map(|(_, qos)| *qos)
                .max_by_key(|qos| *qos as u8);
            if let Some(qos) = best {
                out.push((*session_id, qos));
            }
        }
        out
    }

    /// Store or clear a retained message for `topic`. An empty payload clears it,
    /// per the protocol's retained-message semantics.
    pub fn store_retained(&mut self, topic: &Topic, payload: Vec<u8>, qos: QoS) {
        if payload.is_empty() {
            self.retained.remove(topic.as_str());
        } else {
            self.retained.insert(topic.as_str().to_string(), Retained { payload, qos });
        }
    }

    /// Every retained message whose topic matches `filter`, for delivery right
    /// after a SUBSCRIBE is acknowledged.
    #[must_use]
    pub fn retained_matching(&self, filter: &TopicFilter) -> Vec<(Topic, Vec<u8>, QoS)> {
        self.retained
            .iter()
            .filter_map(|(topic_str, retained)| {
                let topic = Topic::parse(topic_str).ok()?;
                filter.is_match(&topic).then(|| (topic, retained.payload.clone(), retained.qos))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::parse(s).unwrap()
    }

    #[test]
    fn exact_subscription_matches() {
        let mut router = TopicRouter::new();
        router.subscribe(1, filter("nas/cpu"), QoS::AtMostOnce);
        let matches = router.matching(&topic("nas/cpu"));
        assert_eq!(matches, vec![(1, QoS::AtMostOnce)]);
        assert!(router.matching(&topic("nas/memory")).is_empty());
    }

    #[test]
    fn wildcard_subscription_matches() {
        let mut router = TopicRouter::new();
        router.subscribe(1, filter("nas/+/status"), QoS::AtLeastOnce);
        assert_eq!(
            router.matching(&topic("nas/disk0/status")),
            vec![(1, QoS::AtLeastOnce)]
        );
    }

    #[test]
    fn duplicate_delivery_uses_max_granted_qos() {
        let mut router = TopicRouter::new();
        router.subscribe(1, filter("nas/#"), QoS::AtMostOnce);
        router.subscribe(1, filter("nas/cpu"), QoS::AtLeastOnce);
        assert_eq!(router.matching(&topic("nas/cpu")), vec![(1, QoS::AtLeastOnce)]);
    }

    #[test]
    fn remove_session_drops_all_its_filters() {
        let mut router = TopicRouter::new();
        router.subscribe(1, filter("nas/cpu"), QoS::AtMostOnce);
        router.remove_session(1);
        assert!(router.matching(&topic("nas/cpu")).is_empty());
    }

    #[test]
    fn retained_message_round_trip() {
        let mut router = TopicRouter::new();
        router.store_retained(&topic("nas/cpu"), b"42".to_vec(), QoS::AtMostOnce);
        let matches = router.retained_matching(&filter("nas/+"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, b"42".to_vec());
    }

    #[test]
    fn empty_payload_clears_retained_message() {
        let mut router = TopicRouter::new();
        router.store_retained(&topic("nas/cpu"), b"42".to_vec(), QoS::AtMostOnce);
        router.store_retained(&topic("nas/cpu"), Vec::new(), QoS::AtMostOnce);
        assert!(router.retained_matching(&filter("nas/#")).is_empty());
    }
}
