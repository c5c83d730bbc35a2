use std::str::FromStr;
use std::sync::Arc;

use itertools::Itertools;
use tokio::sync::RwLock;

use relaymq_codec::QoS;

use crate::topic::Topic;
use crate::trie::TopicTree;
use crate::types::{DashMap, HashMap, SessionKey, TopicFilter, TopicName};
use crate::Result;

/// Subscription routing: the wildcard trie plus the per-(filter, session)
/// granted QoS relations.
///
/// The trie answers "which filters match this topic"; the relations answer
/// "which sessions hold that filter and at what grant". A session
/// re-subscribing to the same filter collapses to one relation carrying the
/// latest grant.
#[derive(Clone, Default)]
pub struct Router {
    topics: Arc<RwLock<TopicTree<SessionKey>>>,
    relations: Arc<DashMap<TopicFilter, HashMap<SessionKey, QoS>>>,
}

impl Router {
    #[inline]
    pub fn new() -> Router {
        Router::default()
    }

    #[inline]
    pub async fn add(&self, topic_filter: &str, key: SessionKey, qos: QoS) -> Result<()> {
        log::debug!("add, topic_filter: {:?}, key: {}, qos: {:?}", topic_filter, key, qos);
        let topic = Topic::from_str(topic_filter)?;
        self.topics.write().await.insert(&topic, key);
        self.relations.entry(TopicFilter::from(topic_filter)).or_default().insert(key, qos);
        Ok(())
    }

    #[inline]
    pub async fn remove(&self, topic_filter: &str, key: SessionKey) -> Result<bool> {
        log::debug!("remove, topic_filter: {:?}, key: {}", topic_filter, key);
        let topic = Topic::from_str(topic_filter)?;
        let removed = self
            .relations
            .get_mut(topic_filter)
            .map(|mut rels| rels.remove(&key).is_some())
            .unwrap_or(false);
        self.relations.remove_if(topic_filter, |_, rels| rels.is_empty());
        if removed {
            self.topics.write().await.remove(&topic, &key);
        }
        Ok(removed)
    }

    /// Drop every subscription of a dead session.
    #[inline]
    pub async fn remove_all(&self, key: SessionKey) {
        let topic_filters = self
            .relations
            .iter()
            .filter(|e| e.value().contains_key(&key))
            .map(|e| e.key().clone())
            .collect::<Vec<_>>();
        for topic_filter in topic_filters {
            if let Err(e) = self.remove(&topic_filter, key).await {
                log::warn!("remove_all, topic_filter: {:?}, {:?}", topic_filter, e);
            }
        }
    }

    /// Destination sessions of one publish: the union over all matching
    /// filters, one entry per session carrying its best grant.
    #[inline]
    pub async fn matches(&self, topic: &TopicName) -> Result<Vec<(SessionKey, QoS)>> {
        let topic = Topic::from_str(topic)?;
        let mut acc: HashMap<SessionKey, QoS> = HashMap::default();
        for (topic_filter, keys) in self.topics.read().await.matches(&topic) {
            let topic_filter = topic_filter.to_string();
            if let Some(rels) = self.relations.get(topic_filter.as_str()) {
                for key in keys.iter().unique() {
                    if let Some(qos) = rels.get(key) {
                        acc.entry(*key)
                            .and_modify(|q| {
                                if qos.value() > q.value() {
                                    *q = *qos;
                                }
                            })
                            .or_insert(*qos);
                    }
                }
            }
        }
        Ok(acc.into_iter().collect())
    }

    #[inline]
    pub async fn is_match(&self, topic: &TopicName) -> bool {
        self.matches(topic).await.map(|m| !m.is_empty()).unwrap_or(false)
    }

    /// Number of distinct subscribed filters.
    #[inline]
    pub fn topics_count(&self) -> usize {
        self.relations.len()
    }

    /// Number of (filter, session) relations.
    #[inline]
    pub fn relations_count(&self) -> usize {
        self.relations.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(mut m: Vec<(SessionKey, QoS)>) -> Vec<(SessionKey, QoS)> {
        m.sort();
        m
    }

    #[tokio::test]
    async fn test_match_union_with_best_grant() {
        let r = Router::new();
        r.add("a/+", 1, QoS::AtMostOnce).await.unwrap();
        r.add("a/#", 1, QoS::ExactlyOnce).await.unwrap();
        r.add("a/b", 2, QoS::AtLeastOnce).await.unwrap();

        // key 1 matches through two filters, but appears once with the max
        let m = keys(r.matches(&TopicName::from_static("a/b")).await.unwrap());
        assert_eq!(m, vec![(1, QoS::ExactlyOnce), (2, QoS::AtLeastOnce)]);
    }

    #[tokio::test]
    async fn test_resubscribe_updates_grant() {
        let r = Router::new();
        r.add("t", 1, QoS::AtMostOnce).await.unwrap();
        r.add("t", 1, QoS::ExactlyOnce).await.unwrap();

        assert_eq!(r.relations_count(), 1);
        let m = r.matches(&TopicName::from_static("t")).await.unwrap();
        assert_eq!(m, vec![(1, QoS::ExactlyOnce)]);
    }

    #[tokio::test]
    async fn test_remove_returns_to_initial_state() {
        let r = Router::new();
        r.add("x/+/z", 9, QoS::AtLeastOnce).await.unwrap();
        assert!(r.is_match(&TopicName::from_static("x/y/z")).await);

        assert!(r.remove("x/+/z", 9).await.unwrap());
        assert!(!r.is_match(&TopicName::from_static("x/y/z")).await);
        assert_eq!(r.topics_count(), 0);
        assert_eq!(r.relations_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let r = Router::new();
        r.add("a", 1, QoS::AtMostOnce).await.unwrap();
        r.add("b/#", 1, QoS::AtMostOnce).await.unwrap();
        r.add("b/#", 2, QoS::AtMostOnce).await.unwrap();

        r.remove_all(1).await;
        assert!(!r.is_match(&TopicName::from_static("a")).await);
        let m = r.matches(&TopicName::from_static("b/c")).await.unwrap();
        assert_eq!(m, vec![(2, QoS::AtMostOnce)]);
    }

    #[tokio::test]
    async fn test_metadata_topics_need_literal_root() {
        let r = Router::new();
        r.add("#", 1, QoS::AtMostOnce).await.unwrap();
        r.add("$SYS/#", 2, QoS::AtMostOnce).await.unwrap();

        let m = r.matches(&TopicName::from_static("$SYS/info")).await.unwrap();
        assert_eq!(m, vec![(2, QoS::AtMostOnce)]);

        let m = keys(r.matches(&TopicName::from_static("any/info")).await.unwrap());
        assert_eq!(m, vec![(1, QoS::AtMostOnce)]);
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected() {
        let r = Router::new();
        assert!(r.add("a/#/b", 1, QoS::AtMostOnce).await.is_err());
        assert!(r.add("a+", 1, QoS::AtMostOnce).await.is_err());
    }
}
