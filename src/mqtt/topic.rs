//! Concurrent hierarchical topic subscription index.
//!
//! Topics are `/`-separated level sequences; `+` matches exactly one level
//! and `#` matches any number of trailing levels (MQTT 3.1.1 §4.7).
//! Subscriptions live in a trie with one root-to-leaf path per topic.
//! A bounded cache memoizes the validated level split, since publishes are
//! frequent and topics repeat.
//!
//! One readers-writer lock guards the trie: `find_subscribers` traversals
//! run concurrently under the read lock, `subscribe`/`unsubscribe` take the
//! write lock. The level cache is independently synchronized and never
//! contends with the trie lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use moka::sync::Cache;
use thiserror::Error;

/// Per-subscription quality of service (0/1/2).
pub type Qos = u8;

/// Result type for topic operations.
pub type TopicResult<T> = Result<T, TopicError>;

/// Errors from the topic engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    /// The topic violates the wildcard rules.
    #[error("topic {0} is invalid")]
    InvalidTopic(String),

    /// A batch subscribe with mismatched topic and QoS counts.
    #[error("subscribe with {topics} topics but {qoss} QoS values")]
    QosCountMismatch { topics: usize, qoss: usize },
}

/// Split a topic into levels, enforcing the wildcard rules.
///
/// - The number of levels equals `count('/') + 1`; empty levels are legal.
/// - A level containing `+` must be exactly `+`.
/// - `#` may appear only as the final character of the final level.
fn split_topic(topic: &str) -> Option<Vec<String>> {
    let mut levels = Vec::with_capacity(topic.matches('/').count() + 1);

    let mut level_start = 0;
    let mut wildcard_flag = false;
    for (i, ch) in topic.char_indices() {
        if ch == '/' {
            let level = &topic[level_start..i];
            if level.len() > 1 && wildcard_flag {
                return None;
            }
            levels.push(level.to_string());
            level_start = i + 1;
            wildcard_flag = false;
        } else if ch == '+' {
            wildcard_flag = true;
        } else if ch == '#' {
            wildcard_flag = true;
            if i != topic.len() - 1 {
                return None;
            }
        }
    }

    let level = &topic[level_start..];
    if level.len() > 1 && wildcard_flag {
        return None;
    }
    levels.push(level.to_string());
    Some(levels)
}

/// Bounded cache of topic -> validated level sequence.
///
/// Invalid topics are never cached.
#[derive(Debug)]
struct TopicLevelCache {
    data: Cache<String, Arc<Vec<String>>>,
}

impl TopicLevelCache {
    fn new(cache_size: u64) -> Self {
        Self {
            data: Cache::new(cache_size),
        }
    }

    fn get(&self, topic: &str) -> TopicResult<Arc<Vec<String>>> {
        if let Some(levels) = self.data.get(topic) {
            return Ok(levels);
        }
        match split_topic(topic) {
            Some(levels) => {
                let levels = Arc::new(levels);
                self.data.insert(topic.to_string(), levels.clone());
                Ok(levels)
            }
            None => Err(TopicError::InvalidTopic(topic.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct TopicNode {
    /// Subscribed clients with their QoS.
    clients: HashMap<String, Qos>,
    children: HashMap<String, TopicNode>,
}

impl TopicNode {
    fn add_clients(&self, out: &mut HashMap<String, Qos>) {
        for (client, qos) in &self.clients {
            out.insert(client.clone(), *qos);
        }
    }
}

/// Manages topic subscribe and unsubscribe for one broker.
#[derive(Debug)]
pub struct TopicManager {
    root: RwLock<TopicNode>,
    levels: TopicLevelCache,
}

impl Default for TopicManager {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_TOPIC_CACHE_SIZE)
    }
}

impl TopicManager {
    /// Create a manager with the given level-cache capacity.
    pub fn new(cache_size: u64) -> Self {
        Self {
            root: RwLock::new(TopicNode::default()),
            levels: TopicLevelCache::new(cache_size),
        }
    }

    /// Subscribe `client_id` to each topic with the matching QoS.
    ///
    /// Failure on any topic aborts the batch and is reported verbatim;
    /// earlier insertions are not rolled back. Use
    /// [`Self::subscribe_atomic`] when all-or-nothing semantics matter.
    pub fn subscribe(&self, topics: &[String], qoss: &[Qos], client_id: &str) -> TopicResult<()> {
        if topics.len() != qoss.len() {
            return Err(TopicError::QosCountMismatch {
                topics: topics.len(),
                qoss: qoss.len(),
            });
        }

        let mut root = self.root.write().unwrap();
        for (topic, qos) in topics.iter().zip(qoss) {
            let levels = self.levels.get(topic)?;
            Self::insert(&mut root, &levels, *qos, client_id);
        }
        Ok(())
    }

    /// Subscribe to the batch all-or-nothing: every topic is validated
    /// before the first insertion.
    pub fn subscribe_atomic(
        &self,
        topics: &[String],
        qoss: &[Qos],
        client_id: &str,
    ) -> TopicResult<()> {
        if topics.len() != qoss.len() {
            return Err(TopicError::QosCountMismatch {
                topics: topics.len(),
                qoss: qoss.len(),
            });
        }

        let mut validated = Vec::with_capacity(topics.len());
        for topic in topics {
            validated.push(self.levels.get(topic)?);
        }

        let mut root = self.root.write().unwrap();
        for (levels, qos) in validated.iter().zip(qoss) {
            Self::insert(&mut root, levels, *qos, client_id);
        }
        Ok(())
    }

    /// Drop `client_id`'s subscription to each topic.
    ///
    /// Unsubscribing a never-subscribed topic succeeds silently; an invalid
    /// topic is still an error.
    pub fn unsubscribe(&self, topics: &[String], client_id: &str) -> TopicResult<()> {
        let mut root = self.root.write().unwrap();
        for topic in topics {
            let levels = self.levels.get(topic)?;
            Self::remove(&mut root, &levels, client_id);
        }
        Ok(())
    }

    /// Find every client whose subscription matches `topic`, directly or by
    /// wildcard, with its effective QoS.
    ///
    /// The publish topic is concrete by contract; clients matching through
    /// several paths are coalesced by client id.
    pub fn find_subscribers(&self, topic: &str) -> TopicResult<HashMap<String, Qos>> {
        let levels = self.levels.get(topic)?;
        let root = self.root.read().unwrap();

        let mut result = HashMap::new();
        let mut frontier: Vec<&TopicNode> = vec![&*root];

        for level in levels.iter() {
            let mut next: Vec<&TopicNode> = Vec::new();
            for node in &frontier {
                for (child_level, child) in &node.children {
                    if child_level == "#" {
                        // `#` is terminal: everything below here matches.
                        child.add_clients(&mut result);
                    } else if child_level == "+" || child_level == level {
                        next.push(child);
                    }
                }
            }
            frontier = next;
            if frontier.is_empty() {
                return Ok(result);
            }
        }

        for node in frontier {
            node.add_clients(&mut result);
            // MQTT 3.1.1 section 4.7.1.2: "sport/tennis/player1/#" also
            // receives messages published to "sport/tennis/player1".
            if let Some(child) = node.children.get("#") {
                child.add_clients(&mut result);
            }
        }
        Ok(result)
    }

    fn insert(root: &mut TopicNode, levels: &[String], qos: Qos, client_id: &str) {
        let mut node = root;
        for level in levels {
            node = node.children.entry(level.clone()).or_default();
        }
        node.clients.insert(client_id.to_string(), qos);
    }

    /// Walk down to the terminal node, drop the client, and compact empty
    /// nodes on the way back up. The call stack carries the ancestor path.
    fn remove(node: &mut TopicNode, levels: &[String], client_id: &str) {
        let Some((level, rest)) = levels.split_first() else {
            node.clients.remove(client_id);
            return;
        };
        let Some(child) = node.children.get_mut(level) else {
            // The requested subscription never existed.
            return;
        };
        Self::remove(child, rest, client_id);
        if child.clients.is_empty() && child.children.is_empty() {
            node.children.remove(level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TopicManager {
        TopicManager::new(1024)
    }

    fn subscribe(mgr: &TopicManager, topic: &str, qos: Qos, client: &str) {
        mgr.subscribe(&[topic.to_string()], &[qos], client).unwrap();
    }

    // ========================================================================
    // Validator
    // ========================================================================

    #[test]
    fn test_split_plain_topic() {
        assert_eq!(
            split_topic("sport/tennis/player1").unwrap(),
            vec!["sport", "tennis", "player1"]
        );
    }

    #[test]
    fn test_split_level_count_is_slashes_plus_one() {
        assert_eq!(split_topic("a").unwrap().len(), 1);
        assert_eq!(split_topic("a/b").unwrap().len(), 2);
        assert_eq!(split_topic("a/b/").unwrap().len(), 3);
        assert_eq!(split_topic("/").unwrap(), vec!["", ""]);
    }

    #[test]
    fn test_split_empty_levels_are_valid() {
        assert_eq!(split_topic("a//b").unwrap(), vec!["a", "", "b"]);
    }

    #[test]
    fn test_plus_must_be_whole_level() {
        assert!(split_topic("a/+b").is_none());
        assert!(split_topic("a/b+").is_none());
        assert_eq!(split_topic("a/+/b").unwrap(), vec!["a", "+", "b"]);
        assert_eq!(split_topic("+").unwrap(), vec!["+"]);
    }

    #[test]
    fn test_hash_only_final() {
        assert!(split_topic("#/a").is_none());
        assert!(split_topic("a/#/b").is_none());
        assert!(split_topic("a/x#").is_none());
        assert_eq!(split_topic("a/#").unwrap(), vec!["a", "#"]);
        assert_eq!(split_topic("#").unwrap(), vec!["#"]);
    }

    #[test]
    fn test_cache_returns_same_levels_and_skips_invalid() {
        let cache = TopicLevelCache::new(16);
        let first = cache.get("a/b").unwrap();
        let second = cache.get("a/b").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(cache.get("a/+b").is_err());
        // The invalid topic was not cached.
        assert!(cache.data.get("a/+b").is_none());
    }

    // ========================================================================
    // Wildcard matching
    // ========================================================================

    #[test]
    fn test_hash_matches_deeper_levels() {
        let mgr = manager();
        subscribe(&mgr, "sport/#", 1, "C1");

        let subscribers = mgr.find_subscribers("sport/tennis/player1").unwrap();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers["C1"], 1);
    }

    #[test]
    fn test_hash_matches_parent_topic() {
        let mgr = manager();
        subscribe(&mgr, "sport/tennis/player1/#", 0, "C1");

        let subscribers = mgr.find_subscribers("sport/tennis/player1").unwrap();
        assert_eq!(subscribers.len(), 1);
        assert!(subscribers.contains_key("C1"));
    }

    #[test]
    fn test_plus_and_exact_combine() {
        let mgr = manager();
        subscribe(&mgr, "+/+/+", 0, "C1");
        subscribe(&mgr, "loc/+/event", 1, "C2");
        subscribe(&mgr, "loc/device/event", 2, "C3");

        let subscribers = mgr.find_subscribers("loc/device/event").unwrap();
        assert_eq!(subscribers.len(), 3);
        for client in ["C1", "C2", "C3"] {
            assert!(subscribers.contains_key(client));
        }
    }

    #[test]
    fn test_plus_matches_where_exact_does_not() {
        let mgr = manager();
        subscribe(&mgr, "a/b", 0, "C1");
        subscribe(&mgr, "a/+", 0, "C2");

        let subscribers = mgr.find_subscribers("a/c").unwrap();
        assert_eq!(subscribers.len(), 1);
        assert!(subscribers.contains_key("C2"));
    }

    #[test]
    fn test_root_hash_matches_everything() {
        let mgr = manager();
        subscribe(&mgr, "#", 2, "C1");

        let subscribers = mgr.find_subscribers("any/topic/at/all").unwrap();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers["C1"], 2);
    }

    #[test]
    fn test_no_match_is_empty() {
        let mgr = manager();
        subscribe(&mgr, "a/b", 0, "C1");
        assert!(mgr.find_subscribers("x/y").unwrap().is_empty());
    }

    #[test]
    fn test_find_on_invalid_topic_errors() {
        let mgr = manager();
        assert_eq!(
            mgr.find_subscribers("a/+b").unwrap_err(),
            TopicError::InvalidTopic("a/+b".to_string())
        );
    }

    #[test]
    fn test_duplicate_subscribe_updates_qos() {
        let mgr = manager();
        subscribe(&mgr, "a/b", 0, "C1");
        subscribe(&mgr, "a/b", 2, "C1");

        let subscribers = mgr.find_subscribers("a/b").unwrap();
        assert_eq!(subscribers["C1"], 2);
    }

    // ========================================================================
    // Unsubscribe and compaction
    // ========================================================================

    #[test]
    fn test_unsubscribe_compacts_path() {
        let mgr = manager();
        subscribe(&mgr, "a/b/c", 0, "C1");
        mgr.unsubscribe(&["a/b/c".to_string()], "C1").unwrap();

        assert!(mgr.find_subscribers("a/b/c").unwrap().is_empty());
        assert!(mgr.root.read().unwrap().children.is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_at_nonempty_ancestor() {
        let mgr = manager();
        subscribe(&mgr, "a/b/c", 0, "C1");
        subscribe(&mgr, "a/b", 0, "C2");
        mgr.unsubscribe(&["a/b/c".to_string()], "C1").unwrap();

        let root = mgr.root.read().unwrap();
        let b = &root.children["a"].children["b"];
        assert!(b.children.is_empty());
        assert!(b.clients.contains_key("C2"));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mgr = manager();
        subscribe(&mgr, "a/b", 0, "C1");
        mgr.unsubscribe(&["a/b".to_string()], "C1").unwrap();
        mgr.unsubscribe(&["a/b".to_string()], "C1").unwrap();
        assert!(mgr.root.read().unwrap().children.is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_topic_succeeds_silently() {
        let mgr = manager();
        mgr.unsubscribe(&["never/subscribed".to_string()], "C1")
            .unwrap();
    }

    #[test]
    fn test_unsubscribe_invalid_topic_errors() {
        let mgr = manager();
        assert!(mgr.unsubscribe(&["#/a".to_string()], "C1").is_err());
    }

    #[test]
    fn test_unsubscribe_keeps_other_clients() {
        let mgr = manager();
        subscribe(&mgr, "a/b", 0, "C1");
        subscribe(&mgr, "a/b", 1, "C2");
        mgr.unsubscribe(&["a/b".to_string()], "C1").unwrap();

        let subscribers = mgr.find_subscribers("a/b").unwrap();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers["C2"], 1);
    }

    // ========================================================================
    // Batch semantics
    // ========================================================================

    #[test]
    fn test_batch_length_mismatch() {
        let mgr = manager();
        let err = mgr
            .subscribe(&["a".to_string(), "b".to_string()], &[0], "C1")
            .unwrap_err();
        assert_eq!(err, TopicError::QosCountMismatch { topics: 2, qoss: 1 });
    }

    #[test]
    fn test_batch_failure_keeps_earlier_insertions() {
        let mgr = manager();
        let err = mgr
            .subscribe(
                &["a/b".to_string(), "bad/+x".to_string()],
                &[0, 0],
                "C1",
            )
            .unwrap_err();
        assert_eq!(err, TopicError::InvalidTopic("bad/+x".to_string()));

        // The earlier topic stuck; this mirrors the wire behavior.
        assert!(mgr.find_subscribers("a/b").unwrap().contains_key("C1"));
    }

    #[test]
    fn test_atomic_batch_failure_inserts_nothing() {
        let mgr = manager();
        let err = mgr
            .subscribe_atomic(
                &["a/b".to_string(), "bad/+x".to_string()],
                &[0, 0],
                "C1",
            )
            .unwrap_err();
        assert_eq!(err, TopicError::InvalidTopic("bad/+x".to_string()));

        assert!(mgr.find_subscribers("a/b").unwrap().is_empty());
        assert!(mgr.root.read().unwrap().children.is_empty());
    }

    #[test]
    fn test_atomic_batch_success() {
        let mgr = manager();
        mgr.subscribe_atomic(
            &["a/b".to_string(), "c/#".to_string()],
            &[0, 1],
            "C1",
        )
        .unwrap();

        assert!(mgr.find_subscribers("a/b").unwrap().contains_key("C1"));
        assert!(mgr.find_subscribers("c/d/e").unwrap().contains_key("C1"));
    }

    // ========================================================================
    // Concurrency
    // ========================================================================

    #[test]
    fn test_concurrent_subscribe_and_find() {
        let mgr = Arc::new(TopicManager::new(1024));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let mgr = mgr.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let topic = format!("load/{}/{}", w, i);
                        mgr.subscribe(&[topic.clone()], &[0], &format!("C{}", w))
                            .unwrap();
                        mgr.unsubscribe(&[topic], &format!("C{}", w)).unwrap();
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mgr = mgr.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let _ = mgr.find_subscribers(&format!("load/0/{}", i)).unwrap();
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }

        // Every writer unsubscribed everything; compaction emptied the trie.
        assert!(mgr.root.read().unwrap().children.is_empty());
    }
}
