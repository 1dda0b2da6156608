//! Per-tenant message cache.
//!
//! Keyed by message id (case-insensitive), iterated by (timestamp, id).
//! Bounded by item count and age, whichever is stricter; eviction is
//! age-first, FIFO within age, and never removes the leading (oldest
//! live) message while any later message remains — history sync anchors
//! on it.

use chrono::{Duration, Utc};
use quepasa_core::config::CacheConfig;
use quepasa_core::message::{Message, MessageStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

struct Inner {
    /// Upper-cased id → record.
    by_id: HashMap<String, Message>,
    /// (timestamp, upper-cased id) → upper-cased id; gives iteration order.
    order: BTreeMap<(chrono::DateTime<Utc>, String), String>,
}

pub struct MessageCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

fn key_of(id: &str) -> String {
    id.to_ascii_uppercase()
}

impl MessageCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                order: BTreeMap::new(),
            }),
        }
    }

    /// Insert or replace by id, then enforce the bounds.
    pub fn append(&self, message: Message) {
        let key = key_of(&message.id);
        let mut inner = self.inner.lock().expect("cache lock");

        if let Some(old) = inner.by_id.remove(&key) {
            inner.order.remove(&(old.timestamp, key.clone()));
        }
        inner.order.insert((message.timestamp, key.clone()), key.clone());
        inner.by_id.insert(key, message);

        self.evict(&mut inner);
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.inner
            .lock()
            .expect("cache lock")
            .by_id
            .get(&key_of(id))
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("cache lock")
            .by_id
            .contains_key(&key_of(id))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock").by_id.len()
    }

    pub fn synopsis_length(&self) -> usize {
        self.config.synopsis_length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest live message; the history-sync anchor.
    pub fn leading(&self) -> Option<Message> {
        let inner = self.inner.lock().expect("cache lock");
        inner
            .order
            .values()
            .next()
            .and_then(|key| inner.by_id.get(key))
            .cloned()
    }

    /// Snapshot in (timestamp asc, id asc) order. List consumers
    /// reverse-sort for newest-first views.
    pub fn list(&self) -> Vec<Message> {
        let inner = self.inner.lock().expect("cache lock");
        inner
            .order
            .values()
            .filter_map(|key| inner.by_id.get(key))
            .cloned()
            .collect()
    }

    /// Mutate one record in place. Returns false when the id is unknown.
    pub fn with_mut<F: FnOnce(&mut Message)>(&self, id: &str, f: F) -> bool {
        let mut inner = self.inner.lock().expect("cache lock");
        match inner.by_id.get_mut(&key_of(id)) {
            Some(message) => {
                f(message);
                true
            }
            None => false,
        }
    }

    /// Apply a status receipt, honoring the monotonic rank. Returns
    /// `Some(true)` when the status advanced, `Some(false)` when it was a
    /// stale receipt, `None` for an unknown id.
    pub fn advance_status(&self, id: &str, status: MessageStatus) -> Option<bool> {
        let mut inner = self.inner.lock().expect("cache lock");
        inner
            .by_id
            .get_mut(&key_of(id))
            .map(|message| message.advance_status(status))
    }

    /// Record a dispatch failure on the cached message.
    pub fn append_exception(&self, id: &str, error: String) -> bool {
        self.with_mut(id, |message| message.exceptions.push(error))
    }

    pub fn remove(&self, id: &str) -> Option<Message> {
        let key = key_of(id);
        let mut inner = self.inner.lock().expect("cache lock");
        let removed = inner.by_id.remove(&key)?;
        inner.order.remove(&(removed.timestamp, key));
        Some(removed)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.by_id.clear();
        inner.order.clear();
    }

    /// Age eviction first, then length; position 0 (the leading message)
    /// is pinned while anything later remains.
    fn evict(&self, inner: &mut Inner) {
        if self.config.days > 0 {
            let cutoff = Utc::now() - Duration::days(self.config.days as i64);
            loop {
                let victim = {
                    let mut keys = inner.order.iter();
                    let _leading = keys.next();
                    match keys.next() {
                        Some(((ts, _), key)) if *ts < cutoff => Some(key.clone()),
                        _ => None,
                    }
                };
                match victim {
                    Some(key) => {
                        if let Some(old) = inner.by_id.remove(&key) {
                            inner.order.remove(&(old.timestamp, key));
                        }
                    }
                    None => break,
                }
            }
        }

        if self.config.length > 0 {
            while inner.by_id.len() > self.config.length {
                let victim = {
                    let mut keys = inner.order.values();
                    let _leading = keys.next();
                    keys.next().cloned()
                };
                match victim {
                    Some(key) => {
                        if let Some(old) = inner.by_id.remove(&key) {
                            inner.order.remove(&(old.timestamp, key));
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cache(length: usize, days: u32) -> MessageCache {
        MessageCache::new(CacheConfig {
            length,
            days,
            synopsis_length: 50,
        })
    }

    fn msg(id: &str, ts_offset_secs: i64) -> Message {
        Message {
            id: id.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + ts_offset_secs, 0).unwrap(),
            text: format!("body of {id}"),
            ..Default::default()
        }
    }

    #[test]
    fn id_lookup_is_case_insensitive() {
        let cache = cache(10, 0);
        cache.append(msg("3EB0aBcD", 0));
        assert!(cache.get("3eb0abcd").is_some());
        assert!(cache.get("3EB0ABCD").is_some());
        assert!(cache.contains("3Eb0AbCd"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn iteration_orders_by_timestamp_then_id() {
        let cache = cache(10, 0);
        cache.append(msg("B", 5));
        cache.append(msg("A", 5));
        cache.append(msg("C", 1));
        let ids: Vec<String> = cache.list().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
        assert_eq!(cache.leading().unwrap().id, "C");
    }

    #[test]
    fn length_eviction_preserves_leading() {
        let cache = cache(3, 0);
        for (i, id) in ["m1", "m2", "m3", "m4", "m5"].iter().enumerate() {
            cache.append(msg(id, i as i64));
        }
        assert_eq!(cache.len(), 3);
        // The oldest message survives; eviction eats from position 1.
        assert_eq!(cache.leading().unwrap().id, "m1");
        assert!(cache.get("m2").is_none());
        assert!(cache.get("m3").is_none());
        assert!(cache.get("m5").is_some());
    }

    #[test]
    fn age_eviction_preserves_leading() {
        let cache = cache(0, 1);
        let old = Utc::now() - Duration::days(10);
        for (i, id) in ["old1", "old2", "old3"].iter().enumerate() {
            cache.append(Message {
                id: id.to_string(),
                timestamp: old + Duration::seconds(i as i64),
                ..Default::default()
            });
        }
        cache.append(Message {
            id: "fresh".to_string(),
            timestamp: Utc::now(),
            ..Default::default()
        });
        assert_eq!(cache.leading().unwrap().id, "old1");
        assert!(cache.get("old2").is_none());
        assert!(cache.get("old3").is_none());
        assert!(cache.get("fresh").is_some());
    }

    #[test]
    fn replace_keeps_a_single_entry() {
        let cache = cache(10, 0);
        cache.append(msg("A1", 0));
        let mut edited = msg("a1", 0);
        edited.edited = true;
        cache.append(edited);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("A1").unwrap().edited);
    }

    #[test]
    fn status_receipts_are_monotonic() {
        let cache = cache(10, 0);
        cache.append(msg("R1", 0));
        assert_eq!(cache.advance_status("r1", MessageStatus::Delivered), Some(true));
        assert_eq!(cache.advance_status("r1", MessageStatus::Read), Some(true));
        assert_eq!(cache.advance_status("r1", MessageStatus::Delivered), Some(false));
        assert_eq!(cache.get("R1").unwrap().status, MessageStatus::Read);
        assert_eq!(cache.advance_status("nope", MessageStatus::Read), None);
    }

    #[test]
    fn exceptions_accumulate() {
        let cache = cache(10, 0);
        cache.append(msg("E1", 0));
        assert!(cache.append_exception("e1", "webhook returned 500".into()));
        assert!(cache.append_exception("E1", "webhook returned 502".into()));
        let m = cache.get("e1").unwrap();
        assert_eq!(m.exceptions.len(), 2);
        assert!(m.has_dispatch_error());
        assert!(!cache.append_exception("missing", "x".into()));
    }
}
