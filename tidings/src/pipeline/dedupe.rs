//! Near-duplicate suppression.
//!
//! Outbound payloads are fingerprinted (lowercased, whitespace-collapsed,
//! capped at 512 chars, hashed) and remembered in a bounded LRU with a
//! TTL. A payload whose fingerprint is still fresh is dropped.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::config::DedupeConfig;

const NORMALIZED_CAP: usize = 512;

/// Fingerprint of normalized payload text.
pub fn fingerprint(text: &str) -> u64 {
    let mut normalized = String::with_capacity(text.len().min(NORMALIZED_CAP));
    for word in text.split_whitespace() {
        if !normalized.is_empty() {
            normalized.push(' ');
        }
        for ch in word.chars().flat_map(char::to_lowercase) {
            normalized.push(ch);
        }
        if normalized.len() >= NORMALIZED_CAP {
            break;
        }
    }
    let mut cap = NORMALIZED_CAP.min(normalized.len());
    while !normalized.is_char_boundary(cap) {
        cap -= 1;
    }
    normalized.truncate(cap);

    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    hasher.finish()
}

struct Inner {
    entries: HashMap<u64, DateTime<Utc>>,
    // Least recently seen first.
    order: Vec<u64>,
}

/// Bounded LRU of recent payload fingerprints.
pub struct DedupeFilter {
    enabled: bool,
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl DedupeFilter {
    pub fn from_settings(config: &DedupeConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: config.capacity.max(1),
            ttl: Duration::seconds(config.ttl_seconds as i64),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Pass-through shim that permits every input.
    pub fn disabled() -> Self {
        Self::from_settings(&DedupeConfig {
            enabled: false,
            capacity: 1,
            ttl_seconds: 1,
        })
    }

    /// Permit check that records permitted payloads. Returns `false` when
    /// the payload is a fresh duplicate.
    pub fn check_and_insert(&self, text: &str, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }
        let fp = fingerprint(text);
        let mut inner = self.inner.lock();

        if let Some(seen_at) = inner.entries.get(&fp).copied() {
            if now - seen_at < self.ttl {
                return false;
            }
            // Stale entry: refresh rather than deny.
            inner.entries.insert(fp, now);
            inner.order.retain(|candidate| *candidate != fp);
            inner.order.push(fp);
            return true;
        }

        inner.entries.insert(fp, now);
        inner.order.push(fp);
        while inner.order.len() > self.capacity {
            let evicted = inner.order.remove(0);
            inner.entries.remove(&evicted);
        }
        true
    }

    /// Number of fingerprints currently remembered.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
