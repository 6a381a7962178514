//! Coalescing queue.
//!
//! Merges temporally adjacent messages bound for the same
//! `(platform, channel, job)` destination into batches. A batch closes
//! when its window elapses, when it reaches the size threshold, or when
//! a push with a different priority forces a cut.

use std::cmp::Reverse;
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::request::{Batch, BatchKey, SendRequest};

struct OpenBatch {
    requests: Vec<SendRequest>,
    opened_at: DateTime<Utc>,
    priority: u8,
    seq: u64,
}

impl OpenBatch {
    fn close(self, window: Duration, key: BatchKey) -> (Batch, u64) {
        let deadline = self.opened_at + window;
        (
            Batch {
                key,
                requests: self.requests,
                opened_at: self.opened_at,
                priority: self.priority,
                deadline,
            },
            self.seq,
        )
    }
}

#[derive(Default)]
struct Inner {
    open: HashMap<BatchKey, OpenBatch>,
    ready: Vec<(Batch, u64)>,
    next_seq: u64,
}

/// Time-window batching per destination key.
pub struct CoalesceQueue {
    window: Duration,
    threshold: usize,
    inner: Mutex<Inner>,
}

impl CoalesceQueue {
    pub fn new(window_seconds: u64, threshold: usize) -> Self {
        Self {
            window: Duration::seconds(window_seconds as i64),
            threshold: threshold.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn window_seconds(&self) -> u64 {
        self.window.num_seconds() as u64
    }

    /// Append a request to its destination's open batch, opening one when
    /// needed. Threshold and priority-mismatch cuts close immediately.
    pub fn push(&self, request: SendRequest) {
        let key = request.key();
        let now = request.enqueued_at;
        let priority = request.priority;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // A priority change forces the old batch out so priorities never
        // mix; a window-expired batch is likewise closed rather than
        // extended.
        let cut = inner
            .open
            .get(&key)
            .is_some_and(|open| open.priority != priority || now - open.opened_at >= self.window);
        if cut {
            let open = inner.open.remove(&key).expect("present under lock");
            inner.ready.push(open.close(self.window, key.clone()));
        }

        let seq = inner.next_seq;
        let open = inner.open.entry(key.clone()).or_insert_with(|| OpenBatch {
            requests: Vec::new(),
            opened_at: now,
            priority,
            seq,
        });
        if open.seq == seq {
            inner.next_seq += 1;
        }
        open.requests.push(request);
        let reached_threshold = open.requests.len() >= self.threshold;

        if reached_threshold {
            let open = inner.open.remove(&key).expect("present under lock");
            inner.ready.push(open.close(self.window, key));
        }
    }

    /// Close window-expired batches and drain everything ready, sorted by
    /// `(priority desc, opened_at asc)`; the sort is stable with respect
    /// to insertion order.
    pub fn pop_ready(&self, now: DateTime<Utc>) -> Vec<Batch> {
        let mut inner = self.inner.lock();

        let expired: Vec<BatchKey> = inner
            .open
            .iter()
            .filter(|(_, open)| now - open.opened_at >= self.window)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            let open = inner.open.remove(&key).expect("present under lock");
            let closed = open.close(self.window, key);
            inner.ready.push(closed);
        }

        let mut ready = std::mem::take(&mut inner.ready);
        drop(inner);

        ready.sort_by_key(|(batch, seq)| (Reverse(batch.priority), batch.opened_at, *seq));
        ready.into_iter().map(|(batch, _)| batch).collect()
    }

    /// Close and drain every batch regardless of window, for shutdown.
    pub fn force_flush(&self) -> Vec<Batch> {
        let mut inner = self.inner.lock();
        let keys: Vec<BatchKey> = inner.open.keys().cloned().collect();
        for key in keys {
            let open = inner.open.remove(&key).expect("present under lock");
            let closed = open.close(self.window, key);
            inner.ready.push(closed);
        }
        let mut ready = std::mem::take(&mut inner.ready);
        ready.sort_by_key(|(batch, seq)| (Reverse(batch.priority), batch.opened_at, *seq));
        ready.into_iter().map(|(batch, _)| batch).collect()
    }

    /// Open plus ready batch count, for observability.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.open.len() + inner.ready.len()
    }
}
