//! Sliding-window tracking of durable progress markers.
//!
//! Entries are `start`ed in source-log order and may `finish` in any order.
//! The committed marker is always the contiguous-prefix high-water mark: the
//! highest finished marker below the lowest still-pending one. An update
//! window batches commits so a burst of finishes produces one write.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct MarkerEntry {
    pos: u64,
    timestamp: Option<DateTime<Utc>>,
}

/// A marker value ready to be written durably.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerUpdate<T> {
    pub marker: T,
    pub pos: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

pub struct MarkerTracker<T: Ord + Clone + Debug> {
    window_size: usize,
    updates_since_flush: usize,
    pending: BTreeMap<T, MarkerEntry>,
    finished: BTreeMap<T, MarkerEntry>,
    key_to_marker: HashMap<String, T>,
    marker_to_key: BTreeMap<T, String>,
    need_retry_set: HashSet<String>,
}

impl<T: Ord + Clone + Debug> MarkerTracker<T> {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            updates_since_flush: 0,
            pending: BTreeMap::new(),
            finished: BTreeMap::new(),
            key_to_marker: HashMap::new(),
            marker_to_key: BTreeMap::new(),
            need_retry_set: HashSet::new(),
        }
    }

    /// Register `marker` as in-flight.
    pub fn start(&mut self, marker: T, pos: u64, timestamp: Option<DateTime<Utc>>) {
        self.pending.insert(marker, MarkerEntry { pos, timestamp });
    }

    /// Mark `marker` complete. Returns the value to commit when the window
    /// flushes, `None` while the completion is merely buffered.
    pub fn finish(&mut self, marker: &T) -> Option<MarkerUpdate<T>> {
        let is_first = self
            .pending
            .keys()
            .next()
            .map(|first| first == marker)
            .unwrap_or(false);

        let Some(entry) = self.pending.remove(marker) else {
            tracing::warn!("finish called on non-pending marker {:?}", marker);
            return None;
        };

        self.finished.insert(marker.clone(), entry);
        self.handle_finish(marker);
        self.updates_since_flush += 1;

        if is_first && (self.updates_since_flush >= self.window_size || self.pending.is_empty()) {
            self.flush()
        } else {
            None
        }
    }

    /// Compute and consume the current contiguous-prefix high-water mark,
    /// regardless of the window. Used at phase boundaries.
    pub fn flush(&mut self) -> Option<MarkerUpdate<T>> {
        if self.finished.is_empty() {
            return None;
        }

        let candidate = match self.pending.keys().next() {
            Some(first_pending) => self
                .finished
                .range((Bound::Unbounded, Bound::Excluded(first_pending.clone())))
                .next_back()
                .map(|(marker, _)| marker.clone())?,
            None => self.finished.keys().next_back().cloned()?,
        };

        // Drop the committed prefix; completions above a pending gap stay
        // buffered for a later flush.
        let mut tail = self.finished.split_off(&candidate);
        let entry = tail.remove(&candidate)?;
        self.finished = tail;
        self.updates_since_flush = 0;

        Some(MarkerUpdate {
            marker: candidate,
            pos: entry.pos,
            timestamp: entry.timestamp,
        })
    }

    /// Bind `key` to an in-flight `marker` so no second sync runs for the
    /// same key. On rejection the key is flagged for a retry once the
    /// in-flight sync finishes.
    pub fn index_key_to_marker(&mut self, key: &str, marker: &T) -> bool {
        if self.key_to_marker.contains_key(key) {
            self.need_retry_set.insert(key.to_string());
            return false;
        }
        self.key_to_marker.insert(key.to_string(), marker.clone());
        self.marker_to_key.insert(marker.clone(), key.to_string());
        true
    }

    pub fn need_retry(&self, key: &str) -> bool {
        self.need_retry_set.contains(key)
    }

    pub fn reset_need_retry(&mut self, key: &str) {
        self.need_retry_set.remove(key);
    }

    fn handle_finish(&mut self, marker: &T) {
        if let Some(key) = self.marker_to_key.remove(marker) {
            self.key_to_marker.remove(&key);
            self.need_retry_set.remove(&key);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Durable writer for one marker flavor; each call persists the given
/// high-water value.
#[async_trait]
pub trait StoreMarker<T: Send>: Send {
    async fn store_marker(&mut self, update: &MarkerUpdate<T>) -> Result<()>;
}

/// A tracker paired with its durable writer. Callers share it behind an
/// async mutex held across the store write, which serializes commits in
/// window order.
pub struct TrackedMarkers<T: Ord + Clone + Debug + Send, S: StoreMarker<T>> {
    tracker: MarkerTracker<T>,
    writer: S,
}

pub type SharedTracker<T, S> = Arc<Mutex<TrackedMarkers<T, S>>>;

impl<T: Ord + Clone + Debug + Send, S: StoreMarker<T>> TrackedMarkers<T, S> {
    pub fn new(window_size: usize, writer: S) -> Self {
        Self {
            tracker: MarkerTracker::new(window_size),
            writer,
        }
    }

    pub fn shared(window_size: usize, writer: S) -> SharedTracker<T, S> {
        Arc::new(Mutex::new(Self::new(window_size, writer)))
    }

    pub fn start(&mut self, marker: T, pos: u64, timestamp: Option<DateTime<Utc>>) {
        self.tracker.start(marker, pos, timestamp);
    }

    pub async fn finish(&mut self, marker: &T) -> Result<()> {
        if let Some(update) = self.tracker.finish(marker) {
            self.writer.store_marker(&update).await?;
        }
        Ok(())
    }

    /// Force out the final high-water mark without writing it; the caller
    /// folds it into a phase-transition write.
    pub fn take_flush(&mut self) -> Option<MarkerUpdate<T>> {
        self.tracker.flush()
    }

    /// Commit whatever the window still buffers. Called at the end of a
    /// sync pass.
    pub async fn commit_flush(&mut self) -> Result<()> {
        if let Some(update) = self.tracker.flush() {
            self.writer.store_marker(&update).await?;
        }
        Ok(())
    }

    pub fn index_key_to_marker(&mut self, key: &str, marker: &T) -> bool {
        self.tracker.index_key_to_marker(key, marker)
    }

    pub fn need_retry(&self, key: &str) -> bool {
        self.tracker.need_retry(key)
    }

    pub fn reset_need_retry(&mut self, key: &str) {
        self.tracker.reset_need_retry(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers(tracker: &mut MarkerTracker<String>, values: &[&str]) {
        for (i, value) in values.iter().enumerate() {
            tracker.start(value.to_string(), i as u64 + 1, None);
        }
    }

    #[test]
    fn in_order_finishes_commit_each_with_window_one() {
        let mut tracker = MarkerTracker::new(1);
        markers(&mut tracker, &["m1", "m2"]);

        let update = tracker.finish(&"m1".to_string()).unwrap();
        assert_eq!(update.marker, "m1");
        assert_eq!(update.pos, 1);

        let update = tracker.finish(&"m2".to_string()).unwrap();
        assert_eq!(update.marker, "m2");
        assert_eq!(update.pos, 2);
    }

    #[test]
    fn out_of_order_finish_buffers_until_prefix_closes() {
        let mut tracker = MarkerTracker::new(1);
        markers(&mut tracker, &["m1", "m2", "m3"]);

        // m2 finishes first: nothing committable, m1 still pending.
        assert!(tracker.finish(&"m2".to_string()).is_none());

        // m1 closes the prefix; the committed value jumps to m2.
        let update = tracker.finish(&"m1".to_string()).unwrap();
        assert_eq!(update.marker, "m2");

        let update = tracker.finish(&"m3".to_string()).unwrap();
        assert_eq!(update.marker, "m3");
    }

    #[test]
    fn window_batches_commits() {
        let mut tracker = MarkerTracker::new(3);
        markers(&mut tracker, &["m1", "m2", "m3", "m4"]);

        assert!(tracker.finish(&"m1".to_string()).is_none());
        assert!(tracker.finish(&"m2".to_string()).is_none());

        let update = tracker.finish(&"m3".to_string()).unwrap();
        assert_eq!(update.marker, "m3");

        // Last pending entry flushes regardless of the window.
        let update = tracker.finish(&"m4".to_string()).unwrap();
        assert_eq!(update.marker, "m4");
    }

    #[test]
    fn flush_never_crosses_a_pending_gap() {
        let mut tracker = MarkerTracker::new(1);
        markers(&mut tracker, &["m1", "m2", "m3"]);

        assert!(tracker.finish(&"m3".to_string()).is_none());
        let update = tracker.finish(&"m1".to_string()).unwrap();
        // m2 is still pending: the commit stops short of m3.
        assert_eq!(update.marker, "m1");

        let update = tracker.finish(&"m2".to_string()).unwrap();
        assert_eq!(update.marker, "m3");
    }

    #[test]
    fn forced_flush_returns_high_water_once() {
        let mut tracker = MarkerTracker::new(10);
        markers(&mut tracker, &["m1", "m2", "m3"]);
        assert!(tracker.finish(&"m1".to_string()).is_none());
        assert!(tracker.finish(&"m2".to_string()).is_none());
        // m3 is the last pending entry, so its finish flushes everything.
        let update = tracker.finish(&"m3".to_string()).unwrap();
        assert_eq!(update.marker, "m3");
        assert!(tracker.flush().is_none());
    }

    #[test]
    fn finish_of_unknown_marker_is_ignored() {
        let mut tracker: MarkerTracker<String> = MarkerTracker::new(1);
        assert!(tracker.finish(&"m1".to_string()).is_none());
    }

    #[test]
    fn key_dedup_flags_retry_and_clears_on_finish() {
        let mut tracker = MarkerTracker::new(1);

        assert!(tracker.index_key_to_marker("b1:A:0", &"L1".to_string()));
        tracker.start("L1".to_string(), 0, None);

        // A second entry for the same bucket shard is rejected and the key
        // is flagged for one retry.
        assert!(!tracker.index_key_to_marker("b1:A:0", &"L2".to_string()));
        assert!(tracker.need_retry("b1:A:0"));

        // The dispatcher consumes the flag before re-running.
        tracker.reset_need_retry("b1:A:0");
        assert!(!tracker.need_retry("b1:A:0"));

        let update = tracker.finish(&"L1".to_string()).unwrap();
        assert_eq!(update.marker, "L1");

        // Binding is gone; the key can be indexed again.
        assert!(tracker.index_key_to_marker("b1:A:0", &"L3".to_string()));
    }
}
