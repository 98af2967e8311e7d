//! Definition of the inner tree node.
//!
//! A segment pairs a linear model with an ordered run of small segment
//! buckets holding `(separator, child handle)` entries. The model predicts
//! which bucket covers a key; because the fit is bounded by the
//! segmentation error, the correcting walk around the prediction is short.
//! Whether the child handles name further segments or data buckets is the
//! segment's `is_bottom` flag, one tag per node rather than per slot.

use crate::bucket::Bucket;
use crate::kv::{Key, KeyValue};
use crate::model::LinearModel;

/// Inner node: a learned model over an ordered array of segment buckets.
///
/// Invariants:
/// * Bucket key ranges are disjoint and ascending across the array.
/// * The pivot equals the smallest stored separator.
/// * Entries of one subtree level are unique by key.
#[derive(Debug)]
pub(crate) struct Segment {
    is_bottom: bool,
    pivot: Key,
    n_smo: u32,
    fill_ratio: f64,
    model: LinearModel,
    buckets: Vec<Bucket>,
}

impl Segment {
    /// Build a segment over sorted child entries.
    ///
    /// The model is expanded by the inverse fill ratio so predictions spread
    /// over the slack slots. Entries land at their predicted bucket, never
    /// before an earlier entry's bucket, spilling right on overflow; that
    /// keeps bucket ranges disjoint and ascending.
    ///
    /// # Panics
    ///
    /// Panics if `entries` is empty or `fill_ratio` is out of `(0, 1]`.
    ///
    /// # Arguments
    ///
    /// * `entries` - Sorted `(separator, child handle)` entries.
    /// * `fill_ratio` - Target occupancy of each bucket.
    /// * `model` - Rank model fitted over the separator keys.
    /// * `is_bottom` - Whether the children are data buckets.
    /// * `bucket_capacity` - Slots per segment bucket.
    pub(crate) fn build(
        entries: &[KeyValue],
        fill_ratio: f64,
        mut model: LinearModel,
        is_bottom: bool,
        bucket_capacity: usize,
    ) -> Self {
        assert!(!entries.is_empty(), "a segment covers at least one child");
        assert!(
            fill_ratio > 0.0 && fill_ratio <= 1.0,
            "fill ratio {fill_ratio} out of (0, 1]"
        );

        model.expand(1.0 / fill_ratio);
        let slots = (entries.len() as f64 / fill_ratio).ceil() as usize;
        let num_buckets = slots.div_ceil(bucket_capacity).max(1);
        let mut buckets: Vec<Bucket> = (0..num_buckets)
            .map(|_| Bucket::with_capacity(bucket_capacity))
            .collect();

        let mut floor = 0;
        for kv in entries {
            let predicted = (model.predict(kv.key) as usize / bucket_capacity)
                .min(num_buckets - 1);
            let mut target = predicted.max(floor);
            loop {
                if target == buckets.len() {
                    buckets.push(Bucket::with_capacity(bucket_capacity));
                }
                if buckets[target].insert(*kv, true, 0) {
                    break;
                }
                target += 1;
            }
            floor = target;
        }

        Self {
            is_bottom,
            pivot: entries[0].key,
            n_smo: 0,
            fill_ratio,
            model,
            buckets,
        }
    }

    /// true if the children of this segment are data buckets.
    #[inline]
    pub(crate) fn is_bottom(&self) -> bool {
        self.is_bottom
    }

    /// Smallest stored separator.
    #[inline]
    pub(crate) fn pivot(&self) -> Key {
        self.pivot
    }

    /// Structural modifications absorbed by this segment so far.
    #[inline]
    pub(crate) fn n_smo(&self) -> u32 {
        self.n_smo
    }

    /// Record one absorbed structural modification.
    #[inline]
    pub(crate) fn bump_smo(&mut self) {
        self.n_smo += 1;
    }

    /// Occupancy target this segment was built with.
    #[inline]
    pub(crate) fn fill_ratio(&self) -> f64 {
        self.fill_ratio
    }

    /// Number of segment buckets.
    #[inline]
    pub(crate) fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Number of stored child entries.
    pub(crate) fn num_entries(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    #[inline]
    fn bucket_capacity(&self) -> usize {
        self.buckets[0].capacity()
    }

    /// Bucket id the model predicts for `key`, clamped to the array.
    #[inline]
    fn predict_bucket(&self, key: Key) -> usize {
        (self.model.predict(key) as usize / self.bucket_capacity())
            .min(self.buckets.len() - 1)
    }

    /// Index of the bucket whose key range covers `key`, starting from the
    /// model prediction and correcting in both directions. None when `key`
    /// is below every stored separator.
    fn locate_bucket(&self, key: Key) -> Option<usize> {
        let predicted = self.predict_bucket(key);
        let mut covering = None;

        // The prediction may undershoot: the last bucket with pivot <= key
        // wins. Empty buckets are skipped, the first greater pivot stops.
        for (i, bucket) in self.buckets.iter().enumerate().skip(predicted) {
            if bucket.is_empty() {
                continue;
            }
            if bucket.pivot() <= key {
                covering = Some(i);
            } else {
                break;
            }
        }

        // Or overshoot: back off to the nearest covering bucket.
        if covering.is_none() {
            covering = self.buckets[..predicted]
                .iter()
                .rposition(|b| !b.is_empty() && b.pivot() <= key);
        }
        covering
    }

    /// Largest stored entry with separator at most `key`, and the entry
    /// right after it. None when `key` is below the segment pivot.
    pub(crate) fn lb_lookup(&self, key: Key) -> Option<(KeyValue, Option<KeyValue>)> {
        let covering = self.locate_bucket(key)?;
        let found = self.buckets[covering]
            .lb_lookup(key)
            .expect("covering bucket holds its pivot");

        let next = self.buckets[covering].min_above(key).or_else(|| {
            self.buckets[covering + 1..]
                .iter()
                .find(|b| !b.is_empty())
                .and_then(|b| b.lb_lookup(b.pivot()))
        });
        Some((found, next))
    }

    /// Overwrite the entry stored under `old_pivot`; false if absent.
    ///
    /// Used to swap a rebuilt subtree into its parent slot. Bucket and
    /// segment pivots follow the new key when the leftmost entry changes.
    pub(crate) fn update(&mut self, old_pivot: Key, new: KeyValue) -> bool {
        let Some(covering) = self.locate_bucket(old_pivot) else {
            return false;
        };
        let Some(pos) = self.buckets[covering].get_pos(old_pivot) else {
            return false;
        };

        self.buckets[covering].put(pos, new);
        if new.key != old_pivot {
            self.buckets[covering].refresh_pivot();
        }
        if self.pivot == old_pivot {
            self.pivot = new.key;
        }
        true
    }

    /// Replace the entry under `old_pivot` with a sorted run of entries.
    ///
    /// Succeeds when the covering bucket can take the run, possibly after
    /// shifting its largest entries into the immediate right neighbor.
    /// Anything wider is the caller's escalation; failure leaves the
    /// segment untouched.
    ///
    /// # Arguments
    ///
    /// * `old_pivot` - Separator being replaced.
    /// * `new` - Sorted replacement entries, at least one.
    pub(crate) fn batch_update(&mut self, old_pivot: Key, new: &[KeyValue]) -> bool {
        assert!(!new.is_empty(), "a replacement run cannot be empty");
        let Some(covering) = self.locate_bucket(old_pivot) else {
            return false;
        };
        if self.buckets[covering].get_pos(old_pivot).is_none() {
            return false;
        }

        let capacity = self.bucket_capacity();
        // Replacing frees the old slot first.
        let available = capacity - self.buckets[covering].len() + 1;
        let spill = new.len().saturating_sub(available);
        if spill > 0 {
            let Some(right) = self.buckets.get(covering + 1) else {
                return false;
            };
            if capacity - right.len() < spill {
                return false;
            }
        }

        self.buckets[covering].remove(old_pivot);

        // Shift the largest entries right to make room; they stay below
        // every key already in the neighbor.
        for _ in 0..spill {
            let largest = self.buckets[covering].max_kv().expect("bucket not empty");
            self.buckets[covering].remove(largest.key);
            let moved = self.buckets[covering + 1].insert(largest, true, 0);
            debug_assert!(moved, "neighbor capacity was checked");
        }

        for kv in new {
            let inserted = self.buckets[covering].insert(*kv, false, 0);
            debug_assert!(inserted, "covering capacity was checked");
        }
        self.buckets[covering].refresh_pivot();

        if self.pivot == old_pivot {
            self.pivot = new[0].key;
        }
        true
    }

    /// Snapshot of all child entries in ascending key order.
    pub(crate) fn sorted_entries(&self) -> Vec<KeyValue> {
        let mut entries = Vec::with_capacity(self.num_entries());
        for bucket in &self.buckets {
            entries.extend(bucket.sorted_kvs());
        }
        entries
    }

    /// Heap footprint of this segment in bytes.
    pub(crate) fn mem_size(&self) -> usize {
        size_of::<Self>() + self.buckets.iter().map(Bucket::mem_size).sum::<usize>()
    }
}
