//! Definition of the bucketized learned index.
//!
//! The tree has two layers: an upper multi-level tree of segments, each a
//! linear model over an array of segment buckets, and a leaf layer of
//! unsorted data buckets. Lookups descend by model prediction; inserts go
//! to the covering data bucket and escalate through a split, a batched
//! pivot replacement in the parent, a level rebuild, or a neighbor merge
//! when churn concentrates in one region.
//!
//! The index is a single-writer structure: mutation goes through `&mut
//! self`, and rebuilds are assembled to the side before one slot or root
//! swap publishes them, so shared readers of a stable snapshot never see a
//! torn tree.

use crate::arena::{DataId, NodeArena, SegId};
use crate::bucket::Bucket;
use crate::config::{HintKind, IndexOptions};
use crate::corridor::GreedyErrorCorridor;
use crate::cursor::DataCursor;
use crate::kv::{KEY_MAX, KEY_MIN, Key, KeyValue, Value};
use crate::segment::Segment;
use crate::segmentation::{dynamic_segmentation, fixed_segmentation};
use tracing::{debug, info, trace};
use xxhash_rust::xxh3::xxh3_64;

/// Either kind of node a descent step can land on.
#[derive(Debug, Clone, Copy)]
enum NodeRef {
    Seg(SegId),
    Data(DataId),
}

impl NodeRef {
    fn seg(self) -> SegId {
        match self {
            NodeRef::Seg(id) => id,
            NodeRef::Data(_) => unreachable!("expected a segment"),
        }
    }

    fn data(self) -> DataId {
        match self {
            NodeRef::Data(id) => id,
            NodeRef::Seg(_) => unreachable!("expected a data bucket"),
        }
    }
}

/// One step of a root-to-leaf descent: the separator that was followed and
/// the node it resolved to.
#[derive(Debug, Clone, Copy)]
struct PathEntry {
    sep: Key,
    node: NodeRef,
}

/// Counters describing the current shape of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Stored records, including the anchor.
    pub num_keys: u64,
    /// Live segments across all levels.
    pub num_segments: usize,
    /// Live data buckets.
    pub num_data_buckets: usize,
    /// Levels including the data layer.
    pub height: usize,
    /// Structural modifications resolved by a neighbor merge.
    pub n_merging: u64,
    /// Structural modifications resolved by upward propagation.
    pub n_non_merging: u64,
}

/// An ordered in-memory key-value index with learned inner nodes.
///
/// Keys are unsigned integers; values are fixed width. The anchor record
/// `(KEY_MIN, 0)` is added on the first load so a lower-bound descent can
/// never miss, and inserting [`KEY_MIN`] updates it in place.
#[derive(Debug)]
pub struct BuckIndex {
    opts: IndexOptions,
    arena: NodeArena,
    root: Option<SegId>,
    num_keys: u64,
    n_merging: u64,
    n_non_merging: u64,
}

impl BuckIndex {
    /// Create an empty index with the given load target and segmentation
    /// tolerance, keeping every other option at its default.
    ///
    /// # Panics
    ///
    /// Panics if `fill_ratio` is out of `(0, 1]` or `error_bound` is zero.
    ///
    /// # Arguments
    ///
    /// * `fill_ratio` - Target bucket occupancy at load and rebuild.
    /// * `error_bound` - Inner-layer segmentation tolerance.
    pub fn new(fill_ratio: f64, error_bound: u64) -> Self {
        Self::with_options(IndexOptions {
            initial_fill_ratio: fill_ratio,
            error_bound,
            ..IndexOptions::default()
        })
    }

    /// Create an empty index from a full option set.
    ///
    /// # Panics
    ///
    /// Panics if the options fail validation.
    pub fn with_options(opts: IndexOptions) -> Self {
        opts.validate();
        Self {
            opts,
            arena: NodeArena::default(),
            root: None,
            num_keys: 0,
            n_merging: 0,
            n_non_merging: 0,
        }
    }

    /// Load a sorted record set, replacing any existing contents.
    ///
    /// A leading anchor record is prepended when absent. The data layer is
    /// cut into fixed runs sized by the fill ratio; segment levels are then
    /// built by dynamic segmentation until one segment covers the range.
    ///
    /// # Panics
    ///
    /// Panics unless keys are strictly ascending.
    ///
    /// # Arguments
    ///
    /// * `kvs` - Records in strictly ascending key order.
    pub fn bulk_load(&mut self, kvs: &[KeyValue]) {
        assert!(
            kvs.windows(2).all(|w| w[0].key < w[1].key),
            "bulk load requires strictly ascending keys"
        );

        self.arena = NodeArena::default();
        self.root = None;

        let mut records = Vec::with_capacity(kvs.len() + 1);
        if kvs.first().is_none_or(|kv| kv.key != KEY_MIN) {
            records.push(KeyValue::new(KEY_MIN, 0));
        }
        records.extend_from_slice(kvs);

        // Data layer: fixed cuts sized for the target occupancy.
        let capacity = self.opts.data_bucket_capacity;
        let run = ((capacity as f64 * self.opts.initial_fill_ratio) as usize).max(1);
        let cuts = fixed_segmentation(records.len(), run);
        let mut level = Vec::with_capacity(cuts.len());
        for cut in &cuts {
            let slice = &records[cut.start..cut.start + cut.len];
            let covers_tail = cut.start + cut.len == records.len();
            // The hint span ends at the next bucket's separator, the same
            // bound a later descent reports as the following entry.
            let span_end = if covers_tail {
                KEY_MAX
            } else {
                records[cut.start + cut.len].key
            };

            let mut bucket = Bucket::with_capacity(capacity);
            for kv in slice {
                let hint = self.probe_hint(kv.key, slice[0].key, span_end);
                let stored = bucket.insert(*kv, true, hint);
                debug_assert!(stored, "cut runs never exceed bucket capacity");
            }
            let id = self.arena.alloc_data(bucket);
            level.push(KeyValue::new(slice[0].key, id.to_value()));
        }

        // Model layers until a single segment covers everything.
        let mut is_bottom = true;
        loop {
            level = self.run_model_layer(&level, is_bottom);
            is_bottom = false;
            if level.len() == 1 {
                break;
            }
        }
        self.root = Some(SegId::from_value(level[0].value));
        self.num_keys = records.len() as u64;
        info!(
            keys = self.num_keys,
            data_buckets = cuts.len(),
            height = self.height(),
            "bulk load complete"
        );
    }

    /// Value stored under `key`, if any.
    pub fn lookup(&self, key: Key) -> Option<Value> {
        let root = self.root?;

        let mut seg = self.arena.segment(root);
        let (leaf_sep, next_sep, data) = loop {
            let (found, next) = seg.lb_lookup(key)?;
            if seg.is_bottom() {
                let next_sep = next.map_or(KEY_MAX, |kv| kv.key);
                break (found.key, next_sep, DataId::from_value(found.value));
            }
            seg = self.arena.segment(SegId::from_value(found.value));
        };

        let hint = self.probe_hint(key, leaf_sep, next_sep);
        self.arena.data(data).lookup(key, hint)
    }

    /// Copy up to `n` records with key at least `start_key` into `out`, in
    /// ascending key order. Returns how many were produced.
    ///
    /// # Arguments
    ///
    /// * `start_key` - Inclusive lower bound of the scan.
    /// * `n` - Records requested.
    /// * `out` - Destination buffer; its length also caps the scan.
    pub fn scan(&self, start_key: Key, n: usize, out: &mut [KeyValue]) -> usize {
        if self.root.is_none() {
            return 0;
        }
        let wanted = n.min(out.len());

        let (path, _) = self.lookup_path(start_key);
        let mut kvs = self.arena.data(path.last().expect("non-empty").node.data()).sorted_kvs();
        let mut pos = kvs.partition_point(|kv| kv.key < start_key);

        let mut cursor = DataCursor::from_path(&self.arena, &cursor_levels(&path));
        let mut produced = 0;
        loop {
            while pos < kvs.len() && produced < wanted {
                out[produced] = kvs[pos];
                produced += 1;
                pos += 1;
            }
            if produced == wanted || !cursor.next() {
                break;
            }
            kvs = self.arena.data(cursor.current()).sorted_kvs();
            pos = 0;
        }
        produced
    }

    /// Insert a record; inserting [`KEY_MIN`] updates the anchor in place.
    ///
    /// A full data bucket is median-split; the resulting pivots replace the
    /// old one in the leaf segment, escalating to a level rebuild or a
    /// neighbor merge when the parents cannot absorb them. Returns false
    /// only when an anchor update finds no anchor, which cannot happen on a
    /// loaded index.
    pub fn insert(&mut self, kv: KeyValue) -> bool {
        if self.root.is_none() {
            if kv.key == KEY_MIN {
                self.bulk_load(&[kv]);
            } else {
                self.bulk_load(&[KeyValue::new(KEY_MIN, 0), kv]);
            }
            return true;
        }

        let (path, next_sep) = self.lookup_path(kv.key);
        let leaf = *path.last().expect("non-empty path");

        if kv.key == KEY_MIN {
            return self.arena.data_mut(leaf.node.data()).update(kv);
        }

        let hint = self.probe_hint(kv.key, leaf.sep, next_sep);
        if self.arena.data_mut(leaf.node.data()).insert(kv, true, hint) {
            self.num_keys += 1;
            return true;
        }

        self.split_and_resolve(kv, &path);
        self.num_keys += 1;
        true
    }

    /// Total heap footprint of the index in bytes.
    pub fn memory_size(&self) -> usize {
        size_of::<Self>() + self.arena.mem_size()
    }

    /// Number of levels, counting the data layer.
    pub fn height(&self) -> usize {
        let Some(mut seg) = self.root else {
            return 0;
        };
        let mut levels = 1;
        loop {
            let segment = self.arena.segment(seg);
            if segment.is_bottom() {
                break;
            }
            seg = SegId::from_value(segment.sorted_entries()[0].value);
            levels += 1;
        }
        levels + 1
    }

    /// Shape counters of the index.
    pub fn stats(&self) -> Stats {
        Stats {
            num_keys: self.num_keys,
            num_segments: self.arena.num_segments(),
            num_data_buckets: self.arena.num_data_buckets(),
            height: self.height(),
            n_merging: self.n_merging,
            n_non_merging: self.n_non_merging,
        }
    }

    /// Descend to the covering data bucket, recording every step.
    ///
    /// Returns the path and the separator following the leaf separator,
    /// [`KEY_MAX`] when the leaf covers the tail of the key space.
    fn lookup_path(&self, key: Key) -> (Vec<PathEntry>, Key) {
        let root = self.root.expect("descent into an empty index");
        let mut path = vec![PathEntry {
            sep: KEY_MIN,
            node: NodeRef::Seg(root),
        }];

        loop {
            let seg_id = path.last().expect("non-empty").node.seg();
            let segment = self.arena.segment(seg_id);
            let (found, next) = segment
                .lb_lookup(key)
                .expect("the anchor covers every key");

            if segment.is_bottom() {
                path.push(PathEntry {
                    sep: found.key,
                    node: NodeRef::Data(DataId::from_value(found.value)),
                });
                return (path, next.map_or(KEY_MAX, |kv| kv.key));
            }
            path.push(PathEntry {
                sep: found.key,
                node: NodeRef::Seg(SegId::from_value(found.value)),
            });
        }
    }

    /// Advisory probe position for `key` in a data bucket covering
    /// `[start, end)`.
    fn probe_hint(&self, key: Key, start: Key, end: Key) -> usize {
        let capacity = self.opts.data_bucket_capacity;
        let hint = match self.opts.hint {
            HintKind::None => 0,
            HintKind::KeyMod => (key % capacity as u64) as usize,
            HintKind::HashMod => (xxh3_64(&key.to_le_bytes()) % capacity as u64) as usize,
            HintKind::Model => {
                let span = end.saturating_sub(start).max(1);
                let slope = capacity as f64 / span as f64;
                (slope * key.saturating_sub(start) as f64) as usize
            }
        };
        hint.min(capacity - 1)
    }

    /// Split the full leaf bucket under `path` and place the two pivots,
    /// escalating when the leaf segment cannot absorb them.
    fn split_and_resolve(&mut self, kv: KeyValue, path: &[PathEntry]) {
        let leaf = *path.last().expect("non-empty path");
        let old_data = leaf.node.data();
        let leaf_level = path.len() - 2;
        let leaf_seg = path[leaf_level].node.seg();

        let (left, right) = self.arena.data(old_data).split_and_insert(kv);
        trace!(
            key = kv.key,
            left = left.pivot(),
            right = right.pivot(),
            "split full data bucket"
        );
        let left_pivot = left.pivot();
        let right_pivot = right.pivot();
        let left_id = self.arena.alloc_data(left);
        let right_id = self.arena.alloc_data(right);
        let pivots = [
            KeyValue::new(left_pivot, left_id.to_value()),
            KeyValue::new(right_pivot, right_id.to_value()),
        ];

        if self.arena.segment_mut(leaf_seg).batch_update(leaf.sep, &pivots) {
            self.arena.segment_mut(leaf_seg).bump_smo();
            self.arena.free_data(old_data);
            return;
        }

        // The leaf segment is out of room; merge the churned neighborhood
        // or push the replacement upward.
        let threshold = self.opts.merge_smo_threshold;
        let merge = path.len() > 2
            && self.arena.segment(leaf_seg).n_smo() >= threshold
            && self.avg_smo_in_window(leaf_seg, path[leaf_level - 1].node.seg())
                >= threshold as f64;

        if merge {
            self.n_merging += 1;
            self.merge_neighborhood(path, &pivots, old_data);
        } else {
            self.n_non_merging += 1;
            self.propagate(path, &pivots);
        }
        self.arena.free_data(old_data);
    }

    /// Replace `old_sep` level by level, rebuilding each segment that
    /// cannot take the pivots in place, growing a new root if the
    /// replacement spills past the current one.
    fn propagate(&mut self, path: &[PathEntry], new_pivots: &[KeyValue]) {
        let mut garbage: Vec<SegId> = Vec::new();
        let mut pivots = new_pivots.to_vec();
        let mut old_sep = path.last().expect("non-empty").sep;
        let mut level = path.len() - 2;

        let mut placed = false;
        loop {
            let seg = path[level].node.seg();
            if self.arena.segment_mut(seg).batch_update(old_sep, &pivots) {
                placed = true;
                break;
            }

            debug!(level, pivots = pivots.len(), "rebuilding a full segment level");
            pivots = self.segment_and_batch_update(seg, old_sep, &pivots);
            garbage.push(seg);
            old_sep = path[level].sep;
            if level == 0 {
                break;
            }
            level -= 1;
        }

        if !placed {
            // The root itself was rebuilt.
            if pivots.len() > 1 {
                let keys: Vec<Key> = pivots.iter().map(|kv| kv.key).collect();
                let model = self.opts.model.fit(&keys);
                let root = Segment::build(
                    &pivots,
                    self.opts.initial_fill_ratio,
                    model,
                    false,
                    self.opts.segment_bucket_capacity,
                );
                let root_id = self.arena.alloc_segment(root);
                debug!(fanout = pivots.len(), "grew a new root level");
                self.root = Some(root_id);
            } else {
                self.root = Some(SegId::from_value(pivots[0].value));
            }
        }

        for seg in garbage {
            self.arena.free_segment(seg);
        }
    }

    /// Re-run dynamic segmentation over a segment's children with
    /// `replacement` standing in for `old_sep`, allocating the new sibling
    /// segments and returning their pivot entries for the parent level.
    fn segment_and_batch_update(
        &mut self,
        seg: SegId,
        old_sep: Key,
        replacement: &[KeyValue],
    ) -> Vec<KeyValue> {
        let segment = self.arena.segment(seg);
        let is_bottom = segment.is_bottom();

        let mut merged = Vec::with_capacity(segment.num_entries() + replacement.len());
        let mut replaced = false;
        for entry in segment.sorted_entries() {
            if entry.key == old_sep {
                merged.extend_from_slice(replacement);
                replaced = true;
            } else {
                merged.push(entry);
            }
        }
        assert!(replaced, "rebuilt segment must hold the old separator");

        let fill_ratio = self.arena.segment(seg).fill_ratio();
        self.build_segment_level(&merged, is_bottom, fill_ratio)
    }

    /// Build one segment level over sorted child entries at the configured
    /// fill ratio, returning the pivot entries of the created segments.
    fn run_model_layer(&mut self, entries: &[KeyValue], is_bottom: bool) -> Vec<KeyValue> {
        self.build_segment_level(entries, is_bottom, self.opts.initial_fill_ratio)
    }

    fn build_segment_level(
        &mut self,
        entries: &[KeyValue],
        is_bottom: bool,
        fill_ratio: f64,
    ) -> Vec<KeyValue> {
        let keys = entries.iter().map(|kv| kv.key);
        let pieces = dynamic_segmentation(keys, self.opts.error_bound, self.opts.model);

        let mut out = Vec::with_capacity(pieces.len());
        for (cut, model) in pieces {
            // Separators are unique, so only a single-child piece may carry
            // a degenerate model.
            debug_assert!(cut.len == 1 || model.is_valid());
            let slice = &entries[cut.start..cut.start + cut.len];
            let segment = Segment::build(
                slice,
                fill_ratio,
                model,
                is_bottom,
                self.opts.segment_bucket_capacity,
            );
            let id = self.arena.alloc_segment(segment);
            out.push(KeyValue::new(slice[0].key, id.to_value()));
        }
        out
    }

    /// Windowed average of absorbed splits among the sibling segments
    /// around `leaf` under `parent`: up to `merge_window` neighbors on each
    /// side, the leaf itself excluded. Zero when the leaf has no neighbors.
    fn avg_smo_in_window(&self, leaf: SegId, parent: SegId) -> f64 {
        let window = self.opts.merge_window;
        let leaf_pivot = self.arena.segment(leaf).pivot();
        let entries = self.arena.segment(parent).sorted_entries();
        let anchor = entries
            .partition_point(|e| e.key < leaf_pivot)
            .min(entries.len() - 1);
        let smo_of = |entry: &KeyValue| {
            self.arena.segment(SegId::from_value(entry.value)).n_smo() as f64
        };

        let mut sum = 0.0;
        let mut count = 0.0;
        for entry in entries.iter().skip(anchor + 1).take(window) {
            sum += smo_of(entry);
            count += 1.0;
        }
        for entry in entries[..anchor].iter().rev().take(window) {
            sum += smo_of(entry);
            count += 1.0;
        }

        if count == 0.0 {
            return 0.0;
        }
        sum / count
    }

    /// Rebuild the churned neighborhood around a split bucket.
    ///
    /// The corridor walks outward from the split bucket's pivot in both
    /// directions until a neighbor pivot falls outside the bound; every
    /// data bucket under the lowest common ancestor of the walk is then
    /// re-segmented bottom-up into a replacement subtree, with the two
    /// split halves standing in for the original bucket.
    fn merge_neighborhood(
        &mut self,
        path: &[PathEntry],
        new_pivots: &[KeyValue],
        old_data: DataId,
    ) {
        let center = self.arena.data(old_data).pivot();
        let levels = cursor_levels(path);

        let mut gec = GreedyErrorCorridor::new(center, self.opts.error_bound);
        let lca_level = {
            let mut left = DataCursor::from_path(&self.arena, &levels);
            while left.prev() {
                if left.at_begin() {
                    break;
                }
                if !gec.is_bounded(self.arena.data(left.current()).pivot()) {
                    break;
                }
            }

            gec.restart(center);
            let mut right = DataCursor::from_path(&self.arena, &levels);
            while right.next() {
                if !gec.is_bounded(self.arena.data(right.current()).pivot()) {
                    break;
                }
            }
            left.lca_level().min(right.lca_level())
        };

        // Leftmost descent from the ancestor the walks stayed under.
        let lca = path[lca_level];
        let mut sub_levels = Vec::new();
        let mut seg = lca.node.seg();
        loop {
            let segment = self.arena.segment(seg);
            let first = segment.sorted_entries()[0];
            sub_levels.push((seg, first.key));
            if segment.is_bottom() {
                break;
            }
            seg = SegId::from_value(first.value);
        }

        // Every data bucket under the ancestor in order, the split halves
        // standing in for the original.
        let mut children = Vec::new();
        {
            let mut cursor = DataCursor::from_path(&self.arena, &sub_levels);
            loop {
                if cursor.at_end() {
                    break;
                }
                let data = cursor.current();
                if data == old_data {
                    children.extend_from_slice(new_pivots);
                } else {
                    children.push(KeyValue::new(self.arena.data(data).pivot(), data.to_value()));
                }
                if !cursor.next() {
                    break;
                }
            }
        }
        assert!(children.len() >= 2, "merge always covers the split bucket");
        debug!(
            lca_level,
            buckets = children.len() - 1,
            "rebuilding merge neighborhood"
        );

        let mut garbage = Vec::new();
        self.collect_subtree_segments(lca.node.seg(), &mut garbage);

        // Partial bulk load of the neighborhood.
        let mut entries = children;
        let mut is_bottom = true;
        loop {
            entries = self.run_model_layer(&entries, is_bottom);
            is_bottom = false;
            if entries.len() == 1 {
                break;
            }
        }
        let new_lca = entries[0];

        if lca_level == 0 {
            self.root = Some(SegId::from_value(new_lca.value));
        } else {
            let parent = path[lca_level - 1].node.seg();
            let swapped = self.arena.segment_mut(parent).update(lca.sep, new_lca);
            assert!(swapped, "the ancestor slot must exist in its parent");
        }

        for seg in garbage {
            self.arena.free_segment(seg);
        }
    }

    /// Collect every segment of the subtree rooted at `seg`.
    fn collect_subtree_segments(&self, seg: SegId, out: &mut Vec<SegId>) {
        let mut stack = vec![seg];
        while let Some(current) = stack.pop() {
            out.push(current);
            let segment = self.arena.segment(current);
            if segment.is_bottom() {
                continue;
            }
            for entry in segment.sorted_entries() {
                stack.push(SegId::from_value(entry.value));
            }
        }
    }
}

/// Per-level `(segment, chosen separator)` pairs of a descent path.
fn cursor_levels(path: &[PathEntry]) -> Vec<(SegId, Key)> {
    (0..path.len() - 1)
        .map(|i| (path[i].node.seg(), path[i + 1].sep))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelKind;
    use crate::model::LinearModel;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn pairs(kvs: &[(Key, Value)]) -> Vec<KeyValue> {
        kvs.iter().map(|&(k, v)| KeyValue::new(k, v)).collect()
    }

    fn small_options() -> IndexOptions {
        IndexOptions {
            data_bucket_capacity: 8,
            segment_bucket_capacity: 4,
            initial_fill_ratio: 0.7,
            error_bound: 2,
            ..IndexOptions::default()
        }
    }

    #[test]
    fn tiny_bulk_load_lookup() {
        let mut index = BuckIndex::new(0.7, 8);
        let kvs: Vec<KeyValue> = (1..=10).map(|i| KeyValue::new(i, 10 + i)).collect();
        index.bulk_load(&kvs);

        for i in 1..=10u64 {
            assert_eq!(Some(10 + i), index.lookup(i));
        }
        assert_eq!(Some(0), index.lookup(0));
        assert_eq!(None, index.lookup(11));
    }

    #[test]
    fn sparse_bulk_load() {
        let mut index = BuckIndex::new(0.7, 8);
        let kvs = pairs(&[
            (1, 10),
            (2, 20),
            (3, 30),
            (100, 1000),
            (110, 1100),
            (200, 2000),
            (210, 2100),
            (300, 3000),
            (305, 3050),
            (1000, 10000),
            (1200, 12000),
            (1300, 13000),
            (1400, 14000),
        ]);
        index.bulk_load(&kvs);

        for kv in &kvs {
            assert_eq!(Some(kv.value), index.lookup(kv.key), "key {}", kv.key);
        }
        assert_eq!(None, index.lookup(99));
        assert_eq!(None, index.lookup(1401));
    }

    #[test]
    fn multi_level_build() {
        let mut index = BuckIndex::with_options(small_options());
        let kvs = pairs(&[
            (1, 10),
            (2, 20),
            (3, 30),
            (100, 1000),
            (110, 1100),
            (200, 2000),
            (210, 2100),
            (300, 3000),
            (305, 3050),
            (1000, 10000),
            (1200, 12000),
            (1300, 13000),
            (1400, 14000),
            (10000, 100000),
            (10001, 100010),
            (10002, 100020),
            (10003, 100030),
        ]);
        index.bulk_load(&kvs);

        assert!(index.height() >= 3, "height {}", index.height());
        for kv in &kvs {
            assert_eq!(Some(kv.value), index.lookup(kv.key), "key {}", kv.key);
        }
    }

    #[test]
    fn insert_from_empty() {
        let mut index = BuckIndex::new(0.7, 8);

        assert!(index.insert(KeyValue::new(3, 32)));
        assert_eq!(Some(32), index.lookup(3));
        assert_eq!(None, index.lookup(5));

        assert!(index.insert(KeyValue::new(5, 52)));
        assert_eq!(Some(52), index.lookup(5));
        assert_eq!(Some(32), index.lookup(3));
        assert_eq!(Some(0), index.lookup(KEY_MIN));
    }

    #[test]
    fn split_and_propagate_preserves_keys() {
        let mut index = BuckIndex::with_options(small_options());
        let kvs: Vec<KeyValue> = (1..=10).map(|i| KeyValue::new(i * 10, i)).collect();
        index.bulk_load(&kvs);

        // A skewed burst into one leaf region.
        let mut inserted = Vec::new();
        for i in 0..50u64 {
            let key = 41 + i;
            if index.lookup(key).is_none() {
                assert!(index.insert(KeyValue::new(key, key + 7)));
                inserted.push(key);
            }
        }

        for kv in &kvs {
            assert_eq!(Some(kv.value), index.lookup(kv.key), "loaded key {}", kv.key);
        }
        for &key in &inserted {
            assert_eq!(Some(key + 7), index.lookup(key), "inserted key {key}");
        }
        assert!(index.height() >= 2);
        assert!(index.stats().num_data_buckets > 1);
    }

    #[test]
    fn scan_across_segments() {
        let mut index = BuckIndex::new(0.7, 8);
        let kvs: Vec<KeyValue> = (0..10_000).map(|i| KeyValue::new(2 * i, i)).collect();
        index.bulk_load(&kvs);

        let mut out = [KeyValue::new(0, 0); 4];
        let produced = index.scan(5001, 4, &mut out);

        assert_eq!(4, produced);
        assert_eq!(vec![5002, 5004, 5006, 5008], out.iter().map(|kv| kv.key).collect::<Vec<_>>());
        assert_eq!(vec![2501, 2502, 2503, 2504], out.iter().map(|kv| kv.value).collect::<Vec<_>>());
    }

    #[test]
    fn scan_from_stored_key_includes_it() {
        let mut index = BuckIndex::new(0.7, 8);
        index.bulk_load(&pairs(&[(10, 1), (20, 2), (30, 3)]));

        let mut out = [KeyValue::new(0, 0); 8];
        assert_eq!(3, index.scan(20, 8, &mut out));
        assert_eq!(20, out[0].key);
        assert_eq!(30, out[1].key);
        // Nothing is stored past the largest key.
        assert_eq!(0, index.scan(31, 8, &mut out));
    }

    #[test]
    fn scan_on_empty_index() {
        let index = BuckIndex::new(0.7, 8);
        let mut out = [KeyValue::new(0, 0); 4];
        assert_eq!(0, index.scan(0, 4, &mut out));
    }

    #[test]
    fn anchor_insert_updates_in_place() {
        let mut index = BuckIndex::new(0.7, 8);
        index.bulk_load(&pairs(&[(5, 50)]));
        assert_eq!(Some(0), index.lookup(KEY_MIN));

        assert!(index.insert(KeyValue::new(KEY_MIN, 99)));
        assert_eq!(Some(99), index.lookup(KEY_MIN));
        assert_eq!(Some(50), index.lookup(5));
    }

    #[rstest]
    #[case(HintKind::None, ModelKind::Endpoints)]
    #[case(HintKind::None, ModelKind::Regression)]
    #[case(HintKind::KeyMod, ModelKind::Regression)]
    #[case(HintKind::HashMod, ModelKind::Endpoints)]
    #[case(HintKind::Model, ModelKind::Endpoints)]
    #[case(HintKind::Model, ModelKind::Regression)]
    fn every_hint_and_model_combination_round_trips(
        #[case] hint: HintKind,
        #[case] model: ModelKind,
    ) {
        let mut index = BuckIndex::with_options(IndexOptions {
            hint,
            model,
            ..small_options()
        });

        let kvs: Vec<KeyValue> = (0..300u64).map(|i| KeyValue::new(i * 7 + 1, i)).collect();
        index.bulk_load(&kvs);
        for kv in &kvs {
            assert_eq!(Some(kv.value), index.lookup(kv.key), "key {}", kv.key);
        }

        for i in 0..200u64 {
            let key = i * 11 + 2;
            if index.lookup(key).is_none() {
                assert!(index.insert(KeyValue::new(key, key)));
            }
        }
        for i in 0..200u64 {
            let key = i * 11 + 2;
            assert!(index.lookup(key).is_some(), "key {key}");
        }
    }

    #[test]
    fn propagation_rebuilds_full_levels() {
        // Fill ratio 1.0 leaves no slack anywhere, so the very first split
        // must escalate; a prohibitive merge trigger forces the upward path.
        let mut index = BuckIndex::with_options(IndexOptions {
            data_bucket_capacity: 4,
            segment_bucket_capacity: 2,
            initial_fill_ratio: 1.0,
            error_bound: 1,
            merge_smo_threshold: 1000,
            merge_window: 2,
            ..IndexOptions::default()
        });

        let kvs: Vec<KeyValue> = (0..64u64).map(|i| KeyValue::new(i * 100, i)).collect();
        index.bulk_load(&kvs);

        for i in 0..40u64 {
            assert!(index.insert(KeyValue::new(i * 100 + 50, i)));
        }

        let stats = index.stats();
        assert!(stats.n_non_merging > 0, "no propagation happened: {stats:?}");
        assert_eq!(0, stats.n_merging);
        for i in 0..64u64 {
            assert_eq!(Some(i), index.lookup(i * 100), "loaded key {}", i * 100);
        }
        for i in 0..40u64 {
            assert_eq!(Some(i), index.lookup(i * 100 + 50), "inserted key {}", i * 100 + 50);
        }
    }

    #[rstest]
    #[case(1, 1.0, 1.0, 2.0)]
    #[case(2, 5.0 / 3.0, 1.5, 1.5)]
    fn smo_window_averages_true_neighbors(
        #[case] window: usize,
        #[case] mid: f64,
        #[case] leftmost: f64,
        #[case] rightmost: f64,
    ) {
        let mut index = BuckIndex::with_options(IndexOptions {
            merge_window: window,
            ..IndexOptions::default()
        });

        // One parent over four bottom segments carrying 0, 1, 2 and 3
        // absorbed splits.
        let mut ids = Vec::new();
        let mut children = Vec::new();
        for (i, base) in [0u64, 100, 200, 300].into_iter().enumerate() {
            let mut bucket = Bucket::with_capacity(4);
            assert!(bucket.insert(KeyValue::new(base, base), true, 0));
            let data = index.arena.alloc_data(bucket);

            let child = Segment::build(
                &[KeyValue::new(base, data.to_value())],
                1.0,
                LinearModel::default(),
                true,
                4,
            );
            let id = index.arena.alloc_segment(child);
            for _ in 0..i {
                index.arena.segment_mut(id).bump_smo();
            }
            ids.push(id);
            children.push(KeyValue::new(base, id.to_value()));
        }
        let keys: Vec<Key> = children.iter().map(|e| e.key).collect();
        let parent = index.arena.alloc_segment(Segment::build(
            &children,
            1.0,
            LinearModel::endpoints(&keys),
            false,
            8,
        ));

        // The leaf's own counter never enters the average.
        assert_eq!(mid, index.avg_smo_in_window(ids[1], parent));
        assert_eq!(leftmost, index.avg_smo_in_window(ids[0], parent));
        assert_eq!(rightmost, index.avg_smo_in_window(ids[3], parent));
    }

    #[test]
    fn merge_rebuild_preserves_keys() {
        // Quadratic keys keep every level multi-segment, so the tree is deep
        // enough to have merge ancestors; a zero merge trigger then turns
        // every failed pivot replacement into a neighborhood merge.
        let mut index = BuckIndex::with_options(IndexOptions {
            data_bucket_capacity: 4,
            segment_bucket_capacity: 2,
            initial_fill_ratio: 1.0,
            error_bound: 1,
            merge_smo_threshold: 0,
            merge_window: 2,
            ..IndexOptions::default()
        });

        let kvs: Vec<KeyValue> = (1..=64u64).map(|i| KeyValue::new(i * i, i)).collect();
        index.bulk_load(&kvs);
        assert!(index.height() >= 3, "height {}", index.height());

        // Squares and their successors never collide.
        for j in 1..=40u64 {
            assert!(index.insert(KeyValue::new(j * j + 1, j)));
        }

        let stats = index.stats();
        assert!(stats.n_merging > 0, "no merge happened: {stats:?}");
        for i in 1..=64u64 {
            assert_eq!(Some(i), index.lookup(i * i), "loaded key {}", i * i);
        }
        for j in 1..=40u64 {
            assert_eq!(Some(j), index.lookup(j * j + 1), "inserted key {}", j * j + 1);
        }
    }

    #[test]
    fn heavy_churn_stays_consistent() {
        let mut index = BuckIndex::with_options(IndexOptions {
            data_bucket_capacity: 4,
            segment_bucket_capacity: 2,
            initial_fill_ratio: 0.7,
            error_bound: 1,
            merge_smo_threshold: 1,
            merge_window: 2,
            ..IndexOptions::default()
        });

        let kvs: Vec<KeyValue> = (0..64u64).map(|i| KeyValue::new(i * 100, i)).collect();
        index.bulk_load(&kvs);

        let mut expected: BTreeMap<Key, Value> = kvs.iter().map(|kv| (kv.key, kv.value)).collect();
        let mut state = 0x243F_6A88_85A3_08D3u64;
        for _ in 0..2000 {
            // Cheap xorshift keeps the workload deterministic.
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let key = 1 + state % 6400;
            if expected.contains_key(&key) {
                continue;
            }
            assert!(index.insert(KeyValue::new(key, key + 3)));
            expected.insert(key, key + 3);
        }

        let stats = index.stats();
        assert!(
            stats.n_merging + stats.n_non_merging > 0,
            "workload never escalated: {stats:?}"
        );

        for (&key, &value) in &expected {
            assert_eq!(Some(value), index.lookup(key), "key {key}");
        }

        // A full scan sees every record once, in order.
        let mut out = vec![KeyValue::new(0, 0); expected.len() + 1];
        let produced = index.scan(0, out.len(), &mut out);
        assert_eq!(expected.len(), produced);
        let scanned: Vec<Key> = out[..produced].iter().map(|kv| kv.key).collect();
        let ordered: Vec<Key> = expected.keys().copied().collect();
        assert_eq!(ordered, scanned);
    }

    #[test]
    fn stats_reflect_shape() {
        let mut index = BuckIndex::with_options(small_options());
        let kvs: Vec<KeyValue> = (1..=100).map(|i| KeyValue::new(i, i)).collect();
        index.bulk_load(&kvs);

        let stats = index.stats();
        assert_eq!(101, stats.num_keys); // anchor included
        assert!(stats.num_data_buckets >= 100 / 8);
        assert!(stats.num_segments >= 1);
        assert!(stats.height >= 2);
        assert!(index.memory_size() > 0);
    }

    #[test]
    fn bulk_load_empty_set_keeps_anchor_only() {
        let mut index = BuckIndex::new(0.7, 8);
        index.bulk_load(&[]);
        assert_eq!(Some(0), index.lookup(KEY_MIN));
        assert_eq!(None, index.lookup(1));
        assert_eq!(1, index.stats().num_keys);
    }

    #[test]
    #[should_panic(expected = "strictly ascending")]
    fn bulk_load_rejects_unsorted_input() {
        let mut index = BuckIndex::new(0.7, 8);
        index.bulk_load(&pairs(&[(2, 1), (1, 2)]));
    }

    #[cfg(test)]
    mod state_machine {
        use super::*;
        use bolero::{TypeGenerator, check};

        #[derive(Debug, TypeGenerator)]
        enum Operation {
            Insert(u16),
            Lookup(u16),
            Scan(u16, u8),
        }

        /// Keys shift by one so the generated space never touches the anchor.
        fn to_key(raw: u16) -> Key {
            raw as Key + 1
        }

        #[test]
        fn equivalent_to_btreemap() {
            check!()
                .with_iterations(256)
                .with_type::<(Vec<u16>, Vec<Operation>)>()
                .for_each(|(load, operations)| {
                    let mut index = BuckIndex::with_options(IndexOptions {
                        data_bucket_capacity: 4,
                        segment_bucket_capacity: 2,
                        initial_fill_ratio: 0.7,
                        error_bound: 1,
                        merge_smo_threshold: 1,
                        merge_window: 1,
                        ..IndexOptions::default()
                    });
                    let mut oracle: BTreeMap<Key, Value> = BTreeMap::new();

                    let mut sorted: Vec<Key> = load.iter().map(|&k| to_key(k)).collect();
                    sorted.sort_unstable();
                    sorted.dedup();
                    let records: Vec<KeyValue> =
                        sorted.iter().map(|&k| KeyValue::new(k, k * 2)).collect();
                    if !records.is_empty() {
                        index.bulk_load(&records);
                        oracle.insert(KEY_MIN, 0);
                        oracle.extend(records.iter().map(|kv| (kv.key, kv.value)));
                    }

                    for op in operations {
                        match op {
                            Operation::Insert(raw) => {
                                let key = to_key(*raw);
                                if oracle.contains_key(&key) {
                                    continue;
                                }
                                assert!(index.insert(KeyValue::new(key, key * 2)));
                                oracle.insert(key, key * 2);
                                // The first insert materializes the anchor.
                                oracle.entry(KEY_MIN).or_insert(0);
                            }
                            Operation::Lookup(raw) => {
                                let key = to_key(*raw);
                                assert_eq!(oracle.get(&key).copied(), index.lookup(key));
                            }
                            Operation::Scan(raw, n) => {
                                let start = to_key(*raw);
                                let n = *n as usize % 32;
                                let mut out = vec![KeyValue::new(0, 0); n];
                                let produced = index.scan(start, n, &mut out);

                                let expected: Vec<KeyValue> = oracle
                                    .range(start..)
                                    .take(n)
                                    .map(|(&k, &v)| KeyValue::new(k, v))
                                    .collect();
                                assert_eq!(expected.len(), produced);
                                assert_eq!(expected, out[..produced].to_vec());
                            }
                        }
                    }
                });
        }
    }
}
