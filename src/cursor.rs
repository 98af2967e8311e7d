//! Definition of the ordered cross-bucket cursor over the data layer.
//!
//! The cursor keeps one frame per level of a root-to-leaf path and steps
//! through data buckets in key order, popping exhausted frames and
//! re-descending through the first (or last) child of the next sibling.
//! Both the scan path and the neighbor-merge walk drive it; the merge also
//! reads the shallowest level the walk ever popped to, which is the lowest
//! common ancestor of everything visited.

use crate::arena::{DataId, NodeArena, SegId};
use crate::kv::{KEY_MIN, Key, KeyValue};

#[derive(Debug)]
struct Frame {
    seg: SegId,
    entries: Vec<KeyValue>,
    pos: usize,
}

/// Ordered cursor over the data buckets below a path.
#[derive(Debug)]
pub(crate) struct DataCursor<'a> {
    arena: &'a NodeArena,
    stack: Vec<Frame>,
    lca_level: usize,
}

impl<'a> DataCursor<'a> {
    /// Position a cursor on a root-to-leaf path.
    ///
    /// # Panics
    ///
    /// Panics if `levels` is empty or a separator is not present in its
    /// segment.
    ///
    /// # Arguments
    ///
    /// * `arena` - Node storage backing the path.
    /// * `levels` - Per level, the segment and the separator of the chosen
    ///   child. The last segment must be a bottom segment.
    pub(crate) fn from_path(arena: &'a NodeArena, levels: &[(SegId, Key)]) -> Self {
        assert!(!levels.is_empty(), "a cursor needs at least one level");

        let mut stack = Vec::with_capacity(levels.len());
        for &(seg, child_sep) in levels {
            let entries = arena.segment(seg).sorted_entries();
            let pos = entries.partition_point(|e| e.key < child_sep);
            assert!(
                pos < entries.len() && entries[pos].key == child_sep,
                "path separator missing from its segment"
            );
            stack.push(Frame { seg, entries, pos });
        }

        Self {
            arena,
            lca_level: stack.len() - 1,
            stack,
        }
    }

    /// Data bucket the cursor currently points at.
    pub(crate) fn current(&self) -> DataId {
        let top = self.stack.last().expect("cursor exhausted");
        debug_assert!(self.arena.segment(top.seg).is_bottom());
        DataId::from_value(top.entries[top.pos].value)
    }

    /// true once the cursor has stepped past either end.
    #[inline]
    pub(crate) fn at_end(&self) -> bool {
        self.stack.is_empty()
    }

    /// true at the globally leftmost data bucket, which holds the anchor.
    pub(crate) fn at_begin(&self) -> bool {
        match self.stack.last() {
            None => true,
            Some(top) => top.entries[top.pos].key == KEY_MIN,
        }
    }

    /// Shallowest level the walk has popped to so far.
    #[inline]
    pub(crate) fn lca_level(&self) -> usize {
        self.lca_level
    }

    /// Advance to the next data bucket in key order; false when exhausted.
    pub(crate) fn next(&mut self) -> bool {
        if self.stack.is_empty() {
            return false;
        }
        self.stack.last_mut().expect("non-empty").pos += 1;

        // Pop exhausted levels until a sibling remains.
        while self
            .stack
            .last()
            .is_some_and(|top| top.pos >= top.entries.len())
        {
            self.stack.pop();
            match self.stack.last_mut() {
                None => return false,
                Some(top) => top.pos += 1,
            }
        }

        self.lca_level = self.lca_level.min(self.stack.len() - 1);
        self.descend_first();
        true
    }

    /// Step back to the previous data bucket; false at the leftmost one.
    pub(crate) fn prev(&mut self) -> bool {
        if self.at_begin() {
            return false;
        }

        while self.stack.last().is_some_and(|top| top.pos == 0) {
            self.stack.pop();
            if self.stack.is_empty() {
                return false;
            }
        }

        self.lca_level = self.lca_level.min(self.stack.len() - 1);
        self.stack.last_mut().expect("non-empty").pos -= 1;
        self.descend_last();
        true
    }

    fn descend_first(&mut self) {
        loop {
            let Some(top) = self.stack.last() else {
                return;
            };
            if self.arena.segment(top.seg).is_bottom() {
                return;
            }
            let child = SegId::from_value(top.entries[top.pos].value);
            let entries = self.arena.segment(child).sorted_entries();
            self.stack.push(Frame { seg: child, entries, pos: 0 });
        }
    }

    fn descend_last(&mut self) {
        loop {
            let Some(top) = self.stack.last() else {
                return;
            };
            if self.arena.segment(top.seg).is_bottom() {
                return;
            }
            let child = SegId::from_value(top.entries[top.pos].value);
            let entries = self.arena.segment(child).sorted_entries();
            let pos = entries.len() - 1;
            self.stack.push(Frame { seg: child, entries, pos });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Bucket;
    use crate::model::LinearModel;
    use crate::segment::Segment;

    /// Two bottom segments of two data buckets each under one root.
    fn two_level_tree(arena: &mut NodeArena) -> (SegId, [SegId; 2], [DataId; 4]) {
        let mut data_ids = Vec::new();
        for base in [0u64, 10, 20, 30] {
            let mut bucket = Bucket::with_capacity(4);
            assert!(bucket.insert(KeyValue::new(base, base), true, 0));
            assert!(bucket.insert(KeyValue::new(base + 1, base + 1), true, 0));
            data_ids.push(arena.alloc_data(bucket));
        }

        let mut seg_ids = Vec::new();
        for half in [0usize, 1] {
            let entries: Vec<KeyValue> = (0..2)
                .map(|i| {
                    let key = ((half * 2 + i) * 10) as Key;
                    KeyValue::new(key, data_ids[half * 2 + i].to_value())
                })
                .collect();
            let keys: Vec<Key> = entries.iter().map(|e| e.key).collect();
            let seg = Segment::build(&entries, 1.0, LinearModel::endpoints(&keys), true, 4);
            seg_ids.push(arena.alloc_segment(seg));
        }

        let root_entries = [
            KeyValue::new(0, seg_ids[0].to_value()),
            KeyValue::new(20, seg_ids[1].to_value()),
        ];
        let root = Segment::build(
            &root_entries,
            1.0,
            LinearModel::endpoints(&[0, 20]),
            false,
            4,
        );
        let root_id = arena.alloc_segment(root);

        (root_id, [seg_ids[0], seg_ids[1]], [
            data_ids[0],
            data_ids[1],
            data_ids[2],
            data_ids[3],
        ])
    }

    #[test]
    fn walks_forward_across_segments() {
        let mut arena = NodeArena::default();
        let (root, segs, data) = two_level_tree(&mut arena);

        let mut cursor = DataCursor::from_path(&arena, &[(root, 0), (segs[0], 0)]);
        assert!(cursor.at_begin());
        assert_eq!(data[0], cursor.current());

        let mut seen = vec![cursor.current()];
        while cursor.next() {
            seen.push(cursor.current());
        }
        assert_eq!(data.to_vec(), seen);
        assert!(cursor.at_end());
        assert!(!cursor.next());
    }

    #[test]
    fn walks_backward_and_stops_at_anchor() {
        let mut arena = NodeArena::default();
        let (root, segs, data) = two_level_tree(&mut arena);

        let mut cursor = DataCursor::from_path(&arena, &[(root, 20), (segs[1], 30)]);
        assert_eq!(data[3], cursor.current());

        assert!(cursor.prev());
        assert_eq!(data[2], cursor.current());
        assert!(cursor.prev());
        assert_eq!(data[1], cursor.current());
        assert!(cursor.prev());
        assert_eq!(data[0], cursor.current());

        // The leftmost bucket holds the anchor; the walk refuses to leave.
        assert!(cursor.at_begin());
        assert!(!cursor.prev());
    }

    #[test]
    fn lca_tracks_the_shallowest_pop() {
        let mut arena = NodeArena::default();
        let (root, segs, data) = two_level_tree(&mut arena);

        let mut cursor = DataCursor::from_path(&arena, &[(root, 0), (segs[0], 10)]);
        assert_eq!(data[1], cursor.current());
        assert_eq!(1, cursor.lca_level());

        // Crossing into the sibling segment pops through the root.
        assert!(cursor.next());
        assert_eq!(data[2], cursor.current());
        assert_eq!(0, cursor.lca_level());
    }

    #[test]
    fn sibling_step_keeps_leaf_lca() {
        let mut arena = NodeArena::default();
        let (root, segs, data) = two_level_tree(&mut arena);

        let mut cursor = DataCursor::from_path(&arena, &[(root, 0), (segs[0], 0)]);
        assert!(cursor.next());
        assert_eq!(data[1], cursor.current());
        assert_eq!(1, cursor.lca_level());
    }
}
