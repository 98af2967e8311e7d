//! Definition of the arena that owns every node of the index.
//!
//! Child pointers in segment buckets travel through the value field of a
//! [`KeyValue`](crate::kv::KeyValue) as raw handles. The arena resolves a
//! handle to the node it owns; whether a handle names a segment or a data
//! bucket is decided by the level it was read from, never per slot. Nodes
//! replaced during a structural modification stay allocated until the
//! operation retires them, so a reader that entered earlier never observes
//! a freed node.

use crate::bucket::Bucket;
use crate::kv::Value;
use crate::segment::Segment;

/// Owning handle of a segment stored in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegId(u64);

/// Owning handle of a data bucket stored in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataId(u64);

impl SegId {
    #[inline]
    pub(crate) fn from_value(value: Value) -> Self {
        Self(value)
    }

    #[inline]
    pub(crate) fn to_value(self) -> Value {
        self.0
    }
}

impl DataId {
    #[inline]
    pub(crate) fn from_value(value: Value) -> Self {
        Self(value)
    }

    #[inline]
    pub(crate) fn to_value(self) -> Value {
        self.0
    }
}

/// Slot-reusing storage for one node type.
#[derive(Debug)]
struct Slab<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
}

// A derived impl would demand T: Default.
impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Slab<T> {
    fn insert(&mut self, node: T) -> usize {
        match self.free.pop() {
            Some(slot) => {
                debug_assert!(self.entries[slot].is_none());
                self.entries[slot] = Some(node);
                slot
            }
            None => {
                self.entries.push(Some(node));
                self.entries.len() - 1
            }
        }
    }

    fn remove(&mut self, slot: usize) -> T {
        let node = self.entries[slot].take().expect("node already freed");
        self.free.push(slot);
        node
    }

    fn get(&self, slot: usize) -> &T {
        self.entries[slot].as_ref().expect("stale node handle")
    }

    fn get_mut(&mut self, slot: usize) -> &mut T {
        self.entries[slot].as_mut().expect("stale node handle")
    }

    fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().filter_map(|e| e.as_ref())
    }
}

/// Storage owning all segments and data buckets reachable from the index.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    segments: Slab<Segment>,
    data: Slab<Bucket>,
}

impl NodeArena {
    pub(crate) fn alloc_segment(&mut self, segment: Segment) -> SegId {
        SegId(self.segments.insert(segment) as u64)
    }

    pub(crate) fn alloc_data(&mut self, bucket: Bucket) -> DataId {
        DataId(self.data.insert(bucket) as u64)
    }

    #[inline]
    pub(crate) fn segment(&self, id: SegId) -> &Segment {
        self.segments.get(id.0 as usize)
    }

    #[inline]
    pub(crate) fn segment_mut(&mut self, id: SegId) -> &mut Segment {
        self.segments.get_mut(id.0 as usize)
    }

    #[inline]
    pub(crate) fn data(&self, id: DataId) -> &Bucket {
        self.data.get(id.0 as usize)
    }

    #[inline]
    pub(crate) fn data_mut(&mut self, id: DataId) -> &mut Bucket {
        self.data.get_mut(id.0 as usize)
    }

    pub(crate) fn free_segment(&mut self, id: SegId) {
        self.segments.remove(id.0 as usize);
    }

    pub(crate) fn free_data(&mut self, id: DataId) {
        self.data.remove(id.0 as usize);
    }

    pub(crate) fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn num_data_buckets(&self) -> usize {
        self.data.len()
    }

    /// Heap footprint of every live node plus the arena bookkeeping.
    pub(crate) fn mem_size(&self) -> usize {
        self.segments.iter().map(Segment::mem_size).sum::<usize>()
            + self.data.iter().map(Bucket::mem_size).sum::<usize>()
    }
}
