//! Definition of the piecewise-linear segmentation passes.
//!
//! Bulk load and rebuilds both reduce a sorted key stream to pieces. The
//! dynamic pass drives a [`GreedyErrorCorridor`] and emits maximal pieces
//! whose model predicts every member key within the error bound; the fixed
//! pass chops the stream into constant-size runs for the data layer, where
//! bucket capacity rather than a model tolerance sets the boundary.

use crate::config::ModelKind;
use crate::corridor::GreedyErrorCorridor;
use crate::kv::Key;
use crate::model::LinearModel;

/// A contiguous piece of the segmented input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cut {
    /// Offset of the first sample within the input stream.
    pub(crate) start: usize,
    /// Number of samples covered.
    pub(crate) len: usize,
}

/// Segment a sorted key stream into maximal bounded pieces.
///
/// Each returned model predicts the rank of every key inside its piece to
/// within `error_bound` positions. An empty stream yields no pieces.
///
/// # Arguments
///
/// * `keys` - Sorted keys to segment.
/// * `error_bound` - Corridor tolerance in rank positions.
/// * `model` - Fit to run over each closed piece.
pub(crate) fn dynamic_segmentation(
    keys: impl IntoIterator<Item = Key>,
    error_bound: u64,
    model: ModelKind,
) -> Vec<(Cut, LinearModel)> {
    let mut keys = keys.into_iter();
    let Some(first) = keys.next() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut gec = GreedyErrorCorridor::new(first, error_bound);
    let mut start = 0usize;
    let mut piece = vec![first];

    for (idx, key) in keys.enumerate() {
        let idx = idx + 1;
        if gec.is_bounded(key) {
            piece.push(key);
            continue;
        }

        // Close the piece and re-anchor the corridor at the rejected key.
        out.push((Cut { start, len: piece.len() }, model.fit(&piece)));
        gec.restart(key);
        start = idx;
        piece.clear();
        piece.push(key);
    }
    out.push((Cut { start, len: piece.len() }, model.fit(&piece)));
    out
}

/// Chop `len` samples into runs of `chunk`; the last run may be short.
///
/// # Panics
///
/// Panics if `chunk` is zero.
pub(crate) fn fixed_segmentation(len: usize, chunk: usize) -> Vec<Cut> {
    assert!(chunk > 0, "fixed segmentation needs a positive run size");

    let mut out = Vec::with_capacity(len.div_ceil(chunk));
    let mut start = 0;
    while start < len {
        let run = chunk.min(len - start);
        out.push(Cut { start, len: run });
        start += run;
    }
    out
}
