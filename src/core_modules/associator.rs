// THEORY:
// The `associator` solves the cheap half of the data association problem: for each
// freshly detected point, is there a tracked sequence whose last observation sits
// right next to it?
//
// Key architectural principles:
// 1.  **First Fit, Not Global Optimum**: Points are visited in detector order and
//     sequences in store order. The first sequence within the per-axis pixel-shift
//     window wins. Blinking markers on cooperating vehicles are sparse in the image,
//     so a greedy pass is both fast and good enough.
// 2.  **One-to-One per Frame**: A sequence that accepted a point is taken out of the
//     candidate set for the rest of the frame, and a point is appended to at most one
//     sequence.
// 3.  **Index-Stable Bookkeeping**: Claimed sequences are marked in a side vector
//     instead of being erased from the list being scanned; the leftovers are
//     collected once at the end.
// 4.  **Hand-Off**: Whatever is left over (points with no neighbour, sequences that
//     received nothing) is handed to the expanded search.

use crate::core_modules::point_state::{Point2, PointState};
use crate::core_modules::sequence_store::{SequenceId, SequenceStore};

/// Outcome of the nearest-neighbour pass over one frame.
#[derive(Debug, Clone, Default)]
pub struct Association {
    /// `(sequence, frame point index)` for every direct match.
    pub matched: Vec<(SequenceId, usize)>,
    /// Points that found no sequence, with their frame index, in frame order.
    pub unmatched: Vec<(usize, PointState)>,
    /// Sequences that received no point this frame, in store order.
    pub unclaimed: Vec<SequenceId>,
}

/// Matches `frame` against the last observation of every sequence and appends the
/// matched points to their sequences. The caller holds the store lock.
pub fn associate(
    store: &mut SequenceStore,
    frame: Vec<PointState>,
    max_shift: &Point2,
) -> Association {
    let candidates = store.ids();
    let mut claimed = vec![false; candidates.len()];
    let mut association = Association::default();

    for (point_index, point) in frame.into_iter().enumerate() {
        let hit = candidates.iter().enumerate().find_map(|(slot, id)| {
            if claimed[slot] {
                return None;
            }
            let last = store.get(*id)?.last()?;
            last.position
                .within_shift(&point.position, max_shift)
                .then_some(slot)
        });

        match hit {
            Some(slot) => {
                claimed[slot] = true;
                let id = candidates[slot];
                store.append(id, point);
                association.matched.push((id, point_index));
            }
            None => association.unmatched.push((point_index, point)),
        }
    }

    association.unclaimed = candidates
        .into_iter()
        .zip(claimed)
        .filter_map(|(id, taken)| (!taken).then_some(id))
        .collect();
    association
}
