// THEORY:
// The `tracker` module is the heart of the engine. It adds "object permanence" to a
// stream of anonymous point detections: every frame, it decides which tracked
// sequence each detection belongs to, and it keeps sequences alive through the dark
// phases of their blink pattern.
//
// This module solves the "data association problem" for blinking lights.
//
// Key architectural principles:
// 1.  **Layered Association**: A frame is reconciled in stages, cheapest first:
//     - the `associator` extends sequences whose last observation is right next to
//       a detection;
//     - the `predictor` extrapolates the remaining sequences and looks for the
//       remaining detections inside the predicted regions, inserts virtual "off"
//       observations for sequences that found nothing, and starts new sequences.
// 2.  **Lifecycle Management**:
//     - **Birth**: a detection that matches nothing starts a new sequence.
//     - **Tracking**: one observation per live sequence per frame, real or virtual.
//     - **Death**: three virtual observations in a row mean the light is gone.
// 3.  **One Pass, One Borrow**: The whole pass works on a single `&mut SequenceStore`.
//     The pipeline takes the lock once per frame and hands the store in.
// 4.  **Conservation**: Every detection of the frame ends up in exactly one place:
//     a direct match, a predicted match, or a new sequence.

use crate::core_modules::associator::associate;
use crate::core_modules::point_state::{Frame, Point2};
use crate::core_modules::predictor::{ExpandedSearch, SearchConfig};
use crate::core_modules::sequence_store::{SequenceId, SequenceStore, SILENT_RUN_FOR_EVICTION};
use serde::Serialize;

/// Bookkeeping of one tracker pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameSummary {
    /// Detections appended through the nearest-neighbour pass.
    pub direct_matches: usize,
    /// Detections appended through the expanded search.
    pub predicted_matches: usize,
    /// Sequences that received a virtual "off" observation.
    pub virtual_inserted: usize,
    /// Detections that started a new sequence.
    pub new_sequences: usize,
    /// Sequences removed by the end-of-frame sweep.
    pub evicted: usize,
    /// Sequences alive after the pass.
    pub live_sequences: usize,
    /// Live sequences without a real detection inside the framerate margin. Filled
    /// in by the pipeline; informational only.
    pub stale_sequences: usize,
}

impl FrameSummary {
    /// Number of detections this pass placed somewhere.
    pub fn placed_points(&self) -> usize {
        self.direct_matches + self.predicted_matches + self.new_sequences
    }
}

/// The per-frame tracking engine. Holds configuration only; all state lives in the
/// `SequenceStore` handed to [`BlinkTracker::process`].
pub struct BlinkTracker {
    max_shift: Point2,
    search: ExpandedSearch,
}

impl BlinkTracker {
    pub fn new(max_shift: Point2, search: SearchConfig) -> Self {
        Self {
            max_shift,
            search: ExpandedSearch::new(search, max_shift),
        }
    }

    /// Runs one full pass for `frame`. The caller holds the store for the whole
    /// call, so producers and consumers never see a half-updated store.
    pub fn process(&self, store: &mut SequenceStore, frame: &Frame) -> FrameSummary {
        // --- 1. Direct association ---
        let association = associate(store, frame.observations(), &self.max_shift);

        // --- 2. Expanded search, virtual insertion and birth ---
        let outcome = self
            .search
            .run(store, association.unmatched, association.unclaimed, frame.stamp);

        // --- 3. Death ---
        let evicted = store.evict_silent(SILENT_RUN_FOR_EVICTION);
        for id in &evicted {
            tracing::trace!("{} evicted after {} silent frames", id, SILENT_RUN_FOR_EVICTION);
        }

        let summary = FrameSummary {
            direct_matches: association.matched.len(),
            predicted_matches: outcome.predicted.len(),
            virtual_inserted: outcome.virtual_inserted.len(),
            new_sequences: outcome.spawned.len(),
            evicted: evicted.len(),
            live_sequences: store.len(),
            stale_sequences: 0,
        };
        tracing::debug!(
            "frame t={:.4}: {} points, {} direct, {} predicted, {} new, \
             {} virtual, {} evicted, {} live",
            frame.stamp,
            frame.points.len(),
            summary.direct_matches,
            summary.predicted_matches,
            summary.new_sequences,
            summary.virtual_inserted,
            summary.evicted,
            summary.live_sequences
        );
        summary
    }

    /// Ids of sequences whose latest real detection is older than `margin` seconds
    /// before `now`.
    pub fn stale_sequences(&self, store: &SequenceStore, now: f64, margin: f64) -> Vec<SequenceId> {
        store.stale_since(now - margin)
    }
}
