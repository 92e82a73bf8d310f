// THEORY:
// The `sequence_store` module gives the tracker its memory. A `Sequence` is the
// time-ordered history of observations believed to come from one physical blinking
// marker; the `SequenceStore` owns every live sequence and their whole lifecycle.
//
// Key architectural principles:
// 1.  **Bounded Rings**: A sequence only needs a few code lengths of history to be
//     decoded, so it is a ring with a fixed capacity. Appending to a full ring drops
//     the oldest observation.
// 2.  **Stable Handles**: Other components refer to sequences through `SequenceId`
//     keys that are resolved through the store on every access. Growing or shrinking
//     the store can never leave a dangling handle; a stale id simply resolves to
//     nothing.
// 3.  **Lifecycle**:
//     - **Birth**: a point that matched nothing starts a one-element sequence.
//     - **Growth**: every live sequence receives exactly one append per frame, real
//       or virtual.
//     - **Death**: a sequence whose last three observations are all virtual is
//       evicted by the per-frame sweep.
// 4.  **Single Owner**: The store is plain data. Sharing between the frame producer
//     and the result consumer is done by wrapping it in one mutex at the pipeline
//     level; nothing in here locks.

use crate::core_modules::point_state::{PointState, PredictionMeta};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Number of trailing virtual observations after which a sequence is evicted.
pub const SILENT_RUN_FOR_EVICTION: usize = 3;

/// Opaque handle of a tracked sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct SequenceId(u64);

impl SequenceId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq#{}", self.0)
    }
}

/// Time-ordered, bounded history of observations of one marker.
#[derive(Debug, Clone)]
pub struct Sequence {
    points: VecDeque<PointState>,
    capacity: usize,
}

impl Sequence {
    fn new(first: PointState, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        // Grows on demand; the ring bound is enforced by `push`.
        let mut points = VecDeque::new();
        points.push_back(first);
        Self { points, capacity }
    }

    fn push(&mut self, point: PointState) {
        self.points.push_back(point);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false for a sequence obtained from the store.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&PointState> {
        self.points.back()
    }

    /// The observation `n` steps before the last one (`0` is the last).
    pub fn nth_from_end(&self, n: usize) -> Option<&PointState> {
        self.points.len().checked_sub(n + 1).and_then(|i| self.points.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PointState> {
        self.points.iter()
    }

    /// True when the last `n` observations exist and are all virtual.
    pub fn ends_with_silent_run(&self, n: usize) -> bool {
        n > 0 && self.points.len() >= n && self.points.iter().rev().take(n).all(|p| !p.led_on)
    }

    /// True when the two most recent observations are both real detections.
    pub fn last_two_on(&self) -> bool {
        matches!(
            (self.nth_from_end(0), self.nth_from_end(1)),
            (Some(a), Some(b)) if a.led_on && b.led_on
        )
    }

    /// LED states of the trailing `window` observations, oldest first.
    pub fn tail_bits(&self, window: usize) -> Vec<bool> {
        let skip = self.points.len().saturating_sub(window);
        self.points.iter().skip(skip).map(|p| p.led_on).collect()
    }

    /// The most recent `window` real detections, oldest first.
    pub fn recent_detections(&self, window: usize) -> Vec<&PointState> {
        let mut real: Vec<&PointState> = self
            .points
            .iter()
            .rev()
            .filter(|p| p.led_on)
            .take(window)
            .collect();
        real.reverse();
        real
    }

    /// Time of the most recent real detection.
    pub fn last_detection_stamp(&self) -> Option<f64> {
        self.points.iter().rev().find(|p| p.led_on).map(|p| p.stamp)
    }
}

/// Copy of the parts of a sequence the decoder needs, taken under the store lock.
#[derive(Debug, Clone)]
pub struct SequenceSnapshot {
    pub id: SequenceId,
    pub last: PointState,
    pub bits: Vec<bool>,
}

/// Owner of all live sequences for one camera stream.
#[derive(Debug, Clone)]
pub struct SequenceStore {
    sequences: BTreeMap<SequenceId, Sequence>,
    next_id: u64,
    capacity: usize,
}

impl SequenceStore {
    /// Creates an empty store whose sequences keep at most `capacity` observations.
    pub fn new(capacity: usize) -> Self {
        Self {
            sequences: BTreeMap::new(),
            next_id: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn get(&self, id: SequenceId) -> Option<&Sequence> {
        self.sequences.get(&id)
    }

    /// Ids of all live sequences in creation order.
    pub fn ids(&self) -> Vec<SequenceId> {
        self.sequences.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SequenceId, &Sequence)> {
        self.sequences.iter().map(|(id, seq)| (*id, seq))
    }

    /// Starts a new sequence with a single observation.
    pub fn insert_new(&mut self, first: PointState) -> SequenceId {
        let id = SequenceId(self.next_id);
        self.next_id += 1;
        self.sequences.insert(id, Sequence::new(first, self.capacity));
        id
    }

    /// Appends an observation, dropping the oldest one on overflow. Returns `false`
    /// if the id no longer resolves.
    pub fn append(&mut self, id: SequenceId, point: PointState) -> bool {
        match self.sequences.get_mut(&id) {
            Some(seq) => {
                seq.push(point);
                true
            }
            None => false,
        }
    }

    /// Appends a virtual observation at the sequence's last position.
    pub fn push_virtual(&mut self, id: SequenceId, stamp: f64) -> bool {
        let Some(seq) = self.sequences.get_mut(&id) else {
            return false;
        };
        let Some(position) = seq.last().map(|p| p.position) else {
            return false;
        };
        seq.push(PointState::virtual_at(position, stamp));
        true
    }

    /// Writes prediction metadata onto the last observation of a sequence if none
    /// was recorded yet.
    pub fn annotate_last(&mut self, id: SequenceId, meta: PredictionMeta) -> bool {
        self.sequences
            .get_mut(&id)
            .and_then(|seq| seq.points.back_mut())
            .map(|last| last.annotate(meta))
            .unwrap_or(false)
    }

    /// Removes every sequence whose last `run` observations are all virtual.
    /// Sequences shorter than `run` are kept.
    pub fn evict_silent(&mut self, run: usize) -> Vec<SequenceId> {
        let doomed: Vec<SequenceId> = self
            .sequences
            .iter()
            .filter(|(_, seq)| seq.ends_with_silent_run(run))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.sequences.remove(id);
        }
        doomed
    }

    /// Sequences whose most recent real detection is older than `cutoff`.
    pub fn stale_since(&self, cutoff: f64) -> Vec<SequenceId> {
        self.sequences
            .iter()
            .filter(|(_, seq)| seq.last_detection_stamp().is_none_or(|t| t < cutoff))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Copies the last observation and the trailing `window` LED states of every
    /// live sequence.
    pub fn snapshot(&self, window: usize) -> Vec<SequenceSnapshot> {
        self.sequences
            .iter()
            .filter_map(|(id, seq)| {
                seq.last().map(|last| SequenceSnapshot {
                    id: *id,
                    last: last.clone(),
                    bits: seq.tail_bits(window),
                })
            })
            .collect()
    }
}
