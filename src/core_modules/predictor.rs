// THEORY:
// The `predictor` implements the expanded search: the second chance a tracked
// marker gets when the direct nearest-neighbour pass found nothing for it.
//
// A blinking marker that is moving fast, or that was off for a frame, can reappear
// further away than the plain pixel-shift window allows. Instead of giving up, the
// expanded search extrapolates the marker's recent trajectory a short step into the
// future and accepts a leftover detection that lands inside the predicted region.
//
// Key architectural principles & algorithm steps:
// 1.  **Skip Rule**: If the last two observations were both "on", the blink timing
//     says the LED should be off now, so no search is attempted.
// 2.  **Trajectory Model**: Per axis, the recent real detections are reduced to a
//     prediction. A wobbling marker (standard deviation under the threshold) is
//     predicted by its mean; a marker that really moves is fitted with a low-order
//     polynomial of time and extrapolated. With too few detections the mean is used
//     with the minimum search radius.
// 3.  **Containment**: The first leftover point inside the predicted region joins the
//     sequence. The canonical region is an axis-aligned ellipse; a triangle region
//     opening towards the prediction is available as an alternative.
// 4.  **Distrust Collapsed Fits**: A regression that came out as all-zero
//     coefficients predicts nothing. Its region is ignored and a coarse, widened
//     pixel-shift box around the last observation is used instead.
// 5.  **Continuity**: Every sequence still without a point receives a virtual "off"
//     observation, and every point still without a sequence starts a new one. After
//     this pass each live sequence has grown by exactly one observation.

use crate::core_modules::geometry::{
    inside_ellipse, inside_triangle, mean, orthogonal_vectors, polyfit, sample_std_dev,
};
use crate::core_modules::point_state::{Point2, PointState, PredictionMeta, SearchRegion};
use crate::core_modules::sequence_store::{Sequence, SequenceId, SequenceStore};
use serde::{Deserialize, Serialize};

/// Tuning of the expanded search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Seconds added to the frame stamp when evaluating the trajectory model.
    pub prediction_margin: f64,
    /// Order of the per-axis polynomial.
    pub poly_order: usize,
    /// Minimum number of real detections required to run the regression.
    pub min_regression_points: usize,
    /// Number of most recent real detections the model is built from.
    pub regression_window: usize,
    /// Per-axis standard deviation (px) above which the polynomial model is used.
    pub std_threshold: f64,
    /// Floor of the search-region half-extent (px).
    pub min_radius: f64,
    /// Multiplier turning a standard deviation into a search radius.
    pub std_scale: f64,
    /// Multiplier turning a regression RMS residual into a search radius.
    pub residual_scale: f64,
    /// Extra pixels added to the pixel-shift window for the coarse fallback box.
    pub coarse_margin: f64,
    /// Region shape used for containment.
    pub region: SearchRegion,
}

impl SearchConfig {
    pub const DEFAULT_PREDICTION_MARGIN: f64 = 0.0;
    pub const DEFAULT_POLY_ORDER: usize = 2;
    pub const DEFAULT_MIN_REGRESSION_POINTS: usize = 5;
    pub const DEFAULT_REGRESSION_WINDOW: usize = 10;
    pub const DEFAULT_STD_THRESHOLD: f64 = 2.0;
    pub const DEFAULT_MIN_RADIUS: f64 = 2.0;
    pub const DEFAULT_STD_SCALE: f64 = 2.0;
    pub const DEFAULT_RESIDUAL_SCALE: f64 = 3.0;
    pub const DEFAULT_COARSE_MARGIN: f64 = 4.0;
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            prediction_margin: Self::DEFAULT_PREDICTION_MARGIN,
            poly_order: Self::DEFAULT_POLY_ORDER,
            min_regression_points: Self::DEFAULT_MIN_REGRESSION_POINTS,
            regression_window: Self::DEFAULT_REGRESSION_WINDOW,
            std_threshold: Self::DEFAULT_STD_THRESHOLD,
            min_radius: Self::DEFAULT_MIN_RADIUS,
            std_scale: Self::DEFAULT_STD_SCALE,
            residual_scale: Self::DEFAULT_RESIDUAL_SCALE,
            coarse_margin: Self::DEFAULT_COARSE_MARGIN,
            region: SearchRegion::Ellipse,
        }
    }
}

/// What the expanded search did with the leftovers of a frame.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// `(sequence, frame point index)` for every prediction-based match.
    pub predicted: Vec<(SequenceId, usize)>,
    /// Sequences that received a virtual observation.
    pub virtual_inserted: Vec<SequenceId>,
    /// `(new sequence, frame point index)` for every point that started a sequence.
    pub spawned: Vec<(SequenceId, usize)>,
}

/// Per-axis piece of a prediction.
struct AxisPrediction {
    value: f64,
    coeffs: Vec<f64>,
    radius: f64,
    valid: bool,
}

/// The expanded search engine. Stateless between frames.
pub struct ExpandedSearch {
    config: SearchConfig,
    max_shift: Point2,
}

impl ExpandedSearch {
    pub fn new(config: SearchConfig, max_shift: Point2) -> Self {
        Self { config, max_shift }
    }

    /// Reconciles the points the associator could not place with the sequences that
    /// received nothing. The caller holds the store lock.
    pub fn run(
        &self,
        store: &mut SequenceStore,
        unmatched: Vec<(usize, PointState)>,
        unclaimed: Vec<SequenceId>,
        frame_stamp: f64,
    ) -> SearchOutcome {
        let mut outcome = SearchOutcome::default();
        // Taken slots become `None`, so indices stay valid for the whole pass.
        let mut leftovers: Vec<Option<(usize, PointState)>> =
            unmatched.into_iter().map(Some).collect();
        let mut unreconciled = Vec::new();
        let at = frame_stamp + self.config.prediction_margin;

        // --- 1. Prediction & Containment ---
        for id in unclaimed {
            let hit = if leftovers.iter().any(Option::is_some) {
                self.reconcile(store, id, &mut leftovers, at)
            } else {
                None
            };
            match hit {
                Some(point_index) => outcome.predicted.push((id, point_index)),
                None => unreconciled.push(id),
            }
        }

        // --- 2. Virtual Insertion ---
        for id in unreconciled {
            if store.push_virtual(id, frame_stamp) {
                outcome.virtual_inserted.push(id);
            }
        }

        // --- 3. Birth ---
        for (point_index, point) in leftovers.into_iter().flatten() {
            let id = store.insert_new(point);
            outcome.spawned.push((id, point_index));
        }

        outcome
    }

    fn reconcile(
        &self,
        store: &mut SequenceStore,
        id: SequenceId,
        leftovers: &mut [Option<(usize, PointState)>],
        at: f64,
    ) -> Option<usize> {
        let (meta, anchor) = {
            let seq = store.get(id)?;
            if seq.last_two_on() {
                return None;
            }
            (self.predict(seq, at)?, seq.last()?.position)
        };
        store.annotate_last(id, meta.clone());
        // The accepted point carries whatever the last observation holds, which is
        // the fresh prediction unless an earlier pass already annotated it.
        let seed = store
            .get(id)
            .and_then(Sequence::last)
            .and_then(PointState::prediction)
            .cloned()
            .unwrap_or_else(|| meta.clone());

        let slot = leftovers.iter().position(|candidate| {
            candidate
                .as_ref()
                .is_some_and(|(_, p)| self.accepts(&meta, &anchor, &p.position))
        })?;
        let (point_index, mut point) = leftovers[slot].take()?;

        tracing::trace!(
            "expanded search: {} takes ({:.1}, {:.1}), predicted ({:.1}, {:.1}), valid={}",
            id,
            point.position.x,
            point.position.y,
            meta.predicted.x,
            meta.predicted.y,
            meta.valid
        );
        point.annotate(seed);
        store.append(id, point);
        Some(point_index)
    }

    /// Builds the prediction for `seq` at absolute time `at`.
    pub fn predict(&self, seq: &Sequence, at: f64) -> Option<PredictionMeta> {
        let last = seq.last()?;
        let detections = seq.recent_detections(self.config.regression_window);

        if detections.len() < self.config.min_regression_points.max(1) {
            let predicted = if detections.is_empty() {
                last.position
            } else {
                let xs: Vec<f64> = detections.iter().map(|p| p.position.x).collect();
                let ys: Vec<f64> = detections.iter().map(|p| p.position.y).collect();
                Point2::new(mean(&xs), mean(&ys))
            };
            return Some(PredictionMeta {
                predicted,
                x_coeffs: Vec::new(),
                y_coeffs: Vec::new(),
                time_origin: at,
                radii: Point2::new(self.config.min_radius, self.config.min_radius),
                region: self.config.region,
                valid: true,
            });
        }

        let times: Vec<f64> = detections.iter().map(|p| p.stamp).collect();
        let xs: Vec<f64> = detections.iter().map(|p| p.position.x).collect();
        let ys: Vec<f64> = detections.iter().map(|p| p.position.y).collect();

        let x = self.predict_axis(&times, &xs, at);
        let y = self.predict_axis(&times, &ys, at);

        Some(PredictionMeta {
            predicted: Point2::new(x.value, y.value),
            x_coeffs: x.coeffs,
            y_coeffs: y.coeffs,
            time_origin: times[0],
            radii: Point2::new(x.radius, y.radius),
            region: self.config.region,
            valid: x.valid && y.valid,
        })
    }

    fn predict_axis(&self, times: &[f64], values: &[f64], at: f64) -> AxisPrediction {
        let spread = sample_std_dev(values);
        if spread <= self.config.std_threshold {
            return AxisPrediction {
                value: mean(values),
                coeffs: Vec::new(),
                radius: (spread * self.config.std_scale).max(self.config.min_radius),
                valid: true,
            };
        }

        let fit = polyfit(times, values, self.config.poly_order);
        if !fit.is_valid() {
            return AxisPrediction {
                value: values.last().copied().unwrap_or_default(),
                coeffs: fit.coeffs,
                radius: self.config.min_radius,
                valid: false,
            };
        }
        AxisPrediction {
            value: fit.evaluate(at),
            radius: (fit.rms_residual * self.config.residual_scale).max(self.config.min_radius),
            coeffs: fit.coeffs,
            valid: true,
        }
    }

    /// Containment test of `candidate` against the prediction anchored at the
    /// sequence's last observation.
    pub fn accepts(&self, meta: &PredictionMeta, anchor: &Point2, candidate: &Point2) -> bool {
        let coarse_limit = Point2::new(
            self.max_shift.x + self.config.coarse_margin,
            self.max_shift.y + self.config.coarse_margin,
        );
        let coarse_hit = || anchor.within_shift(candidate, &coarse_limit);

        if !meta.valid {
            return coarse_hit();
        }
        match meta.region {
            SearchRegion::Ellipse => inside_ellipse(&meta.predicted, &meta.radii, candidate),
            SearchRegion::Triangle => {
                let [a, b, c] = prediction_triangle(anchor, &meta.predicted);
                inside_triangle(&a, &b, &c, candidate) || coarse_hit()
            }
        }
    }
}

/// Triangle with its apex at `anchor`, opening towards the rounded prediction.
/// Short displacements are stretched so the region never collapses onto the apex,
/// long ones are shortened.
pub fn prediction_triangle(anchor: &Point2, predicted: &Point2) -> [Point2; 3] {
    let mut direction = predicted.round().sub(anchor);
    let len = direction.norm();
    if len < 2.0 {
        direction = direction.scale(4.0);
    } else if len < 6.0 {
        direction = direction.scale(2.0);
    }

    let mut len = direction.norm();
    if len > 20.0 {
        len = len * 2.0 / 3.0;
    }

    let [left, right] = orthogonal_vectors(&direction, len);
    [
        *anchor,
        anchor.add(&direction).add(&left),
        anchor.add(&direction).add(&right),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SHIFT: Point2 = Point2::new(3.0, 3.0);

    fn engine() -> ExpandedSearch {
        ExpandedSearch::new(SearchConfig::default(), SHIFT)
    }

    /// Five detections moving 2 px/frame, each followed by a virtual frame.
    fn moving_sequence(store: &mut SequenceStore) -> SequenceId {
        let id = store.insert_new(PointState::detected(Point2::new(92.0, 108.0), 0.0));
        for k in 1..5 {
            let t = k as f64;
            store.append(id, PointState::detected(Point2::new(92.0 + 2.0 * t, 108.0 - 2.0 * t), t));
        }
        store.push_virtual(id, 5.0);
        id
    }

    fn leftover(x: f64, y: f64, t: f64) -> Vec<(usize, PointState)> {
        vec![(0, PointState::detected(Point2::new(x, y), t))]
    }

    #[test]
    fn regression_extrapolates_a_moving_marker() {
        let mut store = SequenceStore::new(30);
        let id = moving_sequence(&mut store);
        let meta = engine().predict(store.get(id).expect("seq"), 6.0).expect("prediction");
        assert!(meta.valid);
        assert_relative_eq!(meta.predicted.x, 104.0, epsilon = 1e-6);
        assert_relative_eq!(meta.predicted.y, 96.0, epsilon = 1e-6);
        assert_relative_eq!(meta.radii.x, SearchConfig::DEFAULT_MIN_RADIUS, epsilon = 1e-6);
        assert_eq!(meta.x_coeffs.len(), 3);
    }

    #[test]
    fn point_inside_the_ellipse_joins_the_sequence() {
        let mut store = SequenceStore::new(30);
        let id = moving_sequence(&mut store);
        let out = engine().run(&mut store, leftover(104.5, 96.5, 6.0), vec![id], 6.0);
        assert_eq!(out.predicted, vec![(id, 0)]);
        assert!(out.virtual_inserted.is_empty());
        assert!(out.spawned.is_empty());

        let seq = store.get(id).expect("seq");
        let last = seq.last().expect("last");
        assert!(last.led_on);
        assert_eq!(last.position, Point2::new(104.5, 96.5));
        assert!(last.has_prediction());
        assert!(seq.nth_from_end(1).is_some_and(PointState::has_prediction));
    }

    #[test]
    fn accepted_point_inherits_the_recorded_prediction() {
        let mut store = SequenceStore::new(30);
        let id = moving_sequence(&mut store);
        let mut recorded = engine().predict(store.get(id).expect("seq"), 6.0).expect("prediction");
        recorded.time_origin = -1.0;
        assert!(store.annotate_last(id, recorded.clone()));

        let out = engine().run(&mut store, leftover(104.5, 96.5, 6.0), vec![id], 6.0);
        assert_eq!(out.predicted, vec![(id, 0)]);
        let seq = store.get(id).expect("seq");
        assert_eq!(seq.last().and_then(PointState::prediction), Some(&recorded));
        assert_eq!(seq.nth_from_end(1).and_then(PointState::prediction), Some(&recorded));
    }

    #[test]
    fn point_outside_the_ellipse_starts_a_new_sequence() {
        let mut store = SequenceStore::new(30);
        let id = moving_sequence(&mut store);
        let out = engine().run(&mut store, leftover(110.0, 90.0, 6.0), vec![id], 6.0);
        assert!(out.predicted.is_empty());
        assert_eq!(out.virtual_inserted, vec![id]);
        assert_eq!(out.spawned.len(), 1);
        assert_eq!(store.len(), 2);
        assert!(store.get(id).and_then(Sequence::last).is_some_and(|p| !p.led_on));
    }

    #[test]
    fn two_consecutive_detections_skip_the_search() {
        let mut store = SequenceStore::new(30);
        let id = store.insert_new(PointState::detected(Point2::new(10.0, 10.0), 0.0));
        store.append(id, PointState::detected(Point2::new(10.0, 10.0), 1.0));
        // Within the ellipse around the mean, but the sequence is not searched.
        let out = engine().run(&mut store, leftover(11.0, 10.0, 2.0), vec![id], 2.0);
        assert!(out.predicted.is_empty());
        assert_eq!(out.virtual_inserted, vec![id]);
        assert_eq!(out.spawned.len(), 1);
    }

    #[test]
    fn few_detections_fall_back_to_the_mean() {
        let mut store = SequenceStore::new(30);
        let id = store.insert_new(PointState::detected(Point2::new(10.0, 20.0), 0.0));
        store.push_virtual(id, 1.0);
        store.append(id, PointState::detected(Point2::new(12.0, 22.0), 2.0));
        store.push_virtual(id, 3.0);
        let meta = engine().predict(store.get(id).expect("seq"), 4.0).expect("prediction");
        assert_eq!(meta.predicted, Point2::new(11.0, 21.0));
        assert_eq!(meta.radii, Point2::new(2.0, 2.0));
        assert!(meta.x_coeffs.is_empty());
    }

    #[test]
    fn collapsed_fit_uses_the_coarse_box() {
        let mut store = SequenceStore::new(30);
        // A marker swinging far from the origin and back to exactly zero gives a
        // spread above the threshold; repeated timestamps collapse the fit to zeros.
        let id = store.insert_new(PointState::detected(Point2::new(0.0, 0.0), 1.0));
        for x in [10.0, 0.0, 10.0, 0.0] {
            store.append(id, PointState::detected(Point2::new(x, 0.0), 1.0));
        }
        store.push_virtual(id, 1.0);
        let search = engine();
        let meta = search.predict(store.get(id).expect("seq"), 2.0).expect("prediction");
        assert!(!meta.valid);

        // Anchor is the last observation at (0, 0); the coarse box reaches 3 + 4 px.
        assert!(search.accepts(&meta, &Point2::ZERO, &Point2::new(6.5, 0.0)));
        assert!(!search.accepts(&meta, &Point2::ZERO, &Point2::new(7.5, 0.0)));
    }

    #[test]
    fn first_accepted_point_wins_and_leaves_the_rest() {
        let mut store = SequenceStore::new(30);
        let id = moving_sequence(&mut store);
        let points = vec![
            (0, PointState::detected(Point2::new(300.0, 300.0), 6.0)),
            (1, PointState::detected(Point2::new(104.0, 96.0), 6.0)),
            (2, PointState::detected(Point2::new(104.2, 96.2), 6.0)),
        ];
        let out = engine().run(&mut store, points, vec![id], 6.0);
        assert_eq!(out.predicted, vec![(id, 1)]);
        let spawned: Vec<usize> = out.spawned.iter().map(|(_, i)| *i).collect();
        assert_eq!(spawned, vec![0, 2]);
    }

    #[test]
    fn triangle_region_opens_towards_the_prediction() {
        let anchor = Point2::new(100.0, 100.0);
        let [a, b, c] = prediction_triangle(&anchor, &Point2::new(110.0, 100.0));
        assert_eq!(a, anchor);
        assert!(inside_triangle(&a, &b, &c, &Point2::new(110.0, 100.0)));
        assert!(inside_triangle(&a, &b, &c, &Point2::new(108.0, 104.0)));
        assert!(!inside_triangle(&a, &b, &c, &Point2::new(90.0, 100.0)));
    }

    #[test]
    fn triangle_variant_also_accepts_coarse_hits() {
        let config = SearchConfig {
            region: SearchRegion::Triangle,
            ..SearchConfig::default()
        };
        let search = ExpandedSearch::new(config, SHIFT);
        let meta = PredictionMeta {
            predicted: Point2::new(120.0, 100.0),
            x_coeffs: vec![1.0],
            y_coeffs: vec![1.0],
            time_origin: 0.0,
            radii: Point2::new(2.0, 2.0),
            region: SearchRegion::Triangle,
            valid: true,
        };
        let anchor = Point2::new(100.0, 100.0);
        assert!(search.accepts(&meta, &anchor, &Point2::new(115.0, 101.0)));
        assert!(search.accepts(&meta, &anchor, &Point2::new(95.0, 100.0)));
        assert!(!search.accepts(&meta, &anchor, &Point2::new(80.0, 100.0)));
    }
}
