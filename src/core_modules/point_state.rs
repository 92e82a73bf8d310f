// THEORY:
// The `point_state` module holds the smallest unit of the tracking layer: a single
// observation of a blinking marker at one moment in time. Everything above it
// (sequences, the associator, the expanded search, the decoder) is built out of
// ordered lists of these observations.
//
// Key architectural principles:
// 1.  **Two Kinds of Observation**: A `PointState` is either a real detection handed
//     over by the blob detector (`led_on = true`) or a *virtual* placeholder that the
//     tracker inserts when a tracked marker produced no detection this frame
//     (`led_on = false`). Virtual points keep the sequence aligned with the frame
//     clock, which is what makes the on/off history decodable.
// 2.  **Write-Once Prediction Metadata**: The expanded search annotates observations
//     with the prediction it computed (polynomial coefficients, predicted position,
//     search-region extents). That metadata is written at most once; the coordinate,
//     LED state and timestamp never change after construction.
// 3.  **Dumb Data Container**: Like the rest of the leaf types, a `PointState` knows
//     nothing about its neighbours. Comparisons and statistics live in `geometry`.

use serde::{Deserialize, Serialize};

/// A 2D pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const ZERO: Point2 = Point2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Per-axis absolute difference between two points.
    pub fn abs_diff(&self, other: &Point2) -> Point2 {
        Point2::new((self.x - other.x).abs(), (self.y - other.y).abs())
    }

    pub fn add(&self, other: &Point2) -> Point2 {
        Point2::new(self.x + other.x, self.y + other.y)
    }

    pub fn sub(&self, other: &Point2) -> Point2 {
        Point2::new(self.x - other.x, self.y - other.y)
    }

    pub fn scale(&self, factor: f64) -> Point2 {
        Point2::new(self.x * factor, self.y * factor)
    }

    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn round(&self) -> Point2 {
        Point2::new(self.x.round(), self.y.round())
    }

    /// True when both per-axis differences to `other` are within `limit`.
    pub fn within_shift(&self, other: &Point2, limit: &Point2) -> bool {
        let diff = self.abs_diff(other);
        diff.x <= limit.x && diff.y <= limit.y
    }
}

/// Which region shape the expanded search used to accept or reject candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchRegion {
    /// Axis-aligned ellipse around the predicted position.
    #[default]
    Ellipse,
    /// Triangle opening from the last observation towards the prediction.
    Triangle,
}

/// Prediction computed by the expanded search for a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionMeta {
    /// Position the sequence is expected to show up at.
    pub predicted: Point2,
    /// Polynomial coefficients of x(t - time_origin), lowest order first. Empty when
    /// the axis was predicted by its mean.
    pub x_coeffs: Vec<f64>,
    /// Polynomial coefficients of y(t - time_origin), lowest order first.
    pub y_coeffs: Vec<f64>,
    /// Time shift applied to the regression samples.
    pub time_origin: f64,
    /// Half-extent of the search region along each axis.
    pub radii: Point2,
    /// Region shape the prediction was tested with.
    pub region: SearchRegion,
    /// False when a regression collapsed to all-zero coefficients and the region
    /// must not be trusted.
    pub valid: bool,
}

/// One observation of a (possibly virtual) blinking marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointState {
    /// Pixel coordinate of the observation.
    pub position: Point2,
    /// `true` for a real detection, `false` for a virtual "off" placeholder.
    pub led_on: bool,
    /// Capture time in seconds.
    pub stamp: f64,
    /// Prediction attached by the expanded search, if any.
    prediction: Option<PredictionMeta>,
}

impl PointState {
    /// A real detection: the marker's LED was seen on.
    pub fn detected(position: Point2, stamp: f64) -> Self {
        Self {
            position,
            led_on: true,
            stamp,
            prediction: None,
        }
    }

    /// A virtual placeholder. Always off.
    pub fn virtual_at(position: Point2, stamp: f64) -> Self {
        Self {
            position,
            led_on: false,
            stamp,
            prediction: None,
        }
    }

    pub fn prediction(&self) -> Option<&PredictionMeta> {
        self.prediction.as_ref()
    }

    pub fn has_prediction(&self) -> bool {
        self.prediction.is_some()
    }

    /// Attaches prediction metadata. Returns `false` and leaves the point untouched
    /// if a prediction was already recorded.
    pub fn annotate(&mut self, meta: PredictionMeta) -> bool {
        if self.prediction.is_some() {
            return false;
        }
        self.prediction = Some(meta);
        true
    }
}

/// One detector message: every point seen in a single camera frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    /// Capture time of the frame in seconds.
    pub stamp: f64,
    /// Detected marker centres in pixel coordinates.
    pub points: Vec<Point2>,
}

impl Frame {
    pub fn new(stamp: f64, points: Vec<Point2>) -> Self {
        Self { stamp, points }
    }

    /// Converts the frame into real observations, in detector order.
    pub fn observations(&self) -> Vec<PointState> {
        self.points
            .iter()
            .map(|p| PointState::detected(*p, self.stamp))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> PredictionMeta {
        PredictionMeta {
            predicted: Point2::new(1.0, 2.0),
            x_coeffs: vec![1.0],
            y_coeffs: vec![2.0],
            time_origin: 0.0,
            radii: Point2::new(2.0, 2.0),
            region: SearchRegion::Ellipse,
            valid: true,
        }
    }

    #[test]
    fn virtual_points_are_always_off() {
        let p = PointState::virtual_at(Point2::new(3.0, 4.0), 1.5);
        assert!(!p.led_on);
        assert_eq!(p.position, Point2::new(3.0, 4.0));
        assert!(PointState::detected(Point2::ZERO, 0.0).led_on);
    }

    #[test]
    fn prediction_is_written_once() {
        let mut p = PointState::detected(Point2::ZERO, 0.0);
        assert!(p.annotate(meta()));
        let mut other = meta();
        other.predicted = Point2::new(9.0, 9.0);
        assert!(!p.annotate(other));
        assert_eq!(p.prediction().map(|m| m.predicted), Some(Point2::new(1.0, 2.0)));
    }

    #[test]
    fn within_shift_is_inclusive_per_axis() {
        let a = Point2::new(100.0, 100.0);
        assert!(a.within_shift(&Point2::new(103.0, 97.0), &Point2::new(3.0, 3.0)));
        assert!(!a.within_shift(&Point2::new(103.5, 100.0), &Point2::new(3.0, 3.0)));
    }

    #[test]
    fn frame_observations_share_the_frame_stamp() {
        let frame = Frame::new(2.5, vec![Point2::new(1.0, 1.0), Point2::new(5.0, 5.0)]);
        let obs = frame.observations();
        assert_eq!(obs.len(), 2);
        assert!(obs.iter().all(|o| o.led_on && o.stamp == 2.5));
    }
}
