// THEORY:
// The `pipeline` module is the final, top-level API for a single camera stream.
// It wires the tracking layer and the decoding layer into one object with two faces:
//
// - the **producer** face (`process_frame`) is called once per detector message and
//   runs the whole tracker pass under a single lock;
// - the **consumer** face (`results`, or a detached `ResultsHandle` for another
//   thread) copies the tracked histories out under the same lock and decodes them
//   after releasing it, so decoding never stalls the producer.
//
// Configuration is plain serde data with documented defaults, loadable from JSON and
// validated once before anything is built.

use crate::core_modules::catalogue::Catalogue;
use crate::core_modules::point_state::{Frame, Point2, PointState};
use crate::core_modules::predictor::SearchConfig;
use crate::core_modules::sequence_store::{SequenceId, SequenceStore};
use crate::core_modules::signal_matcher::{DecodedId, DecoderConfig, SignalMatcher};
use crate::core_modules::tracker::{BlinkTracker, FrameSummary};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Stale margin in seconds until the transport reports a framerate.
const DEFAULT_STALE_MARGIN: f64 = 5.0 / 60.0;
/// Frames of silence the informational stale margin covers.
const STALE_MARGIN_FRAMES: f64 = 60.0;
/// A reported framerate must exceed this to be used.
const MIN_FRAMERATE: f64 = 1.0;
/// Largest number of observations a single sequence may retain.
const MAX_RING_CAPACITY: usize = 4096;

/// Configuration for the `BlinkPipeline`, allowing for tunable behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum per-axis pixel displacement between consecutive observations of the
    /// same marker for a direct match.
    pub max_shift: Point2,
    /// Sequences keep `code_length * retention_factor` observations.
    pub retention_factor: usize,
    pub search: SearchConfig,
    pub decoder: DecoderConfig,
}

impl PipelineConfig {
    pub const DEFAULT_MAX_SHIFT: Point2 = Point2::new(3.0, 3.0);
    pub const DEFAULT_RETENTION_FACTOR: usize = 3;
    pub const MAX_RETENTION_FACTOR: usize = 16;

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;

        if !positive(self.max_shift.x) || !positive(self.max_shift.y) {
            return Err(ConfigError::invalid(
                "max_shift",
                format!(
                    "both axes must be positive, got ({}, {})",
                    self.max_shift.x, self.max_shift.y
                ),
            ));
        }
        if !(1..=Self::MAX_RETENTION_FACTOR).contains(&self.retention_factor) {
            return Err(ConfigError::invalid(
                "retention_factor",
                format!(
                    "must lie in [1, {}], got {}",
                    Self::MAX_RETENTION_FACTOR,
                    self.retention_factor
                ),
            ));
        }

        let search = &self.search;
        if !search.prediction_margin.is_finite() {
            return Err(ConfigError::invalid("search.prediction_margin", "must be finite"));
        }
        if search.poly_order == 0 {
            return Err(ConfigError::invalid("search.poly_order", "must be at least 1"));
        }
        if search.min_regression_points < 2 {
            return Err(ConfigError::invalid("search.min_regression_points", "must be at least 2"));
        }
        if search.regression_window < search.min_regression_points {
            return Err(ConfigError::invalid(
                "search.regression_window",
                format!(
                    "must be at least min_regression_points ({})",
                    search.min_regression_points
                ),
            ));
        }
        for (field, value) in [
            ("search.std_threshold", search.std_threshold),
            ("search.min_radius", search.min_radius),
            ("search.std_scale", search.std_scale),
            ("search.residual_scale", search.residual_scale),
        ] {
            if !positive(value) {
                return Err(ConfigError::invalid(field, format!("must be positive, got {value}")));
            }
        }
        if !search.coarse_margin.is_finite() || search.coarse_margin < 0.0 {
            return Err(ConfigError::invalid("search.coarse_margin", "must be non-negative"));
        }

        let decoder = &self.decoder;
        if !(-1.0..=1.0).contains(&decoder.min_correlation) {
            return Err(ConfigError::invalid(
                "decoder.min_correlation",
                format!("must lie in [-1, 1], got {}", decoder.min_correlation),
            ));
        }
        if !decoder.min_margin.is_finite() || decoder.min_margin < 0.0 {
            return Err(ConfigError::invalid("decoder.min_margin", "must be non-negative"));
        }
        if decoder.min_bits == 0 {
            return Err(ConfigError::invalid("decoder.min_bits", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_shift: Self::DEFAULT_MAX_SHIFT,
            retention_factor: Self::DEFAULT_RETENTION_FACTOR,
            search: SearchConfig::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

/// Decoded state of one tracked sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalReport {
    pub sequence: SequenceId,
    /// The sequence's most recent observation (its current image position).
    pub last: PointState,
    pub id: DecodedId,
}

/// Locks the store, recovering the data if a previous holder panicked. The store is
/// only ever mutated through complete operations, so it is consistent either way.
fn lock_store(store: &Mutex<SequenceStore>) -> MutexGuard<'_, SequenceStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only access to a pipeline's tracked sequences, for a consumer running on
/// another thread.
#[derive(Debug, Clone)]
pub struct ResultsHandle {
    store: Arc<Mutex<SequenceStore>>,
    matcher: Arc<SignalMatcher>,
}

impl ResultsHandle {
    /// Decodes every live sequence. The lock is only held while copying.
    pub fn results(&self) -> Vec<SignalReport> {
        let snapshot = lock_store(&self.store).snapshot(self.matcher.window());
        snapshot
            .into_iter()
            .map(|s| SignalReport {
                sequence: s.id,
                id: self.matcher.decode(&s.bits),
                last: s.last,
            })
            .collect()
    }

    /// Full on/off history of every live sequence, oldest first.
    pub fn histories(&self) -> Vec<(SequenceId, Vec<bool>)> {
        let store = lock_store(&self.store);
        store
            .snapshot(store.capacity())
            .into_iter()
            .map(|s| (s.id, s.bits))
            .collect()
    }

    pub fn sequence_count(&self) -> usize {
        lock_store(&self.store).len()
    }
}

/// The main, top-level struct for one camera stream.
pub struct BlinkPipeline {
    store: Arc<Mutex<SequenceStore>>,
    tracker: BlinkTracker,
    matcher: Arc<SignalMatcher>,
    config: PipelineConfig,
    framerate: Option<f64>,
}

impl BlinkPipeline {
    pub fn new(config: PipelineConfig, catalogue: Catalogue) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = Self::ring_capacity(&config, &catalogue)?;
        tracing::info!(
            "blink pipeline: {} codes x {} symbols, ring capacity {}, \
             max shift ({}, {}), {:?} search region",
            catalogue.len(),
            catalogue.code_length(),
            capacity,
            config.max_shift.x,
            config.max_shift.y,
            config.search.region
        );
        Ok(Self {
            store: Arc::new(Mutex::new(SequenceStore::new(capacity))),
            tracker: BlinkTracker::new(config.max_shift, config.search.clone()),
            matcher: Arc::new(SignalMatcher::new(catalogue, config.decoder.clone())),
            config,
            framerate: None,
        })
    }

    /// Observations kept per sequence: `code_length * retention_factor`, bounded.
    fn ring_capacity(config: &PipelineConfig, catalogue: &Catalogue) -> Result<usize, ConfigError> {
        catalogue
            .code_length()
            .checked_mul(config.retention_factor)
            .filter(|capacity| *capacity <= MAX_RING_CAPACITY)
            .ok_or_else(|| {
                ConfigError::invalid(
                    "retention_factor",
                    format!(
                        "{} symbols x {} exceeds the ring limit of {}",
                        catalogue.code_length(),
                        config.retention_factor,
                        MAX_RING_CAPACITY
                    ),
                )
            })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalogue(&self) -> &Catalogue {
        self.matcher.catalogue()
    }

    /// Runs the tracker over one detector message. The store lock is held for the
    /// whole pass.
    pub fn process_frame(&self, frame: &Frame) -> FrameSummary {
        let mut store = lock_store(&self.store);
        let mut summary = self.tracker.process(&mut store, frame);
        let stale = self
            .tracker
            .stale_sequences(&store, frame.stamp, self.stale_margin());
        drop(store);

        if !stale.is_empty() {
            tracing::trace!(
                "{} sequences without a detection for {:.3}s",
                stale.len(),
                self.stale_margin()
            );
        }
        summary.stale_sequences = stale.len();
        summary
    }

    /// Decodes every live sequence.
    pub fn results(&self) -> Vec<SignalReport> {
        self.results_handle().results()
    }

    /// A clonable handle for reading results from another thread.
    pub fn results_handle(&self) -> ResultsHandle {
        ResultsHandle {
            store: Arc::clone(&self.store),
            matcher: Arc::clone(&self.matcher),
        }
    }

    /// Records the stream's framerate. Values not above 1 fps are ignored.
    pub fn update_framerate(&mut self, framerate: f64) -> bool {
        if !framerate.is_finite() || framerate <= MIN_FRAMERATE {
            tracing::warn!("ignoring framerate {} (must be above {})", framerate, MIN_FRAMERATE);
            return false;
        }
        tracing::debug!("framerate set to {:.2}", framerate);
        self.framerate = Some(framerate);
        true
    }

    pub fn framerate(&self) -> Option<f64> {
        self.framerate
    }

    /// Seconds after which a sequence without a detection is reported as stale.
    pub fn stale_margin(&self) -> f64 {
        self.framerate
            .map_or(DEFAULT_STALE_MARGIN, |fps| STALE_MARGIN_FRAMES / fps)
    }

    pub fn histories(&self) -> Vec<(SequenceId, Vec<bool>)> {
        self.results_handle().histories()
    }

    pub fn sequence_count(&self) -> usize {
        lock_store(&self.store).len()
    }
}
