// THEORY:
// This file is the main entry point for the `blink_tracker` library crate.
// It identifies blinking markers in a camera stream: 2D point detections are tracked
// frame by frame into sequences, and the on/off pattern of every sequence is
// decoded against a catalogue of known blink codes.
//
// The primary goal is to export the `BlinkPipeline` (one stream) and the
// `StreamPool` (one pipeline per stream on tokio tasks) together with their
// configuration and result types as the high-level interface. The layered engine
// (`core_modules`) stays available for callers that want to drive the tracker or
// the decoder directly.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::catalogue::{Catalogue, CatalogueSpec, LineCoding};
pub use core_modules::point_state::{Frame, Point2, PointState, SearchRegion};
pub use core_modules::signal_matcher::{DecodedId, DecoderConfig};
pub use core_modules::tracker::FrameSummary;
pub use error::{CatalogueError, ConfigError, PoolError};
pub use parallel_pipeline::StreamPool;
pub use pipeline::{BlinkPipeline, PipelineConfig, ResultsHandle, SignalReport};
