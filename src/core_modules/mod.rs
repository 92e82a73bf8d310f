pub mod associator;
pub mod catalogue;
pub mod geometry;
pub mod point_state;
pub mod predictor;
pub mod sequence_store;
pub mod signal_matcher;
pub mod tracker;
