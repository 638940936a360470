//! Core signal processing for the agent.
//!
//! This module contains:
//! - Band-power extraction from raw sample windows
//! - Focus / relaxation derivation and the feature record type

pub mod bands;
pub mod features;

// Re-export commonly used types
pub use bands::{Band, BandPowerExtractor, BandPowers, ChannelGrouping, ExtractionError};
pub use features::{relaxation, FeatureDeriver, FeatureRecord, FocusFormula, EPSILON};
