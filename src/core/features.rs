//! Scalar indices derived from band powers.
//!
//! These are normalized-ratio heuristics, not clinical measures. The focus
//! denominator differs between the two historical formulas, so the formula
//! is an explicit setting and its name travels with every recording.

use crate::core::bands::BandPowers;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Floor for every denominator.
pub const EPSILON: f64 = 1e-6;

/// Which bands make up the focus denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FocusFormula {
    /// `beta / (alpha + theta + delta)`
    #[default]
    #[serde(rename = "focus-v1")]
    V1,
    /// `beta / (alpha + theta + delta + beta + gamma)`
    #[serde(rename = "focus-v2")]
    V2,
}

impl FocusFormula {
    /// Human-readable name, as used in config files.
    pub fn name(self) -> &'static str {
        match self {
            FocusFormula::V1 => "focus-v1",
            FocusFormula::V2 => "focus-v2",
        }
    }

    /// Name of the focus column in recordings.
    pub fn column(self) -> &'static str {
        match self {
            FocusFormula::V1 => "focus_v1",
            FocusFormula::V2 => "focus_v2",
        }
    }

    /// Reverse of [`FocusFormula::column`].
    pub fn from_column(column: &str) -> Option<Self> {
        match column {
            "focus_v1" => Some(FocusFormula::V1),
            "focus_v2" => Some(FocusFormula::V2),
            _ => None,
        }
    }

    /// Focus index for the given band powers.
    pub fn focus(self, bands: &BandPowers) -> f64 {
        let slow = bands.alpha + bands.theta + bands.delta;
        let denominator = match self {
            FocusFormula::V1 => slow,
            FocusFormula::V2 => slow + bands.beta + bands.gamma,
        };
        bands.beta / denominator.max(EPSILON)
    }
}

impl std::str::FromStr for FocusFormula {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "v1" | "focus-v1" => Ok(FocusFormula::V1),
            "v2" | "focus-v2" => Ok(FocusFormula::V2),
            other => Err(format!("unknown focus formula '{other}'")),
        }
    }
}

/// Relaxation index: `alpha / (alpha + theta + delta)`.
pub fn relaxation(bands: &BandPowers) -> f64 {
    let denominator = bands.alpha + bands.theta + bands.delta;
    bands.alpha / denominator.max(EPSILON)
}

/// One derived sample of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Wall-clock time the tick completed
    pub timestamp: DateTime<Utc>,
    /// Poller tick sequence number
    pub tick: u64,
    /// Video frame counter sampled at tick time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<u64>,
    pub bands: BandPowers,
    pub focus: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relaxation: Option<f64>,
}

/// Turns band powers into [`FeatureRecord`]s.
#[derive(Debug, Clone, Copy)]
pub struct FeatureDeriver {
    formula: FocusFormula,
    with_relaxation: bool,
}

impl FeatureDeriver {
    pub fn new(formula: FocusFormula, with_relaxation: bool) -> Self {
        Self {
            formula,
            with_relaxation,
        }
    }

    pub fn formula(&self) -> FocusFormula {
        self.formula
    }

    pub fn with_relaxation(&self) -> bool {
        self.with_relaxation
    }

    /// Build the record for one tick.
    pub fn derive(
        &self,
        bands: BandPowers,
        timestamp: DateTime<Utc>,
        tick: u64,
        frame_index: Option<u64>,
    ) -> FeatureRecord {
        FeatureRecord {
            timestamp,
            tick,
            frame_index,
            focus: self.formula.focus(&bands),
            relaxation: self.with_relaxation.then(|| relaxation(&bands)),
            bands,
        }
    }
}

impl Default for FeatureDeriver {
    fn default() -> Self {
        Self::new(FocusFormula::V1, true)
    }
}
