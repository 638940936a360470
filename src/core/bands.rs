//! Band-power extraction from raw sample windows.
//!
//! Each analysed signal is mean-removed, turned into a power spectral
//! density with Welch's method and integrated over the five canonical EEG
//! bands. The analysis produces a plain vector; [`BandPowers::from_vector`]
//! is the only way to turn it into a typed value, so a malformed result can
//! never leak downstream as numbers.

use crate::session::RawSampleWindow;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

/// Canonical EEG frequency bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    Delta,
    Theta,
    Alpha,
    Beta,
    Gamma,
}

impl Band {
    /// All bands in record order.
    pub const ALL: [Band; 5] = [Band::Delta, Band::Theta, Band::Alpha, Band::Beta, Band::Gamma];

    /// Frequency range in Hz, lower bound inclusive.
    pub fn range_hz(self) -> (f64, f64) {
        match self {
            Band::Delta => (0.5, 4.0),
            Band::Theta => (4.0, 8.0),
            Band::Alpha => (8.0, 13.0),
            Band::Beta => (13.0, 30.0),
            Band::Gamma => (30.0, 45.0),
        }
    }

    /// Column / field name.
    pub fn name(self) -> &'static str {
        match self {
            Band::Delta => "delta",
            Band::Theta => "theta",
            Band::Alpha => "alpha",
            Band::Beta => "beta",
            Band::Gamma => "gamma",
        }
    }
}

/// Average power per band over one analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BandPowers {
    pub delta: f64,
    pub theta: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl BandPowers {
    /// Validate an analysis result.
    ///
    /// Anything other than exactly five finite, non-negative values is
    /// rejected as [`ExtractionError::Malformed`].
    pub fn from_vector(values: &[f64]) -> Result<Self, ExtractionError> {
        let [delta, theta, alpha, beta, gamma] = <[f64; 5]>::try_from(values).map_err(|_| {
            ExtractionError::Malformed(format!("expected 5 band values, got {}", values.len()))
        })?;

        let powers = Self {
            delta,
            theta,
            alpha,
            beta,
            gamma,
        };
        for band in Band::ALL {
            let value = powers.get(band);
            if !value.is_finite() || value < 0.0 {
                return Err(ExtractionError::Malformed(format!(
                    "{} power is {value}",
                    band.name()
                )));
            }
        }
        Ok(powers)
    }

    /// Values in record order (delta, theta, alpha, beta, gamma).
    pub fn as_array(&self) -> [f64; 5] {
        [self.delta, self.theta, self.alpha, self.beta, self.gamma]
    }

    /// Power of one band.
    pub fn get(&self, band: Band) -> f64 {
        match band {
            Band::Delta => self.delta,
            Band::Theta => self.theta,
            Band::Alpha => self.alpha,
            Band::Beta => self.beta,
            Band::Gamma => self.gamma,
        }
    }

    /// Sum over all bands.
    pub fn total(&self) -> f64 {
        self.as_array().iter().sum()
    }
}

/// How multiple channels are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelGrouping {
    /// Analyse each channel, then average the band powers
    #[default]
    PerChannel,
    /// Average channels sample by sample, then analyse the single signal
    Pooled,
}

impl std::str::FromStr for ChannelGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "per-channel" => Ok(ChannelGrouping::PerChannel),
            "pooled" => Ok(ChannelGrouping::Pooled),
            other => Err(format!("unknown channel grouping '{other}'")),
        }
    }
}

/// Reasons a window could not be turned into band powers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractionError {
    #[error("window has no samples")]
    InsufficientSamples,
    #[error("malformed band powers: {0}")]
    Malformed(String),
    #[error("channel {channel} not present (window has {available})")]
    ChannelOutOfRange { channel: usize, available: usize },
    #[error("sampling rate must be positive")]
    InvalidSamplingRate,
}

/// Converts raw windows into [`BandPowers`] for one session.
pub struct BandPowerExtractor {
    sampling_rate: u32,
    channels: Vec<usize>,
    grouping: ChannelGrouping,
    plans: HashMap<usize, Arc<dyn Fft<f64>>>,
}

impl std::fmt::Debug for BandPowerExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandPowerExtractor")
            .field("sampling_rate", &self.sampling_rate)
            .field("channels", &self.channels)
            .field("grouping", &self.grouping)
            .finish()
    }
}

impl BandPowerExtractor {
    /// Create an extractor bound to a session's sampling rate.
    pub fn new(
        sampling_rate: u32,
        channels: Vec<usize>,
        grouping: ChannelGrouping,
    ) -> Result<Self, ExtractionError> {
        if sampling_rate == 0 {
            return Err(ExtractionError::InvalidSamplingRate);
        }
        Ok(Self {
            sampling_rate,
            channels,
            grouping,
            plans: HashMap::new(),
        })
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    pub fn grouping(&self) -> ChannelGrouping {
        self.grouping
    }

    /// Compute band powers for the configured channels of `window`.
    pub fn extract(&mut self, window: &RawSampleWindow) -> Result<BandPowers, ExtractionError> {
        if window.is_empty() {
            return Err(ExtractionError::InsufficientSamples);
        }
        if self.channels.is_empty() {
            return Err(ExtractionError::Malformed("no channels selected".to_string()));
        }

        let signals = self
            .channels
            .iter()
            .map(|&ch| {
                window
                    .channel(ch)
                    .ok_or(ExtractionError::ChannelOutOfRange {
                        channel: ch,
                        available: window.channel_count(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        match self.grouping {
            ChannelGrouping::Pooled => {
                let len = window.sample_count();
                let pooled: Vec<f64> = (0..len)
                    .map(|i| signals.iter().map(|s| s[i]).mean())
                    .collect();
                let values = self.analyze(&pooled);
                BandPowers::from_vector(&values)
            }
            ChannelGrouping::PerChannel => {
                let per_channel = signals
                    .iter()
                    .map(|signal| {
                        let values = self.analyze(signal);
                        BandPowers::from_vector(&values)
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let averaged: Vec<f64> = Band::ALL
                    .iter()
                    .map(|&band| per_channel.iter().map(|p| p.get(band)).mean())
                    .collect();
                BandPowers::from_vector(&averaged)
            }
        }
    }

    /// Integrate the Welch PSD of `signal` over every band.
    fn analyze(&mut self, signal: &[f64]) -> Vec<f64> {
        let (psd, resolution) = self.welch_psd(signal);
        Band::ALL
            .iter()
            .map(|band| {
                let (low, high) = band.range_hz();
                psd.iter()
                    .enumerate()
                    .filter(|(k, _)| {
                        let freq = *k as f64 * resolution;
                        freq >= low && freq < high
                    })
                    .map(|(_, p)| p * resolution)
                    .sum()
            })
            .collect()
    }

    /// One-sided power spectral density and its bin width in Hz.
    fn welch_psd(&mut self, signal: &[f64]) -> (Vec<f64>, f64) {
        let fs = f64::from(self.sampling_rate);
        // Largest power of two not above the sampling rate.
        let rate = self.sampling_rate as usize;
        let target = if rate.is_power_of_two() {
            rate
        } else {
            rate.next_power_of_two() / 2
        };
        let segment_len = signal.len().min(target).max(1);
        let fft_size = segment_len.next_power_of_two();
        let step = (segment_len / 2).max(1);

        let window = analysis_window(segment_len);
        let window_energy: f64 = window.iter().map(|w| w * w).sum();
        let scale = 1.0 / (fs * window_energy);

        let fft = self.plan(fft_size);
        let bins = fft_size / 2 + 1;
        let mut psd = vec![0.0; bins];
        let mut segments = 0usize;
        let mut buffer = vec![Complex::new(0.0, 0.0); fft_size];

        let mut start = 0;
        while start + segment_len <= signal.len() {
            let segment = &signal[start..start + segment_len];
            let mean = segment.iter().mean();

            buffer.iter_mut().for_each(|c| *c = Complex::new(0.0, 0.0));
            for (slot, (&x, &w)) in buffer.iter_mut().zip(segment.iter().zip(&window)) {
                *slot = Complex::new((x - mean) * w, 0.0);
            }
            fft.process(&mut buffer);

            for (k, value) in psd.iter_mut().enumerate() {
                let power = buffer[k].norm_sqr() * scale;
                // Fold negative frequencies into the one-sided spectrum.
                let fold = if k == 0 || (fft_size % 2 == 0 && k == fft_size / 2) {
                    1.0
                } else {
                    2.0
                };
                *value += power * fold;
            }
            segments += 1;
            start += step;
        }

        if segments > 0 {
            psd.iter_mut().for_each(|p| *p /= segments as f64);
        }
        (psd, fs / fft_size as f64)
    }

    fn plan(&mut self, size: usize) -> Arc<dyn Fft<f64>> {
        self.plans
            .entry(size)
            .or_insert_with(|| FftPlanner::new().plan_fft_forward(size))
            .clone()
    }
}

/// Hann window, or a flat window when the segment is too short for tapering.
fn analysis_window(len: usize) -> Vec<f64> {
    if len < 4 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (len - 1) as f64).cos()))
        .collect()
}
