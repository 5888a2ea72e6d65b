//! Loudness and spectrum statistics over normalized sample buffers.

use std::f64::consts::PI;

use crate::protocol::{SPECTRUM_MAX_SAMPLES, SPECTRUM_MIN_SAMPLES};

/// Gain applied to samples before RMS: `sensitivity / 50`, floored at 0.001.
///
/// The default sensitivity of 50 maps to unity gain.
pub fn sensitivity_scale(sensitivity: u8) -> f64 {
    (f64::from(sensitivity) / 50.0).max(0.001)
}

/// Root-mean-square of `samples` after multiplying each by `scale`.
///
/// Returns `0.0` for an empty slice.
pub fn rms(samples: &[f32], scale: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&v| {
            let x = f64::from(v) * scale;
            x * x
        })
        .sum();
    let r = (sum_sq / samples.len() as f64).sqrt();
    if r.is_finite() {
        r
    } else {
        0.0
    }
}

/// `20 · log10(rms)`, assuming samples normalized to ±1.
///
/// Non-positive input maps to negative infinity.
pub fn rms_to_db(rms: f64) -> f64 {
    if rms <= 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * rms.log10()
    }
}

/// Magnitude spectrum of the most recent samples via a naive DFT.
///
/// Only the last [`SPECTRUM_MAX_SAMPLES`] samples are used. Returns
/// `min(bins, N / 2)` magnitudes, each `|X[k]| / N`; empty when fewer than
/// [`SPECTRUM_MIN_SAMPLES`] samples are available.
///
/// O(N · bins): fine for dashboard refresh rates, not a DSP core.
pub fn magnitude_spectrum(samples: &[f32], bins: usize) -> Vec<f64> {
    let recent = &samples[samples.len().saturating_sub(SPECTRUM_MAX_SAMPLES)..];
    let n = recent.len();
    if n < SPECTRUM_MIN_SAMPLES {
        return Vec::new();
    }
    let m = bins.min(n / 2);
    (0..m)
        .map(|k| {
            let (re, im) = recent
                .iter()
                .enumerate()
                .fold((0.0_f64, 0.0_f64), |(re, im), (i, &x)| {
                    let phi = 2.0 * PI * k as f64 * i as f64 / n as f64;
                    let x = f64::from(x);
                    (re + x * phi.cos(), im - x * phi.sin())
                });
            (re * re + im * im).sqrt() / n as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_constant_is_its_magnitude() {
        assert!((rms(&[0.5, -0.5, 0.5, -0.5], 1.0) - 0.5).abs() < 1e-12);
        assert_eq!(rms(&[], 1.0), 0.0);
    }

    #[test]
    fn sensitivity_scales_rms() {
        assert_eq!(sensitivity_scale(50), 1.0);
        assert_eq!(sensitivity_scale(100), 2.0);
        assert_eq!(sensitivity_scale(0), 0.001);
        let r = rms(&[0.25; 8], sensitivity_scale(100));
        assert!((r - 0.5).abs() < 1e-12);
    }

    #[test]
    fn db_conversion() {
        assert!((rms_to_db(1.0)).abs() < 1e-12);
        assert!((rms_to_db(0.1) + 20.0).abs() < 1e-9);
        assert_eq!(rms_to_db(0.0), f64::NEG_INFINITY);
    }

    #[test]
    fn spectrum_needs_enough_samples() {
        assert!(magnitude_spectrum(&[1.0; 7], 128).is_empty());
        assert_eq!(magnitude_spectrum(&[1.0; 8], 128).len(), 4);
        assert_eq!(magnitude_spectrum(&[1.0; 2048], 128).len(), 128);
    }

    #[test]
    fn spectrum_peaks_at_signal_bin() {
        let n = 64;
        let samples: Vec<f32> = (0..n)
            .map(|i| (2.0 * PI * 4.0 * i as f64 / n as f64).sin() as f32)
            .collect();
        let mags = magnitude_spectrum(&samples, 32);
        let peak = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k);
        assert_eq!(peak, Some(4));
        // DC of a constant signal carries its full amplitude.
        let dc = magnitude_spectrum(&[0.5; 16], 4);
        assert!((dc[0] - 0.5).abs() < 1e-9);
    }
}
