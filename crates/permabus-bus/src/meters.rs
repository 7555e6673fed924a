//! Peak-level smoothing for the published meters.
//!
//! Meters use an asymmetric one-pole: a louder input replaces the level
//! instantly, a quieter one lets it decay by a fixed factor per update
//! (fast attack, slow release). Smoothing state lives only in the synth
//! process; the region carries nothing but the smoothed result.

use permabus_core::tunables::METER_DECAY;

/// One smoothed peak level.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeakSmoother {
    level: f32,
}

impl PeakSmoother {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one peak reading, returning the new smoothed level.
    pub fn update(&mut self, input: f32) -> f32 {
        if input > self.level {
            self.level = input;
        } else {
            self.level *= METER_DECAY;
        }
        self.level
    }

    #[must_use]
    pub fn level(&self) -> f32 {
        self.level
    }
}

/// A left/right smoother pair.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StereoSmoother {
    l: PeakSmoother,
    r: PeakSmoother,
}

impl StereoSmoother {
    pub(crate) fn update(&mut self, peak_l: f32, peak_r: f32) -> (f32, f32) {
        (self.l.update(peak_l), self.r.update(peak_r))
    }
}

/// Per-side absolute peaks of an interleaved stereo chunk. A trailing
/// unpaired sample is ignored.
pub(crate) fn scan_peaks(interleaved: &[f32]) -> (f32, f32) {
    let mut peak_l = 0.0f32;
    let mut peak_r = 0.0f32;
    for pair in interleaved.chunks_exact(2) {
        peak_l = peak_l.max(pair[0].abs());
        peak_r = peak_r.max(pair[1].abs());
    }
    (peak_l, peak_r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_attack() {
        let mut smoother = PeakSmoother::new();
        assert!((smoother.update(0.8) - 0.8).abs() < f32::EPSILON);
        assert!((smoother.update(1.0) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_decay_rate() {
        // One loud update followed by nine silent ones leaves 0.92^9.
        let mut smoother = PeakSmoother::new();
        smoother.update(1.0);
        let mut level = 0.0;
        for _ in 0..9 {
            level = smoother.update(0.0);
        }
        let expected = METER_DECAY.powi(9);
        assert!((level - expected).abs() < 1e-6, "{level} vs {expected}");
        assert!((expected - 0.472).abs() < 0.001);
    }

    #[test]
    fn test_scan_peaks_interleaved() {
        let chunk = [0.1, -0.5, -0.3, 0.2, 0.25, 0.4];
        let (l, r) = scan_peaks(&chunk);
        assert!((l - 0.3).abs() < f32::EPSILON);
        assert!((r - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_scan_peaks_ignores_trailing_sample() {
        let chunk = [0.1, 0.2, 0.9];
        let (l, r) = scan_peaks(&chunk);
        assert!((l - 0.1).abs() < f32::EPSILON);
        assert!((r - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_scan_peaks_empty() {
        assert_eq!(scan_peaks(&[]), (0.0, 0.0));
    }
}
