//! One-pole parameter smoothing for amplitude-sensitive controls.

use crate::Sample;

/// Below this distance the ramp lands exactly on its target.
const SNAP_EPSILON: f32 = 1e-6;

/// Exponential ramp from the current value towards a target.
#[derive(Debug, Clone)]
pub struct SmoothedParam {
    current: f32,
    target: f32,
    /// Per-sample coefficient: `current += coeff * (target - current)`.
    coeff: f32,
}

impl SmoothedParam {
    /// `ramp_ms` is one time constant (about 63% of the way to the target).
    pub fn new(initial: f32, ramp_ms: f32, sample_rate: f32) -> Self {
        Self {
            current: initial,
            target: initial,
            coeff: coefficient(ramp_ms, sample_rate),
        }
    }

    pub fn set_target(&mut self, target: f32) {
        if target.is_finite() {
            self.target = target;
        }
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    #[inline]
    pub fn current(&self) -> f32 {
        self.current
    }

    /// Advances one sample and returns the smoothed value.
    #[inline]
    pub fn next(&mut self) -> Sample {
        let delta = self.target - self.current;
        if delta.abs() < SNAP_EPSILON {
            self.current = self.target;
        } else {
            self.current += self.coeff * delta;
        }
        self.current
    }

    /// Jumps to `value` immediately.
    pub fn reset(&mut self, value: f32) {
        self.current = value;
        self.target = value;
    }

    /// Jumps to the pending target.
    pub fn snap(&mut self) {
        self.current = self.target;
    }
}

fn coefficient(ramp_ms: f32, sample_rate: f32) -> f32 {
    let samples = (ramp_ms / 1000.0) * sample_rate;
    if samples <= 1.0 {
        1.0
    } else {
        1.0 - (-1.0 / samples).exp()
    }
}
