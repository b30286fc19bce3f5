//! Feed-forward peak compressor with a fixed soft knee.

use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use voxmorph_dsp::{
    db_to_linear, linear_to_db, sanitize_sample, Effect, EffectMetadata, ParameterRange,
    ParameterSpec, ParameterUnit, Sample, SmoothedParam,
};

use crate::{StageKind, StageParams};

const KNEE_DB: f32 = 6.0;
const MAKEUP_RAMP_MS: f32 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorParams {
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub makeup_db: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -20.0,
            ratio: 4.0,
            attack_ms: 5.0,
            release_ms: 100.0,
            makeup_db: 0.0,
        }
    }
}

impl StageParams for CompressorParams {
    fn metadata() -> &'static EffectMetadata {
        COMPRESSOR_METADATA.as_ref()
    }

    fn slot(&mut self, id: &str) -> Option<&mut f32> {
        match id {
            "threshold_db" => Some(&mut self.threshold_db),
            "ratio" => Some(&mut self.ratio),
            "attack_ms" => Some(&mut self.attack_ms),
            "release_ms" => Some(&mut self.release_ms),
            "makeup_db" => Some(&mut self.makeup_db),
            _ => None,
        }
    }
}

pub struct Compressor {
    metadata: Arc<EffectMetadata>,
    params: CompressorParams,
    sample_rate: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
    makeup: SmoothedParam,
}

impl Compressor {
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = sample_rate.max(1.0);
        let params = CompressorParams::default();
        let mut compressor = Self {
            metadata: Arc::clone(&COMPRESSOR_METADATA),
            params,
            sample_rate,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            envelope: 0.0,
            makeup: SmoothedParam::new(
                db_to_linear(params.makeup_db),
                MAKEUP_RAMP_MS,
                sample_rate,
            ),
        };
        compressor.update_coeffs();
        compressor
    }

    fn update_coeffs(&mut self) {
        let samples = |ms: f32| (ms / 1000.0 * self.sample_rate).max(1.0);
        self.attack_coeff = (-1.0 / samples(self.params.attack_ms)).exp();
        self.release_coeff = (-1.0 / samples(self.params.release_ms)).exp();
    }

    /// Gain change in dB (zero or negative) for an envelope level in dB.
    fn gain_reduction_db(&self, level_db: f32) -> f32 {
        let threshold = self.params.threshold_db;
        let slope = 1.0 - 1.0 / self.params.ratio;
        let half_knee = KNEE_DB / 2.0;

        if level_db <= threshold - half_knee {
            0.0
        } else if level_db >= threshold + half_knee {
            (threshold - level_db) * slope
        } else {
            let x = level_db - threshold + half_knee;
            -slope * x * x / (2.0 * KNEE_DB)
        }
    }
}

impl Effect for Compressor {
    type Params = CompressorParams;

    fn metadata(&self) -> &EffectMetadata {
        self.metadata.as_ref()
    }

    fn set_params(&mut self, params: &CompressorParams) {
        let params = params.clamped();
        if params == self.params {
            return;
        }
        self.params = params;
        self.makeup.set_target(db_to_linear(params.makeup_db));
        self.update_coeffs();
    }

    fn process(&mut self, block: &mut [Sample]) {
        for sample in block.iter_mut() {
            let input = sanitize_sample(*sample);
            let level = input.abs();
            let coeff = if level > self.envelope {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope = coeff * self.envelope + (1.0 - coeff) * level;

            let reduction = db_to_linear(self.gain_reduction_db(linear_to_db(self.envelope)));
            *sample = input * reduction * self.makeup.next();
        }
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
        self.makeup.reset(db_to_linear(self.params.makeup_db));
    }
}

static COMPRESSOR_PARAMS: Lazy<Vec<ParameterSpec>> = Lazy::new(|| {
    vec![
        ParameterSpec {
            id: "threshold_db",
            name: "Threshold",
            range: ParameterRange {
                min: -60.0,
                max: 0.0,
                step: 0.5,
            },
            default: -20.0,
            unit: ParameterUnit::Decibels,
        },
        ParameterSpec {
            id: "ratio",
            name: "Ratio",
            range: ParameterRange {
                min: 1.0,
                max: 20.0,
                step: 0.1,
            },
            default: 4.0,
            unit: ParameterUnit::Ratio,
        },
        ParameterSpec {
            id: "attack_ms",
            name: "Attack",
            range: ParameterRange {
                min: 0.1,
                max: 100.0,
                step: 0.1,
            },
            default: 5.0,
            unit: ParameterUnit::Milliseconds,
        },
        ParameterSpec {
            id: "release_ms",
            name: "Release",
            range: ParameterRange {
                min: 10.0,
                max: 1_000.0,
                step: 1.0,
            },
            default: 100.0,
            unit: ParameterUnit::Milliseconds,
        },
        ParameterSpec {
            id: "makeup_db",
            name: "Makeup Gain",
            range: ParameterRange {
                min: 0.0,
                max: 24.0,
                step: 0.1,
            },
            default: 0.0,
            unit: ParameterUnit::Decibels,
        },
    ]
});

static COMPRESSOR_METADATA: Lazy<Arc<EffectMetadata>> = Lazy::new(|| {
    Arc::new(EffectMetadata::new(
        StageKind::Compressor.id(),
        StageKind::Compressor.name(),
        COMPRESSOR_PARAMS.as_slice(),
    ))
});

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn compressor(params: CompressorParams) -> Compressor {
        let mut comp = Compressor::new(44_100.0);
        comp.set_params(&params);
        comp.reset();
        comp
    }

    fn run_constant(comp: &mut Compressor, level: Sample, samples: usize) -> Sample {
        let mut block = vec![level; samples];
        comp.process(&mut block);
        block[samples - 1]
    }

    #[test]
    fn passes_quiet_signals() {
        let mut comp = compressor(CompressorParams {
            threshold_db: -20.0,
            attack_ms: 1.0,
            ..CompressorParams::default()
        });
        let out = run_constant(&mut comp, 0.05, 2_000);
        assert_abs_diff_eq!(out, 0.05, epsilon = 1e-3);
    }

    #[test]
    fn reduces_loud_signals_by_ratio() {
        let mut comp = compressor(CompressorParams {
            threshold_db: -12.0,
            ratio: 4.0,
            attack_ms: 1.0,
            ..CompressorParams::default()
        });
        let out = run_constant(&mut comp, 1.0, 10_000);
        // 12 dB over a 4:1 threshold leaves 3 dB of the overshoot: -9 dB overall.
        assert_abs_diff_eq!(linear_to_db(out), -9.0, epsilon = 0.1);
    }

    #[test]
    fn attack_lets_the_first_transient_through() {
        let mut comp = compressor(CompressorParams {
            threshold_db: -20.0,
            ratio: 10.0,
            attack_ms: 10.0,
            release_ms: 500.0,
            ..CompressorParams::default()
        });
        let first = run_constant(&mut comp, 1.0, 1);
        let later = run_constant(&mut comp, 1.0, 1_000);
        assert!(first > later, "first={first}, later={later}");
    }

    #[test]
    fn release_recovers_gain() {
        let mut comp = compressor(CompressorParams {
            threshold_db: -20.0,
            ratio: 10.0,
            attack_ms: 1.0,
            release_ms: 50.0,
            ..CompressorParams::default()
        });
        run_constant(&mut comp, 1.0, 1_000);
        let compressed = run_constant(&mut comp, 0.1, 1);
        let released = run_constant(&mut comp, 0.1, 10_000);
        assert!(released > compressed);
    }

    #[test]
    fn makeup_gain_ramps_in() {
        let mut comp = compressor(CompressorParams::default());
        comp.set_params(&CompressorParams {
            makeup_db: 6.0,
            ..CompressorParams::default()
        });
        let first = run_constant(&mut comp, 0.01, 1);
        assert!(first < 0.012, "makeup should not jump: {first}");
        let settled = run_constant(&mut comp, 0.01, 20_000);
        assert_abs_diff_eq!(settled, 0.01 * db_to_linear(6.0), epsilon = 1e-4);
    }
}
