use std::{f32::consts::PI, sync::Arc};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use voxmorph_dsp::{
    db_to_linear, sanitize_sample, Effect, EffectMetadata, ParameterRange, ParameterSpec,
    ParameterUnit, Sample, SmoothedParam,
};

use crate::{StageKind, StageParams, MIX_RAMP_MS};

const TONE_BASE_HZ: f32 = 500.0;
/// Octaves spanned by the tone control above the base cutoff.
const TONE_OCTAVES: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionParams {
    pub drive_db: f32,
    pub tone: f32,
    pub mix: f32,
}

impl Default for DistortionParams {
    fn default() -> Self {
        Self {
            drive_db: 12.0,
            tone: 0.5,
            mix: 0.75,
        }
    }
}

impl StageParams for DistortionParams {
    fn metadata() -> &'static EffectMetadata {
        DISTORTION_METADATA.as_ref()
    }

    fn slot(&mut self, id: &str) -> Option<&mut f32> {
        match id {
            "drive_db" => Some(&mut self.drive_db),
            "tone" => Some(&mut self.tone),
            "mix" => Some(&mut self.mix),
            _ => None,
        }
    }
}

/// `tanh` soft clipper followed by a one-pole tone filter on the wet path.
pub struct Distortion {
    metadata: Arc<EffectMetadata>,
    params: DistortionParams,
    sample_rate: f32,
    drive_gain: f32,
    post_gain: f32,
    tone_coeff: f32,
    tone_state: Sample,
    mix: SmoothedParam,
}

impl Distortion {
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = sample_rate.max(1.0);
        let params = DistortionParams::default();
        let mut effect = Self {
            metadata: Arc::clone(&DISTORTION_METADATA),
            params,
            sample_rate,
            drive_gain: 1.0,
            post_gain: 1.0,
            tone_coeff: 1.0,
            tone_state: 0.0,
            mix: SmoothedParam::new(params.mix, MIX_RAMP_MS, sample_rate),
        };
        effect.update_coeffs();
        effect
    }

    fn update_coeffs(&mut self) {
        self.drive_gain = db_to_linear(self.params.drive_db);
        // Keep perceived loudness roughly stable.
        let compensation = self.drive_gain.tanh().max(1e-3);
        self.post_gain = 1.0 / compensation;

        let cutoff = (TONE_BASE_HZ * 2.0f32.powf(TONE_OCTAVES * self.params.tone))
            .min(0.45 * self.sample_rate);
        self.tone_coeff = 1.0 - (-2.0 * PI * cutoff / self.sample_rate).exp();
    }
}

impl Effect for Distortion {
    type Params = DistortionParams;

    fn metadata(&self) -> &EffectMetadata {
        self.metadata.as_ref()
    }

    fn set_params(&mut self, params: &DistortionParams) {
        let params = params.clamped();
        if params == self.params {
            return;
        }
        self.params = params;
        self.mix.set_target(params.mix);
        self.update_coeffs();
    }

    fn process(&mut self, block: &mut [Sample]) {
        let drive_gain = self.drive_gain;
        let post_gain = self.post_gain;
        let tone_coeff = self.tone_coeff;

        for sample in block.iter_mut() {
            let input = sanitize_sample(*sample);
            let shaped = (input * drive_gain).tanh() * post_gain;
            self.tone_state += tone_coeff * (shaped - self.tone_state);
            let mix = self.mix.next();
            *sample = input * (1.0 - mix) + self.tone_state * mix;
        }
    }

    fn reset(&mut self) {
        self.tone_state = 0.0;
        self.mix.reset(self.params.mix);
    }
}

static DISTORTION_PARAMS: Lazy<Vec<ParameterSpec>> = Lazy::new(|| {
    vec![
        ParameterSpec {
            id: "drive_db",
            name: "Drive",
            range: ParameterRange {
                min: 0.0,
                max: 48.0,
                step: 0.5,
            },
            default: 12.0,
            unit: ParameterUnit::Decibels,
        },
        ParameterSpec {
            id: "tone",
            name: "Tone",
            range: ParameterRange {
                min: 0.0,
                max: 1.0,
                step: 0.01,
            },
            default: 0.5,
            unit: ParameterUnit::Ratio,
        },
        ParameterSpec {
            id: "mix",
            name: "Dry/Wet",
            range: ParameterRange {
                min: 0.0,
                max: 1.0,
                step: 0.01,
            },
            default: 0.75,
            unit: ParameterUnit::Percent,
        },
    ]
});

static DISTORTION_METADATA: Lazy<Arc<EffectMetadata>> = Lazy::new(|| {
    Arc::new(EffectMetadata::new(
        StageKind::Distortion.id(),
        StageKind::Distortion.name(),
        DISTORTION_PARAMS.as_slice(),
    ))
});

#[cfg(test)]
mod tests {
    use super::*;

    fn wet_distortion(drive_db: f32) -> Distortion {
        let mut effect = Distortion::new(48_000.0);
        effect.set_params(&DistortionParams {
            drive_db,
            tone: 1.0,
            mix: 1.0,
        });
        effect.reset();
        effect
    }

    #[test]
    fn output_is_bounded_by_post_gain() {
        let mut effect = wet_distortion(48.0);
        let mut block: Vec<Sample> = (0..4_800).map(|i| (i as f32 * 0.01).sin() * 100.0).collect();
        effect.process(&mut block);
        let limit = effect.post_gain * 1.0001;
        assert!(block.iter().all(|s| s.abs() <= limit));
    }

    #[test]
    fn more_drive_squares_the_wave() {
        let crest = |drive_db: f32| {
            let mut effect = wet_distortion(drive_db);
            let mut block: Vec<Sample> =
                (0..9_600).map(|i| (i as f32 * 0.02).sin() * 0.5).collect();
            effect.process(&mut block);
            let tail = &block[4_800..];
            let peak = tail.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            let rms = (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt();
            peak / rms
        };
        assert!(crest(36.0) < crest(0.0));
    }

    #[test]
    fn dark_tone_removes_highs() {
        let energy = |tone: f32| {
            let mut effect = Distortion::new(48_000.0);
            effect.set_params(&DistortionParams {
                drive_db: 0.0,
                tone,
                mix: 1.0,
            });
            effect.reset();
            let mut block: Vec<Sample> = (0..4_800)
                .map(|i| if i % 2 == 0 { 0.1 } else { -0.1 })
                .collect();
            effect.process(&mut block);
            block[2_400..].iter().map(|s| s * s).sum::<f32>()
        };
        assert!(energy(0.0) < energy(1.0) * 0.1);
    }
}
