use std::{f32::consts::PI, sync::Arc};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use voxmorph_dsp::{
    sanitize_sample, Effect, EffectMetadata, ParameterRange, ParameterSpec, ParameterUnit, Sample,
    SmoothedParam,
};

use crate::{StageKind, StageParams, MIX_RAMP_MS};

const BASE_DELAY_S: f32 = 0.015;
/// Modulation swing at full depth.
const MAX_SWING_S: f32 = 0.005;
const MAX_VOICES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusParams {
    pub rate_hz: f32,
    pub depth: f32,
    pub voices: f32,
    pub mix: f32,
}

impl Default for ChorusParams {
    fn default() -> Self {
        Self {
            rate_hz: 1.0,
            depth: 0.5,
            voices: 2.0,
            mix: 0.5,
        }
    }
}

impl StageParams for ChorusParams {
    fn metadata() -> &'static EffectMetadata {
        CHORUS_METADATA.as_ref()
    }

    fn slot(&mut self, id: &str) -> Option<&mut f32> {
        match id {
            "rate_hz" => Some(&mut self.rate_hz),
            "depth" => Some(&mut self.depth),
            "voices" => Some(&mut self.voices),
            "mix" => Some(&mut self.mix),
            _ => None,
        }
    }
}

/// Multi-voice chorus. Each voice reads the shared delay line through its own LFO phase.
pub struct Chorus {
    metadata: Arc<EffectMetadata>,
    params: ChorusParams,
    sample_rate: f32,
    buffer: Vec<Sample>,
    write_pos: usize,
    phase: f32,
    voices: usize,
    mix: SmoothedParam,
}

impl Chorus {
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = sample_rate.max(1.0);
        let buffer_size = ((BASE_DELAY_S + MAX_SWING_S) * sample_rate) as usize + 2;
        let params = ChorusParams::default();
        Self {
            metadata: Arc::clone(&CHORUS_METADATA),
            params,
            sample_rate,
            buffer: vec![0.0; buffer_size],
            write_pos: 0,
            phase: 0.0,
            voices: params.voices as usize,
            mix: SmoothedParam::new(params.mix, MIX_RAMP_MS, sample_rate),
        }
    }

    #[inline]
    fn read_interpolated(&self, delay_samples: f32) -> Sample {
        let len = self.buffer.len();
        let delay_int = delay_samples as usize;
        let frac = delay_samples - delay_int as f32;

        let read_pos_0 = (self.write_pos + len - delay_int) % len;
        let read_pos_1 = (read_pos_0 + len - 1) % len;

        let s0 = self.buffer[read_pos_0];
        let s1 = self.buffer[read_pos_1];
        s0 + frac * (s1 - s0)
    }
}

impl Effect for Chorus {
    type Params = ChorusParams;

    fn metadata(&self) -> &EffectMetadata {
        self.metadata.as_ref()
    }

    fn set_params(&mut self, params: &ChorusParams) {
        let params = params.clamped();
        self.params = params;
        self.voices = (params.voices.round() as usize).clamp(1, MAX_VOICES);
        self.mix.set_target(params.mix);
    }

    fn process(&mut self, block: &mut [Sample]) {
        let len = self.buffer.len();
        let base = BASE_DELAY_S * self.sample_rate;
        let swing = self.params.depth * MAX_SWING_S * self.sample_rate;
        let max_delay = (len - 2) as f32;
        let phase_inc = self.params.rate_hz / self.sample_rate;
        let voice_gain = 1.0 / self.voices as f32;

        for sample in block.iter_mut() {
            let input = sanitize_sample(*sample);
            self.buffer[self.write_pos] = input;

            let mut wet = 0.0;
            for voice in 0..self.voices {
                let offset = voice as f32 / self.voices as f32;
                let lfo = (2.0 * PI * (self.phase + offset)).sin();
                let delay = (base + swing * lfo).clamp(1.0, max_delay);
                wet += self.read_interpolated(delay);
            }
            wet *= voice_gain;

            self.write_pos = (self.write_pos + 1) % len;
            self.phase = (self.phase + phase_inc).fract();

            let mix = self.mix.next();
            *sample = input * (1.0 - mix) + wet * mix;
        }
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.phase = 0.0;
        self.mix.reset(self.params.mix);
    }
}

static CHORUS_PARAMS: Lazy<Vec<ParameterSpec>> = Lazy::new(|| {
    vec![
        ParameterSpec {
            id: "rate_hz",
            name: "Rate",
            range: ParameterRange {
                min: 0.1,
                max: 10.0,
                step: 0.01,
            },
            default: 1.0,
            unit: ParameterUnit::Hertz,
        },
        ParameterSpec {
            id: "depth",
            name: "Depth",
            range: ParameterRange {
                min: 0.0,
                max: 1.0,
                step: 0.01,
            },
            default: 0.5,
            unit: ParameterUnit::Ratio,
        },
        ParameterSpec {
            id: "voices",
            name: "Voices",
            range: ParameterRange {
                min: 1.0,
                max: MAX_VOICES as f32,
                step: 1.0,
            },
            default: 2.0,
            unit: ParameterUnit::None,
        },
        ParameterSpec {
            id: "mix",
            name: "Dry/Wet",
            range: ParameterRange {
                min: 0.0,
                max: 1.0,
                step: 0.01,
            },
            default: 0.5,
            unit: ParameterUnit::Percent,
        },
    ]
});

static CHORUS_METADATA: Lazy<Arc<EffectMetadata>> = Lazy::new(|| {
    Arc::new(EffectMetadata::new(
        StageKind::Chorus.id(),
        StageKind::Chorus.name(),
        CHORUS_PARAMS.as_slice(),
    ))
});

#[cfg(test)]
mod tests {
    use super::*;

    fn chorus_with(params: ChorusParams) -> Chorus {
        let mut chorus = Chorus::new(44_100.0);
        chorus.set_params(&params);
        chorus.reset();
        chorus
    }

    #[test]
    fn passthrough_when_dry() {
        let mut chorus = chorus_with(ChorusParams {
            mix: 0.0,
            ..ChorusParams::default()
        });
        let mut block = [0.5, -0.5, 0.25, 0.0];
        chorus.process(&mut block);
        assert_eq!(block, [0.5, -0.5, 0.25, 0.0]);
    }

    #[test]
    fn wet_signal_is_delayed() {
        let mut chorus = chorus_with(ChorusParams {
            mix: 1.0,
            depth: 0.0,
            ..ChorusParams::default()
        });
        let mut block = vec![0.0; 2_000];
        block[0] = 1.0;
        chorus.process(&mut block);

        let delay = (BASE_DELAY_S * 44_100.0) as usize;
        let peak = block
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        assert!(peak.abs_diff(delay) <= 1, "peak at {peak}, expected {delay}");
    }

    #[test]
    fn voices_are_rounded_and_clamped() {
        let mut chorus = Chorus::new(48_000.0);
        chorus.set_params(&ChorusParams {
            voices: 7.6,
            ..ChorusParams::default()
        });
        assert_eq!(chorus.voices, MAX_VOICES);
        chorus.set_params(&ChorusParams {
            voices: 2.4,
            ..ChorusParams::default()
        });
        assert_eq!(chorus.voices, 2);
    }

    #[test]
    fn modulation_changes_output() {
        let mut still = chorus_with(ChorusParams {
            depth: 0.0,
            mix: 1.0,
            ..ChorusParams::default()
        });
        let mut moving = chorus_with(ChorusParams {
            depth: 1.0,
            rate_hz: 5.0,
            mix: 1.0,
            ..ChorusParams::default()
        });
        let input: Vec<Sample> = (0..8_820).map(|i| (i as f32 * 0.05).sin()).collect();
        let mut a = input.clone();
        let mut b = input;
        still.process(&mut a);
        moving.process(&mut b);
        let diff: f32 = a.iter().zip(&b).map(|(x, y)| (x - y).abs()).sum();
        assert!(diff > 1.0);
    }
}
