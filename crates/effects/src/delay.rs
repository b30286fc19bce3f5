use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use voxmorph_dsp::{
    sanitize_sample, Effect, EffectMetadata, ParameterRange, ParameterSpec, ParameterUnit, Sample,
    SmoothedParam,
};

use crate::{StageKind, StageParams, MIX_RAMP_MS};

const MAX_DELAY_S: f32 = 2.0;
/// Delay-time changes glide instead of jumping to avoid clicks.
const TIME_RAMP_MS: f32 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayParams {
    pub time_s: f32,
    pub feedback: f32,
    pub mix: f32,
}

impl Default for DelayParams {
    fn default() -> Self {
        Self {
            time_s: 0.3,
            feedback: 0.5,
            mix: 0.35,
        }
    }
}

impl StageParams for DelayParams {
    fn metadata() -> &'static EffectMetadata {
        DELAY_METADATA.as_ref()
    }

    fn slot(&mut self, id: &str) -> Option<&mut f32> {
        match id {
            "time_s" => Some(&mut self.time_s),
            "feedback" => Some(&mut self.feedback),
            "mix" => Some(&mut self.mix),
            _ => None,
        }
    }
}

/// Single-tap feedback echo with a fractional, smoothed read position.
pub struct Delay {
    metadata: Arc<EffectMetadata>,
    params: DelayParams,
    sample_rate: f32,
    buffer: Vec<Sample>,
    write_pos: usize,
    delay_samples: SmoothedParam,
    mix: SmoothedParam,
}

impl Delay {
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = sample_rate.max(1.0);
        let params = DelayParams::default();
        let buffer_size = (MAX_DELAY_S * sample_rate) as usize + 2;
        Self {
            metadata: Arc::clone(&DELAY_METADATA),
            params,
            sample_rate,
            buffer: vec![0.0; buffer_size],
            write_pos: 0,
            delay_samples: SmoothedParam::new(
                params.time_s * sample_rate,
                TIME_RAMP_MS,
                sample_rate,
            ),
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

impl Effect for Delay {
    type Params = DelayParams;

    fn metadata(&self) -> &EffectMetadata {
        self.metadata.as_ref()
    }

    fn set_params(&mut self, params: &DelayParams) {
        let params = params.clamped();
        self.params = params;
        self.delay_samples
            .set_target(params.time_s * self.sample_rate);
        self.mix.set_target(params.mix);
    }

    fn process(&mut self, block: &mut [Sample]) {
        let len = self.buffer.len();
        let max_delay = (len - 2) as f32;
        let feedback = self.params.feedback;

        for sample in block.iter_mut() {
            let input = sanitize_sample(*sample);
            let delay = self.delay_samples.next().clamp(1.0, max_delay);
            let delayed = self.read_interpolated(delay);

            self.buffer[self.write_pos] = input + delayed * feedback;
            self.write_pos = (self.write_pos + 1) % len;

            let mix = self.mix.next();
            *sample = input * (1.0 - mix) + delayed * mix;
        }
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.delay_samples.snap();
        self.mix.reset(self.params.mix);
    }
}

static DELAY_PARAMS: Lazy<Vec<ParameterSpec>> = Lazy::new(|| {
    vec![
        ParameterSpec {
            id: "time_s",
            name: "Time",
            range: ParameterRange {
                min: 0.01,
                max: MAX_DELAY_S,
                step: 0.01,
            },
            default: 0.3,
            unit: ParameterUnit::Seconds,
        },
        ParameterSpec {
            id: "feedback",
            name: "Feedback",
            range: ParameterRange {
                min: 0.0,
                max: 0.95,
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
            default: 0.35,
            unit: ParameterUnit::Percent,
        },
    ]
});

static DELAY_METADATA: Lazy<Arc<EffectMetadata>> = Lazy::new(|| {
    Arc::new(EffectMetadata::new(
        StageKind::Delay.id(),
        StageKind::Delay.name(),
        DELAY_PARAMS.as_slice(),
    ))
});
