use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use voxmorph_dsp::{
    sanitize_sample, Effect, EffectMetadata, ParameterRange, ParameterSpec, ParameterUnit, Sample,
    SmoothedParam,
};

use crate::{StageKind, StageParams, MIX_RAMP_MS};

const COMB_TIMES: [f32; 4] = [0.0297, 0.0371, 0.0411, 0.0437];
const ALLPASS_TIMES: [f32; 2] = [0.005, 0.0017];
const ALLPASS_FEEDBACK: f32 = 0.5;
const MIN_FEEDBACK: f32 = 0.7;
const FEEDBACK_SPAN: f32 = 0.28;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbParams {
    pub room_size: f32,
    pub damping: f32,
    pub mix: f32,
}

impl Default for ReverbParams {
    fn default() -> Self {
        Self {
            room_size: 0.5,
            damping: 0.5,
            mix: 0.3,
        }
    }
}

impl StageParams for ReverbParams {
    fn metadata() -> &'static EffectMetadata {
        REVERB_METADATA.as_ref()
    }

    fn slot(&mut self, id: &str) -> Option<&mut f32> {
        match id {
            "room_size" => Some(&mut self.room_size),
            "damping" => Some(&mut self.damping),
            "mix" => Some(&mut self.mix),
            _ => None,
        }
    }
}

/// Schroeder reverb: parallel damped combs into series all-passes.
pub struct Reverb {
    metadata: Arc<EffectMetadata>,
    params: ReverbParams,
    mix: SmoothedParam,
    combs: Vec<CombFilter>,
    allpasses: Vec<AllPassFilter>,
}

impl Reverb {
    pub fn new(sample_rate: f32) -> Self {
        let sample_rate = sample_rate.max(1.0);
        let params = ReverbParams::default();
        let mut reverb = Self {
            metadata: Arc::clone(&REVERB_METADATA),
            params,
            mix: SmoothedParam::new(params.mix, MIX_RAMP_MS, sample_rate),
            combs: COMB_TIMES
                .iter()
                .map(|&delay| CombFilter::new(sample_rate, delay))
                .collect(),
            allpasses: ALLPASS_TIMES
                .iter()
                .map(|&delay| AllPassFilter::new(sample_rate, delay, ALLPASS_FEEDBACK))
                .collect(),
        };
        reverb.update_combs();
        reverb
    }

    fn update_combs(&mut self) {
        let feedback = MIN_FEEDBACK + FEEDBACK_SPAN * self.params.room_size;
        for comb in &mut self.combs {
            comb.feedback = feedback;
            comb.damping = self.params.damping;
        }
    }

    fn process_sample(&mut self, input: Sample) -> Sample {
        let mut sum = 0.0;
        for comb in &mut self.combs {
            sum += comb.process(input);
        }
        let mut output = sum / self.combs.len() as Sample;
        for allpass in &mut self.allpasses {
            output = allpass.process(output);
        }
        output
    }
}

impl Effect for Reverb {
    type Params = ReverbParams;

    fn metadata(&self) -> &EffectMetadata {
        self.metadata.as_ref()
    }

    fn set_params(&mut self, params: &ReverbParams) {
        let params = params.clamped();
        if params == self.params {
            return;
        }
        self.params = params;
        self.mix.set_target(params.mix);
        self.update_combs();
    }

    fn process(&mut self, block: &mut [Sample]) {
        for sample in block.iter_mut() {
            let input = sanitize_sample(*sample);
            let wet = self.process_sample(input);
            let mix = self.mix.next();
            *sample = input * (1.0 - mix) + wet * mix;
        }
    }

    fn reset(&mut self) {
        for comb in &mut self.combs {
            comb.clear();
        }
        for allpass in &mut self.allpasses {
            allpass.clear();
        }
        self.mix.reset(self.params.mix);
    }
}

struct CombFilter {
    buffer: Vec<Sample>,
    index: usize,
    feedback: f32,
    damping: f32,
    filter_store: Sample,
}

impl CombFilter {
    fn new(sample_rate: f32, delay_seconds: f32) -> Self {
        let len = ((delay_seconds * sample_rate).round() as usize).max(1);
        Self {
            buffer: vec![0.0; len],
            index: 0,
            feedback: MIN_FEEDBACK,
            damping: 0.5,
            filter_store: 0.0,
        }
    }

    fn process(&mut self, input: Sample) -> Sample {
        let output = self.buffer[self.index];
        // One-pole low-pass in the loop darkens the tail as it decays.
        self.filter_store = output * (1.0 - self.damping) + self.filter_store * self.damping;
        self.buffer[self.index] = input + self.filter_store * self.feedback;
        self.index += 1;
        if self.index >= self.buffer.len() {
            self.index = 0;
        }
        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.index = 0;
        self.filter_store = 0.0;
    }
}

struct AllPassFilter {
    buffer: Vec<Sample>,
    index: usize,
    feedback: f32,
}

impl AllPassFilter {
    fn new(sample_rate: f32, delay_seconds: f32, feedback: f32) -> Self {
        let len = ((delay_seconds * sample_rate).round() as usize).max(1);
        Self {
            buffer: vec![0.0; len],
            index: 0,
            feedback,
        }
    }

    fn process(&mut self, input: Sample) -> Sample {
        let buf_out = self.buffer[self.index];
        let output = -input + buf_out;
        self.buffer[self.index] = input + buf_out * self.feedback;
        self.index += 1;
        if self.index >= self.buffer.len() {
            self.index = 0;
        }
        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.index = 0;
    }
}

static REVERB_PARAMS: Lazy<Vec<ParameterSpec>> = Lazy::new(|| {
    vec![
        ParameterSpec {
            id: "room_size",
            name: "Room Size",
            range: ParameterRange {
                min: 0.0,
                max: 1.0,
                step: 0.01,
            },
            default: 0.5,
            unit: ParameterUnit::Ratio,
        },
        ParameterSpec {
            id: "damping",
            name: "Damping",
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
            default: 0.3,
            unit: ParameterUnit::Percent,
        },
    ]
});

static REVERB_METADATA: Lazy<Arc<EffectMetadata>> = Lazy::new(|| {
    Arc::new(EffectMetadata::new(
        StageKind::Reverb.id(),
        StageKind::Reverb.name(),
        REVERB_PARAMS.as_slice(),
    ))
});
