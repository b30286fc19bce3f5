//! Pitch/formant engine and the built-in effect stages.
//!
//! The stage set is closed: [`EffectStage`] dispatches over the five concrete stages, and
//! [`EffectsChain`] runs them in a fixed order chosen at construction. Parameters travel as
//! plain `Copy` structs ([`EffectsParams`]) so the control side can publish a snapshot and the
//! processing thread can read it without locks.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::warn;
use voxmorph_dsp::{all_finite, Effect, EffectMetadata, ParameterError, Sample};

pub mod chorus;
pub mod compressor;
pub mod delay;
pub mod distortion;
pub mod reverb;
pub mod vocoder;

pub use chorus::{Chorus, ChorusParams};
pub use compressor::{Compressor, CompressorParams};
pub use delay::{Delay, DelayParams};
pub use distortion::{Distortion, DistortionParams};
pub use reverb::{Reverb, ReverbParams};
pub use vocoder::{
    semitones_to_ratio, voice_metadata, PitchFormantEngine, FORMANT_RANGE, PITCH_RANGE,
};

/// Ramp used for dry/wet mixes.
pub(crate) const MIX_RAMP_MS: f32 = 10.0;

/// Logical identifiers for the built-in stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Reverb,
    Chorus,
    Distortion,
    Compressor,
    Delay,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Reverb,
        StageKind::Chorus,
        StageKind::Distortion,
        StageKind::Compressor,
        StageKind::Delay,
    ];

    pub fn id(self) -> &'static str {
        match self {
            StageKind::Reverb => "reverb",
            StageKind::Chorus => "chorus",
            StageKind::Distortion => "distortion",
            StageKind::Compressor => "compressor",
            StageKind::Delay => "delay",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Reverb => "Reverb",
            StageKind::Chorus => "Chorus",
            StageKind::Distortion => "Distortion",
            StageKind::Compressor => "Compressor",
            StageKind::Delay => "Delay",
        }
    }

    /// Static parameter metadata for the stage.
    pub fn metadata(self) -> &'static EffectMetadata {
        match self {
            StageKind::Reverb => ReverbParams::metadata(),
            StageKind::Chorus => ChorusParams::metadata(),
            StageKind::Distortion => DistortionParams::metadata(),
            StageKind::Compressor => CompressorParams::metadata(),
            StageKind::Delay => DelayParams::metadata(),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for StageKind {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        StageKind::ALL
            .into_iter()
            .find(|kind| {
                kind.id().eq_ignore_ascii_case(needle) || kind.name().eq_ignore_ascii_case(needle)
            })
            .ok_or_else(|| ParameterError::UnknownStage(s.to_string()))
    }
}

/// Parameter vector of a single stage, addressable by parameter id.
pub trait StageParams: Copy + PartialEq + Default {
    fn metadata() -> &'static EffectMetadata;

    /// Mutable access to the field backing `id`.
    fn slot(&mut self, id: &str) -> Option<&mut f32>;

    fn get(&self, id: &str) -> Option<f32> {
        let mut copy = *self;
        copy.slot(id).map(|value| *value)
    }

    /// Resolves `id`, clamps `value` into range and stores it. Returns the stored value.
    fn set(&mut self, id: &str, value: f32) -> Result<f32, ParameterError> {
        let clamped = Self::metadata().clamp(id, value)?;
        let slot = self.slot(id).ok_or_else(|| ParameterError::UnknownParameter {
            stage: Self::metadata().id.to_string(),
            parameter: id.to_string(),
        })?;
        *slot = clamped;
        Ok(clamped)
    }

    /// Copy with every field clamped into its metadata range.
    fn clamped(&self) -> Self {
        let mut copy = *self;
        for spec in Self::metadata().parameters.iter() {
            if let Some(slot) = copy.slot(spec.id) {
                *slot = spec.clamp(*slot);
            }
        }
        copy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings<P> {
    pub enabled: bool,
    pub params: P,
}

/// Enable flags and parameters for every stage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsParams {
    pub reverb: StageSettings<ReverbParams>,
    pub chorus: StageSettings<ChorusParams>,
    pub distortion: StageSettings<DistortionParams>,
    pub compressor: StageSettings<CompressorParams>,
    pub delay: StageSettings<DelayParams>,
}

impl EffectsParams {
    pub fn enabled(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::Reverb => self.reverb.enabled,
            StageKind::Chorus => self.chorus.enabled,
            StageKind::Distortion => self.distortion.enabled,
            StageKind::Compressor => self.compressor.enabled,
            StageKind::Delay => self.delay.enabled,
        }
    }

    pub fn set_enabled(&mut self, kind: StageKind, enabled: bool) {
        match kind {
            StageKind::Reverb => self.reverb.enabled = enabled,
            StageKind::Chorus => self.chorus.enabled = enabled,
            StageKind::Distortion => self.distortion.enabled = enabled,
            StageKind::Compressor => self.compressor.enabled = enabled,
            StageKind::Delay => self.delay.enabled = enabled,
        }
    }

    pub fn param(&self, kind: StageKind, id: &str) -> Result<f32, ParameterError> {
        let value = match kind {
            StageKind::Reverb => self.reverb.params.get(id),
            StageKind::Chorus => self.chorus.params.get(id),
            StageKind::Distortion => self.distortion.params.get(id),
            StageKind::Compressor => self.compressor.params.get(id),
            StageKind::Delay => self.delay.params.get(id),
        };
        value.ok_or_else(|| ParameterError::UnknownParameter {
            stage: kind.id().to_string(),
            parameter: id.to_string(),
        })
    }

    /// Sets a named parameter, clamping into range. Returns the applied value.
    pub fn set_param(
        &mut self,
        kind: StageKind,
        id: &str,
        value: f32,
    ) -> Result<f32, ParameterError> {
        let requested = value;
        let applied = match kind {
            StageKind::Reverb => self.reverb.params.set(id, value),
            StageKind::Chorus => self.chorus.params.set(id, value),
            StageKind::Distortion => self.distortion.params.set(id, value),
            StageKind::Compressor => self.compressor.params.set(id, value),
            StageKind::Delay => self.delay.params.set(id, value),
        }?;
        if applied != requested {
            warn!(
                "parameter `{}` for effect `{}` clamped from {} to {}",
                id, kind, requested, applied
            );
        }
        Ok(applied)
    }
}

/// Closed set of stages with uniform dispatch.
pub enum EffectStage {
    Reverb(Reverb),
    Chorus(Chorus),
    Distortion(Distortion),
    Compressor(Compressor),
    Delay(Delay),
}

impl EffectStage {
    pub fn new(kind: StageKind, sample_rate: f32) -> Self {
        match kind {
            StageKind::Reverb => EffectStage::Reverb(Reverb::new(sample_rate)),
            StageKind::Chorus => EffectStage::Chorus(Chorus::new(sample_rate)),
            StageKind::Distortion => EffectStage::Distortion(Distortion::new(sample_rate)),
            StageKind::Compressor => EffectStage::Compressor(Compressor::new(sample_rate)),
            StageKind::Delay => EffectStage::Delay(Delay::new(sample_rate)),
        }
    }

    pub fn kind(&self) -> StageKind {
        match self {
            EffectStage::Reverb(_) => StageKind::Reverb,
            EffectStage::Chorus(_) => StageKind::Chorus,
            EffectStage::Distortion(_) => StageKind::Distortion,
            EffectStage::Compressor(_) => StageKind::Compressor,
            EffectStage::Delay(_) => StageKind::Delay,
        }
    }

    pub fn metadata(&self) -> &EffectMetadata {
        match self {
            EffectStage::Reverb(stage) => stage.metadata(),
            EffectStage::Chorus(stage) => stage.metadata(),
            EffectStage::Distortion(stage) => stage.metadata(),
            EffectStage::Compressor(stage) => stage.metadata(),
            EffectStage::Delay(stage) => stage.metadata(),
        }
    }

    /// Pulls this stage's parameters out of the full set.
    pub fn set_params(&mut self, params: &EffectsParams) {
        match self {
            EffectStage::Reverb(stage) => stage.set_params(&params.reverb.params),
            EffectStage::Chorus(stage) => stage.set_params(&params.chorus.params),
            EffectStage::Distortion(stage) => stage.set_params(&params.distortion.params),
            EffectStage::Compressor(stage) => stage.set_params(&params.compressor.params),
            EffectStage::Delay(stage) => stage.set_params(&params.delay.params),
        }
    }

    /// Processes in place. A stage that still yields non-finite output is reset and muted.
    pub fn process(&mut self, block: &mut [Sample]) {
        match self {
            EffectStage::Reverb(stage) => stage.process(block),
            EffectStage::Chorus(stage) => stage.process(block),
            EffectStage::Distortion(stage) => stage.process(block),
            EffectStage::Compressor(stage) => stage.process(block),
            EffectStage::Delay(stage) => stage.process(block),
        }
        if !all_finite(block) {
            self.reset();
            block.fill(0.0);
        }
    }

    pub fn reset(&mut self) {
        match self {
            EffectStage::Reverb(stage) => stage.reset(),
            EffectStage::Chorus(stage) => stage.reset(),
            EffectStage::Distortion(stage) => stage.reset(),
            EffectStage::Compressor(stage) => stage.reset(),
            EffectStage::Delay(stage) => stage.reset(),
        }
    }
}

struct ChainSlot {
    stage: EffectStage,
    active: bool,
}

/// Ordered series of stages. Disabled stages are skipped entirely.
pub struct EffectsChain {
    slots: Vec<ChainSlot>,
}

impl EffectsChain {
    /// Builds one stage per entry of `order`. Duplicates are ignored.
    pub fn new(sample_rate: f32, order: &[StageKind]) -> Self {
        let mut slots: Vec<ChainSlot> = Vec::with_capacity(order.len());
        for &kind in order {
            if slots.iter().any(|slot| slot.stage.kind() == kind) {
                warn!("effect `{}` listed twice in stage order; ignoring duplicate", kind);
                continue;
            }
            slots.push(ChainSlot {
                stage: EffectStage::new(kind, sample_rate),
                active: false,
            });
        }
        Self { slots }
    }

    pub fn order(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.slots.iter().map(|slot| slot.stage.kind())
    }

    /// Runs every enabled stage in order.
    ///
    /// A stage switching from disabled to enabled starts from cleared state, so toggling a
    /// stage off and on behaves as if it had just been created.
    pub fn process(&mut self, block: &mut [Sample], params: &EffectsParams) {
        for slot in &mut self.slots {
            if !params.enabled(slot.stage.kind()) {
                slot.active = false;
                continue;
            }
            slot.stage.set_params(params);
            if !slot.active {
                slot.stage.reset();
                slot.active = true;
            }
            slot.stage.process(block);
        }
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.stage.reset();
            slot.active = false;
        }
    }
}
