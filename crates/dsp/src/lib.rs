//! Core DSP abstractions and utilities for the voxmorph real-time voice pipeline.
//!
//! The crate focuses on providing lock-free data structures that bridge the
//! device callbacks and the processing thread, the overlap-add frame scheduler,
//! and the trait-based effect interface shared by the effect stages and the
//! control surface.

use std::{borrow::Cow, sync::Arc};

use serde::Serialize;
use thiserror::Error;

pub mod ring_buffer;
pub mod scheduler;
pub mod smoothing;

pub use ring_buffer::{Consumer, OverflowPolicy, Producer, RingBuffer, RingMonitor};
pub use scheduler::{hann_window, FrameScheduler};
pub use smoothing::SmoothedParam;

/// Primary floating-point sample type used across the engine.
pub type Sample = f32;

/// Largest magnitude a stage will accept on its input.
///
/// Audio is nominally within ±1.0; anything beyond this is adversarial and gets clamped so
/// feedback paths stay finite.
pub const SAMPLE_LIMIT: Sample = 1_000.0;

/// Floor used before taking logarithms of magnitudes.
pub const MIN_MAGNITUDE: f32 = 1e-9;

/// Converts decibels to a linear gain factor.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Converts a linear amplitude to decibels, with a -120 dB floor for silence.
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 1e-6 {
        -120.0
    } else {
        20.0 * linear.log10()
    }
}

/// Maps NaN to silence and clamps everything else into `±SAMPLE_LIMIT`.
#[inline]
pub fn sanitize_sample(sample: Sample) -> Sample {
    if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-SAMPLE_LIMIT, SAMPLE_LIMIT)
    }
}

/// Applies [`sanitize_sample`] to a whole block in place.
pub fn sanitize(block: &mut [Sample]) {
    for sample in block.iter_mut() {
        *sample = sanitize_sample(*sample);
    }
}

/// Returns `true` when every sample in the block is finite.
#[inline]
pub fn all_finite(block: &[Sample]) -> bool {
    block.iter().all(|sample| sample.is_finite())
}

/// Metadata describing a parameter exposed by an effect.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub range: ParameterRange,
    pub default: f32,
    pub unit: ParameterUnit,
}

impl ParameterSpec {
    /// Brings a requested value into range.
    ///
    /// Out-of-range values snap to the nearest bound; NaN falls back to the default.
    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            self.default
        } else {
            self.range.clamp(value)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ParameterRange {
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

impl ParameterRange {
    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }

    #[inline]
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub enum ParameterUnit {
    Decibels,
    Hertz,
    Ratio,
    Seconds,
    Milliseconds,
    Percent,
    Semitones,
    Custom(Cow<'static, str>),
    #[default]
    None,
}

/// Shared metadata for an effect implementation.
#[derive(Debug, Clone)]
pub struct EffectMetadata {
    pub id: &'static str,
    pub name: &'static str,
    pub parameters: Arc<[ParameterSpec]>,
}

impl EffectMetadata {
    pub fn new(id: &'static str, name: &'static str, parameters: &[ParameterSpec]) -> Self {
        Self {
            id,
            name,
            parameters: Arc::from(parameters),
        }
    }

    pub fn parameter(&self, id: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|spec| spec.id == id)
    }

    /// Resolves `id` and clamps `value` into its range.
    pub fn clamp(&self, id: &str, value: f32) -> Result<f32, ParameterError> {
        self.parameter(id)
            .map(|spec| spec.clamp(value))
            .ok_or_else(|| ParameterError::UnknownParameter {
                stage: self.id.to_string(),
                parameter: id.to_string(),
            })
    }
}

/// Errors raised when resolving named parameters at the control boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("unknown effect stage `{0}`")]
    UnknownStage(String),

    #[error("unknown parameter `{parameter}` for stage `{stage}`")]
    UnknownParameter { stage: String, parameter: String },
}

/// Trait implemented by every DSP effect stage in the engine.
///
/// Stages are mono and process a block in place. They must not allocate in
/// [`Effect::process`]; all state is sized when the stage is constructed.
pub trait Effect: Send {
    /// Stage-specific parameter vector.
    type Params: Copy + PartialEq;

    /// Returns effect metadata used by the host for introspection.
    fn metadata(&self) -> &EffectMetadata;

    /// Applies a validated parameter vector. Values outside the metadata ranges are clamped.
    fn set_params(&mut self, params: &Self::Params);

    /// Processes a mono block in place.
    fn process(&mut self, block: &mut [Sample]);

    /// Clears delay lines, envelopes and filter memory, snapping smoothers to their targets.
    fn reset(&mut self);
}
