//! Real-time voice transformation pipeline.
//!
//! [`AudioPipeline`] ties the device callbacks to the DSP core: capture samples travel through
//! a lock-free ring into the processor, which slices them into overlapping frames, runs the
//! pitch/formant engine and the effects chain, and queues the result for playback. Control
//! threads change parameters through the pipeline's setters or by applying a [`Preset`];
//! changes are published atomically and picked up at the next frame boundary.

mod config;
mod error;
mod params;
mod pipeline;
mod ports;
mod presets;
mod processor;
mod status;
mod throttle;

pub use config::{PipelineConfig, ProcessingMode};
pub use error::{Error, Result};
pub use params::{ParameterSet, ParameterStore, MAX_VOLUME};
pub use pipeline::AudioPipeline;
pub use ports::{CapturePort, DevicePorts, PlaybackPort, UNDERRUN_FADE_SAMPLES};
pub use presets::{catalog, find as find_preset, Preset, PresetBinder, PresetCategory};
pub use status::{PipelineState, PipelineStatus};
pub use throttle::LogThrottle;

pub use voxmorph_effects::StageKind;
