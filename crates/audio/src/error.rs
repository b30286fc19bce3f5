//! Error types for voxmorph-audio.

use thiserror::Error;
use voxmorph_dsp::ParameterError;

use crate::PipelineState;

/// Errors surfaced at the control boundary. The processing tick never returns one.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown preset `{0}`")]
    UnknownPreset(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("operation `{operation}` not allowed while pipeline is {state}")]
    InvalidState {
        operation: &'static str,
        state: PipelineState,
    },

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error("failed to spawn processing thread")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
