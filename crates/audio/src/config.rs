//! Fixed run configuration of a pipeline.

use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use voxmorph_effects::StageKind;

use crate::{Error, Result};

const MAX_SAMPLE_RATE: u32 = 384_000;
const MIN_FRAME_SIZE: usize = 64;
const MIN_OVERLAP: usize = 4;

/// Who drives the processing tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// A dedicated worker thread polls at half the hop duration.
    #[default]
    Thread,
    /// The host calls [`crate::AudioPipeline::tick`] itself.
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub version: u32,
    pub sample_rate: u32,
    /// Interleaved device channels (1 or 2). Processing itself is mono.
    pub channels: usize,
    /// Expected device callback size in frames.
    pub block_size: usize,
    pub frame_size: usize,
    pub hop_size: usize,
    pub target_latency_ms: u32,
    /// Hops of silence queued for playback at start.
    pub playback_prefill_hops: usize,
    pub cepstral_order: usize,
    pub input_gain_db: f32,
    pub soft_clip_input: bool,
    pub stage_order: Vec<StageKind>,
    pub processing: ProcessingMode,
    pub stop_timeout_ms: u64,
    pub status_log_interval_ms: u64,
}

impl PipelineConfig {
    pub const CURRENT_VERSION: u32 = 1;

    /// Reads a JSON config. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        if config.version != Self::CURRENT_VERSION {
            tracing::warn!(
                "Config version {} does not match current version {}",
                config.version,
                Self::CURRENT_VERSION
            );
        }

        config.validate().context("invalid pipeline config")?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path.as_ref(), data).context("failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return invalid(format!("sample rate {} out of range", self.sample_rate));
        }
        if !(1..=2).contains(&self.channels) {
            return invalid(format!("{} channels unsupported (1 or 2)", self.channels));
        }
        if self.block_size == 0 {
            return invalid("block size must be non-zero".into());
        }
        if !self.frame_size.is_power_of_two() || self.frame_size < MIN_FRAME_SIZE {
            return invalid(format!(
                "frame size {} must be a power of two >= {}",
                self.frame_size, MIN_FRAME_SIZE
            ));
        }
        if self.hop_size == 0 || self.frame_size % self.hop_size != 0 {
            return invalid(format!(
                "hop size {} must divide frame size {}",
                self.hop_size, self.frame_size
            ));
        }
        if self.frame_size / self.hop_size < MIN_OVERLAP {
            return invalid(format!(
                "overlap factor {} below {}",
                self.frame_size / self.hop_size,
                MIN_OVERLAP
            ));
        }
        if self.cepstral_order == 0 || self.cepstral_order >= self.frame_size / 2 {
            return invalid(format!(
                "cepstral order {} must be in 1..{}",
                self.cepstral_order,
                self.frame_size / 2
            ));
        }
        if !self.input_gain_db.is_finite() {
            return invalid("input gain must be finite".into());
        }
        let is_permutation = self.stage_order.len() == StageKind::ALL.len()
            && StageKind::ALL
                .iter()
                .all(|kind| self.stage_order.contains(kind));
        if !is_permutation {
            return invalid(format!(
                "stage order {:?} must list each stage exactly once",
                self.stage_order
            ));
        }
        Ok(())
    }

    pub fn hop_duration(&self) -> Duration {
        Duration::from_secs_f64(self.hop_size as f64 / self.sample_rate.max(1) as f64)
    }

    /// Ring capacity: at least twice the larger of the target latency and one frame.
    pub fn ring_capacity(&self) -> usize {
        let target = (self.target_latency_ms as u64 * self.sample_rate as u64 / 1000) as usize;
        let worst = target
            .max(self.frame_size)
            .max(self.block_size)
            .max(self.playback_prefill_hops * self.hop_size);
        (2 * worst).next_power_of_two()
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            sample_rate: 44_100,
            channels: 1,
            block_size: 1_024,
            frame_size: 1_024,
            hop_size: 256,
            target_latency_ms: 120,
            playback_prefill_hops: 2,
            cepstral_order: 30,
            input_gain_db: 0.0,
            soft_clip_input: true,
            stage_order: vec![
                StageKind::Distortion,
                StageKind::Chorus,
                StageKind::Reverb,
                StageKind::Delay,
                StageKind::Compressor,
            ],
            processing: ProcessingMode::Thread,
            stop_timeout_ms: 500,
            status_log_interval_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        // 120 ms at 44.1 kHz is 5292 samples; doubled and rounded up.
        assert_eq!(config.ring_capacity(), 16_384);
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut config = PipelineConfig {
            frame_size: 1_000,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.frame_size = 1_024;
        config.hop_size = 512;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.hop_size = 300;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_incomplete_stage_order() {
        let config = PipelineConfig {
            stage_order: vec![StageKind::Reverb, StageKind::Reverb],
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"sample_rate": 48000, "processing": "external"}"#)
                .expect("valid json");
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.processing, ProcessingMode::External);
        assert_eq!(config.hop_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn save_then_load_preserves_config() {
        let path = std::env::temp_dir().join(format!("voxmorph-config-{}.json", std::process::id()));
        let config = PipelineConfig {
            sample_rate: 48_000,
            channels: 2,
            input_gain_db: 6.0,
            ..PipelineConfig::default()
        };
        config.save(&path).expect("save config");
        let loaded = PipelineConfig::load(&path).expect("load config");
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = PipelineConfig::load("/nonexistent/voxmorph.json").expect("defaults");
        assert_eq!(loaded, PipelineConfig::default());
    }
}
