use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use voxmorph_audio::{catalog, AudioPipeline, PipelineConfig, ProcessingMode};
use voxmorph_effects::{voice_metadata, StageKind};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Real-time voice changer: pitch and formant shifting with an effects chain.
#[derive(Parser)]
#[command(name = "voxmorph", version, about)]
struct Args {
    /// Pipeline config file (defaults are used when it does not exist)
    #[arg(long, default_value = "voxmorph.json")]
    config: PathBuf,

    /// Preset to apply before starting, by id or name
    #[arg(long)]
    preset: Option<String>,

    /// Pitch shift in semitones, applied after the preset
    #[arg(long, allow_negative_numbers = true)]
    pitch: Option<f32>,

    /// Formant ratio, applied after the preset
    #[arg(long)]
    formant: Option<f32>,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 10.0)]
    seconds: f32,

    /// Print presets and parameter ranges, then exit
    #[arg(long)]
    list: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    if args.list {
        print_catalog();
        return Ok(());
    }

    let config = PipelineConfig::load(&args.config).context("failed to load pipeline config")?;
    let pipeline = Arc::new(AudioPipeline::new(config).context("failed to create pipeline")?);

    if let Some(preset) = &args.preset {
        pipeline
            .apply_preset(preset)
            .with_context(|| format!("failed to apply preset `{preset}`"))?;
    }
    if let Some(pitch) = args.pitch {
        pipeline.set_pitch(pitch);
    }
    if let Some(formant) = args.formant {
        pipeline.set_formant(formant);
    }

    run(&pipeline, Duration::from_secs_f32(args.seconds.max(0.0)))?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_catalog() {
    println!("Presets:");
    for preset in catalog() {
        println!(
            "  {:<12} {:<12} [{}] {}",
            preset.id,
            preset.name,
            preset.category.name(),
            preset.description
        );
    }
    println!("\nParameters:");
    let stages = std::iter::once(voice_metadata())
        .chain(StageKind::ALL.into_iter().map(StageKind::metadata));
    for metadata in stages {
        println!("  {}", metadata.id);
        for spec in metadata.parameters.iter() {
            println!(
                "    {:<14} {:>8.2} .. {:<8.2} (default {})",
                spec.id, spec.range.min, spec.range.max, spec.default
            );
        }
    }
}

/// Keeps the pipeline alive for `duration`, ticking it in external mode and logging status.
fn supervise(pipeline: &AudioPipeline, duration: Duration) {
    let config = pipeline.config();
    let poll = config.hop_duration() / 2;
    let deadline = Instant::now() + duration;
    let mut next_status = Instant::now() + STATUS_INTERVAL;

    while Instant::now() < deadline {
        if config.processing == ProcessingMode::External {
            pipeline.tick();
        }
        if Instant::now() >= next_status {
            let status = pipeline.status();
            info!(
                state = %status.state,
                latency_ms = status.latency_ms,
                underruns = status.underruns,
                overruns = status.overruns,
                frames = status.frames_processed,
                "status"
            );
            next_status += STATUS_INTERVAL;
        }
        thread::sleep(poll);
    }
}

/// Drives the pipeline from a synthetic voice-like source, standing in for a duplex device.
#[cfg(not(feature = "cpal"))]
fn run(pipeline: &Arc<AudioPipeline>, duration: Duration) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicBool, Ordering};

    let config = pipeline.config();
    let voxmorph_audio::DevicePorts {
        mut capture,
        mut playback,
    } = pipeline.start().context("failed to start pipeline")?;

    let running = Arc::new(AtomicBool::new(true));
    let device = {
        let running = Arc::clone(&running);
        let channels = config.channels;
        let sample_rate = config.sample_rate as f64;
        let period = Duration::from_secs_f64(config.block_size as f64 / sample_rate);
        let mut input = vec![0.0f32; config.block_size * channels];
        let mut output = vec![0.0f32; config.block_size * channels];
        thread::Builder::new()
            .name("voxmorph-device".into())
            .spawn(move || {
                let mut source = SyntheticVoice::new(140.0, sample_rate);
                let mut energy = 0.0f64;
                let mut count = 0usize;
                while running.load(Ordering::Acquire) {
                    for frame in input.chunks_exact_mut(channels) {
                        frame.fill(source.next_sample());
                    }
                    capture.write(&input);
                    playback.read(&mut output);
                    energy += output.iter().map(|&s| (s as f64).powi(2)).sum::<f64>();
                    count += output.len();
                    thread::sleep(period);
                }
                (energy / count.max(1) as f64).sqrt()
            })
            .context("failed to spawn device thread")?
    };

    supervise(pipeline, duration);
    running.store(false, Ordering::Release);
    match device.join() {
        Ok(rms) => info!(output_rms = rms, "synthetic device finished"),
        Err(_) => bail!("synthetic device thread panicked"),
    }
    pipeline.stop();
    Ok(())
}

/// Binds the pipeline to the default input and output devices.
#[cfg(feature = "cpal")]
fn run(pipeline: &Arc<AudioPipeline>, duration: Duration) -> anyhow::Result<()> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use voxmorph_audio::{DevicePorts, Error};

    let host = cpal::default_host();
    let input = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no default input device".into()))?;
    let output = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no default output device".into()))?;
    let input_config = input
        .default_input_config()
        .context("failed to query input config")?;
    if input_config.sample_format() != cpal::SampleFormat::F32 {
        bail!("only f32 devices are supported");
    }

    let mut config = pipeline.config();
    config.sample_rate = input_config.sample_rate().0;
    pipeline
        .reconfigure(config.clone())
        .context("failed to adopt device sample rate")?;
    let stream_config = cpal::StreamConfig {
        channels: config.channels as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let DevicePorts {
        mut capture,
        mut playback,
    } = pipeline.start().context("failed to start pipeline")?;

    let input_errors = Arc::clone(pipeline);
    let input_stream = input
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                capture.write(data);
            },
            move |err| input_errors.report_device_error(format!("input stream: {err}")),
            None,
        )
        .context("failed to build input stream")?;
    let output_errors = Arc::clone(pipeline);
    let output_stream = output
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                playback.read(data);
            },
            move |err| output_errors.report_device_error(format!("output stream: {err}")),
            None,
        )
        .context("failed to build output stream")?;

    input_stream.play().context("failed to start input stream")?;
    output_stream.play().context("failed to start output stream")?;
    info!(
        input = input.name().unwrap_or_else(|_| "unknown-input".into()),
        output = output.name().unwrap_or_else(|_| "unknown-output".into()),
        sample_rate = config.sample_rate,
        "streaming"
    );

    supervise(pipeline, duration);
    drop(input_stream);
    drop(output_stream);
    pipeline.stop();
    Ok(())
}

/// Band-limited pulse train shaped by two vowel-like resonances.
#[cfg(not(feature = "cpal"))]
struct SyntheticVoice {
    phase: f64,
    increment: f64,
    gains: Vec<f64>,
}

#[cfg(not(feature = "cpal"))]
impl SyntheticVoice {
    const FORMANTS_HZ: [f64; 2] = [700.0, 1_200.0];
    const BANDWIDTH_HZ: f64 = 200.0;
    const MAX_HZ: f64 = 4_000.0;

    fn new(f0: f64, sample_rate: f64) -> Self {
        let top = Self::MAX_HZ.min(sample_rate / 2.0);
        let harmonics = ((top / f0) as usize).max(1);
        let gains = (1..=harmonics)
            .map(|k| {
                let freq = k as f64 * f0;
                let resonance: f64 = Self::FORMANTS_HZ
                    .iter()
                    .map(|&formant| (-((freq - formant) / Self::BANDWIDTH_HZ).powi(2)).exp())
                    .sum();
                (resonance + 0.1) / k as f64
            })
            .collect();
        Self {
            phase: 0.0,
            increment: f0 / sample_rate,
            gains,
        }
    }

    fn next_sample(&mut self) -> f32 {
        let sum: f64 = self
            .gains
            .iter()
            .enumerate()
            .map(|(i, gain)| gain * (std::f64::consts::TAU * (i + 1) as f64 * self.phase).sin())
            .sum();
        self.phase = (self.phase + self.increment).fract();
        (0.2 * sum) as f32
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_flags_with_defaults() {
        let args = Args::try_parse_from(["voxmorph", "--preset", "woman", "--pitch", "-5"])
            .expect("valid arguments");
        assert_eq!(args.preset.as_deref(), Some("woman"));
        assert_eq!(args.pitch, Some(-5.0));
        assert_eq!(args.formant, None);
        assert_eq!(args.seconds, 10.0);
        assert_eq!(args.config, PathBuf::from("voxmorph.json"));
        assert!(!args.list);
    }

    #[test]
    fn rejects_unknown_flags_and_bad_numbers() {
        assert!(Args::try_parse_from(["voxmorph", "--octave", "1"]).is_err());
        assert!(Args::try_parse_from(["voxmorph", "--seconds", "soon"]).is_err());
    }
}
