//! Lifecycle and control surface of a running voice pipeline.

use std::{
    str::FromStr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};
use voxmorph_dsp::{db_to_linear, OverflowPolicy, RingBuffer};
use voxmorph_effects::StageKind;

use crate::{
    ports::{CapturePort, DevicePorts, PlaybackPort},
    processor::Processor,
    status::Shared,
    Error, ParameterSet, ParameterStore, PipelineConfig, PipelineState, PipelineStatus,
    PresetBinder, ProcessingMode, Result,
};

struct Worker {
    handle: JoinHandle<()>,
    wake: Sender<()>,
    exited: Receiver<()>,
}

struct Lifecycle {
    config: PipelineConfig,
    worker: Option<Worker>,
}

/// Orchestrates capture, processing and playback for one device configuration.
///
/// All methods take `&self` and may be called from any non-real-time thread. Parameter
/// setters publish a new snapshot that the processor adopts at its next frame boundary.
pub struct AudioPipeline {
    lifecycle: Mutex<Lifecycle>,
    /// Processor driven by [`AudioPipeline::tick`] in external mode.
    external: Mutex<Option<Processor>>,
    params: Arc<ParameterStore>,
    /// Status of the current (or last) run; replaced on every start.
    shared: ArcSwap<Shared>,
}

impl AudioPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            lifecycle: Mutex::new(Lifecycle {
                config,
                worker: None,
            }),
            external: Mutex::new(None),
            params: Arc::new(ParameterStore::default()),
            shared: ArcSwap::from_pointee(Shared::new()),
        })
    }

    pub fn config(&self) -> PipelineConfig {
        self.lifecycle.lock().config.clone()
    }

    /// Replaces the run configuration. Only allowed while stopped.
    pub fn reconfigure(&self, config: PipelineConfig) -> Result<()> {
        let mut life = self.lifecycle.lock();
        let state = self.state();
        if !matches!(state, PipelineState::Stopped | PipelineState::Error) {
            return Err(Error::InvalidState {
                operation: "reconfigure",
                state,
            });
        }
        config.validate()?;
        info!(
            sample_rate = config.sample_rate,
            frame_size = config.frame_size,
            hop_size = config.hop_size,
            "pipeline reconfigured"
        );
        life.config = config;
        Ok(())
    }

    /// Allocates fresh buffers and DSP state and begins processing.
    ///
    /// The returned ports belong to the device layer: feed capture callbacks into
    /// [`CapturePort::write`] and serve playback callbacks from [`PlaybackPort::read`].
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<DevicePorts> {
        let mut life = self.lifecycle.lock();
        let state = self.state();
        if !matches!(state, PipelineState::Stopped | PipelineState::Error) {
            return Err(Error::InvalidState {
                operation: "start",
                state,
            });
        }
        let config = life.config.clone();
        config.validate()?;

        let capacity = config.ring_capacity();
        let (capture_tx, capture_rx) = RingBuffer::with_capacity(capacity, OverflowPolicy::DropOldest);
        let (mut playback_tx, playback_rx) =
            RingBuffer::with_capacity(capacity, OverflowPolicy::DropNewest);
        playback_tx.write_silence(config.playback_prefill_hops * config.hop_size);
        let shared = Arc::new(Shared::for_run(capture_rx.monitor(), playback_tx.monitor()));
        self.shared.store(Arc::clone(&shared));

        let processor = Processor::new(
            &config,
            capture_rx,
            playback_tx,
            Arc::clone(&self.params),
            Arc::clone(&shared),
        );
        match config.processing {
            ProcessingMode::Thread => match spawn_worker(processor, config.hop_duration() / 2) {
                Ok(worker) => life.worker = Some(worker),
                Err(err) => {
                    shared.set_state(PipelineState::Error);
                    shared.set_last_error(err.to_string());
                    error!("failed to spawn processing thread: {}", err);
                    return Err(Error::Spawn(err));
                }
            },
            ProcessingMode::External => *self.external.lock() = Some(processor),
        }

        let ports = DevicePorts {
            capture: CapturePort::new(
                capture_tx,
                Arc::clone(&shared),
                config.channels,
                config.block_size,
                db_to_linear(config.input_gain_db),
                config.soft_clip_input,
            ),
            playback: PlaybackPort::new(
                playback_rx,
                Arc::clone(&shared),
                config.channels,
                config.block_size,
            ),
        };
        shared.set_state(PipelineState::Running);
        info!(
            sample_rate = config.sample_rate,
            channels = config.channels,
            frame_size = config.frame_size,
            hop_size = config.hop_size,
            ring_capacity = capacity,
            mode = ?config.processing,
            "pipeline started"
        );
        Ok(ports)
    }

    /// Stops processing and discards unread input. Safe to call in any state.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        let mut life = self.lifecycle.lock();
        let shared = self.shared.load_full();
        if matches!(shared.state(), PipelineState::Stopped | PipelineState::Error) {
            return;
        }
        self.shutdown(&mut life, &shared);
        shared.set_state(PipelineState::Stopped);
        info!(
            underruns = shared.underruns(),
            overruns = shared.overruns(),
            frames = shared.frames_processed(),
            "pipeline stopped"
        );
    }

    /// Records a fatal device failure: the pipeline stops cleanly and enters `Error`.
    pub fn report_device_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut life = self.lifecycle.lock();
        let shared = self.shared.load_full();
        if matches!(
            shared.state(),
            PipelineState::Starting | PipelineState::Running | PipelineState::Stopping
        ) {
            self.shutdown(&mut life, &shared);
        }
        error!("{}", Error::DeviceUnavailable(message.clone()));
        shared.set_last_error(message);
        shared.set_state(PipelineState::Error);
    }

    /// Message recorded with the last transition to `Error`.
    pub fn last_error(&self) -> Option<String> {
        self.shared.load().last_error()
    }

    fn shutdown(&self, life: &mut Lifecycle, shared: &Shared) {
        shared.set_state(PipelineState::Stopping);
        shared.request_stop();

        if let Some(worker) = life.worker.take() {
            let _ = worker.wake.try_send(());
            match worker.exited.recv_timeout(life.config.stop_timeout()) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        error!("processing thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        timeout_ms = life.config.stop_timeout_ms,
                        "processing thread did not stop in time; detaching"
                    );
                }
            }
        }

        if let Some(mut processor) = self.external.lock().take() {
            processor.finish();
        }
    }

    /// Runs one processing tick in [`ProcessingMode::External`].
    ///
    /// Returns the number of frames produced; 0 when not running or in thread mode.
    pub fn tick(&self) -> usize {
        if !self.shared.load().is_running() {
            return 0;
        }
        match self.external.try_lock() {
            Some(mut guard) => guard.as_mut().map_or(0, |processor| processor.tick()),
            None => 0,
        }
    }

    /// Sets the pitch shift in semitones and returns the applied (clamped) value.
    pub fn set_pitch(&self, semitones: f32) -> f32 {
        let applied = ParameterSet::clamp_pitch(semitones);
        warn_if_clamped("pitch", semitones, applied);
        self.params.update(|p| p.pitch_semitones = applied);
        applied
    }

    /// Sets the formant ratio and returns the applied (clamped) value.
    pub fn set_formant(&self, ratio: f32) -> f32 {
        let applied = ParameterSet::clamp_formant(ratio);
        warn_if_clamped("formant", ratio, applied);
        self.params.update(|p| p.formant_ratio = applied);
        applied
    }

    pub fn set_volume(&self, volume: f32) -> f32 {
        let applied = ParameterSet::clamp_volume(volume);
        warn_if_clamped("volume", volume, applied);
        self.params.update(|p| p.volume = applied);
        applied
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.params.update(|p| p.bypass = bypass);
    }

    pub fn set_stage_enabled(&self, stage: StageKind, enabled: bool) {
        self.params
            .update(|p| p.effects.set_enabled(stage, enabled));
    }

    /// Sets a stage parameter by id, clamping into range. Returns the applied value.
    pub fn set_stage_param(&self, stage: StageKind, name: &str, value: f32) -> Result<f32> {
        let applied = self
            .params
            .try_update(|p| p.effects.set_param(stage, name, value))?;
        Ok(applied)
    }

    /// [`AudioPipeline::set_stage_param`] with the stage given by id or display name.
    pub fn set_stage_param_by_id(&self, stage_id: &str, name: &str, value: f32) -> Result<f32> {
        let stage = StageKind::from_str(stage_id)?;
        self.set_stage_param(stage, name, value)
    }

    pub fn apply_preset(&self, name: &str) -> Result<ParameterSet> {
        PresetBinder::new(&self.params).apply(name)
    }

    /// Current live parameter snapshot.
    pub fn params(&self) -> ParameterSet {
        self.params.snapshot()
    }

    pub fn state(&self) -> PipelineState {
        self.shared.load().state()
    }

    pub fn underrun_count(&self) -> u64 {
        self.shared.load().underruns()
    }

    pub fn overrun_count(&self) -> u64 {
        self.shared.load().overruns()
    }

    pub fn latency_estimate_ms(&self) -> f32 {
        self.shared.load().latency_ms()
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.load().snapshot()
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn warn_if_clamped(name: &str, requested: f32, applied: f32) {
    if requested != applied {
        warn!("{} clamped from {} to {}", name, requested, applied);
    }
}

fn spawn_worker(mut processor: Processor, poll: Duration) -> std::io::Result<Worker> {
    let (wake_tx, wake_rx) = bounded::<()>(1);
    let (exit_tx, exit_rx) = bounded::<()>(1);
    let handle = thread::Builder::new()
        .name("voxmorph-dsp".into())
        .spawn(move || {
            loop {
                processor.tick();
                match wake_rx.recv_timeout(poll) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            processor.finish();
            let _ = exit_tx.send(());
        })?;
    Ok(Worker {
        handle,
        wake: wake_tx,
        exited: exit_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external() -> AudioPipeline {
        AudioPipeline::new(PipelineConfig {
            processing: ProcessingMode::External,
            ..PipelineConfig::default()
        })
        .expect("valid config")
    }

    #[test]
    fn lifecycle_transitions() {
        let pipeline = external();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        let _ports = pipeline.start().expect("start");
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert!(matches!(
            pipeline.start(),
            Err(Error::InvalidState {
                operation: "start",
                state: PipelineState::Running
            })
        ));
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn start_prefills_playback() {
        let pipeline = external();
        let mut ports = pipeline.start().expect("start");
        let mut out = vec![1.0; 512];
        assert_eq!(ports.playback.read(&mut out), 512);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(pipeline.underrun_count(), 0);
    }

    #[test]
    fn device_error_enters_error_state_and_allows_restart() {
        let pipeline = external();
        let mut ports = pipeline.start().expect("start");
        pipeline.report_device_error("input device unplugged");
        assert_eq!(pipeline.state(), PipelineState::Error);
        assert_eq!(
            pipeline.last_error().as_deref(),
            Some("input device unplugged")
        );
        assert_eq!(ports.capture.write(&[0.5; 64]), 0);
        assert_eq!(pipeline.tick(), 0);

        let _ports = pipeline.start().expect("restart from error");
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert!(pipeline.last_error().is_none());
    }

    #[test]
    fn each_run_gets_its_own_status() {
        let pipeline = external();
        let mut first = pipeline.start().expect("start");
        let stale = pipeline.shared.load_full();
        pipeline.stop();
        let _second = pipeline.start().expect("restart");

        // A processor or port detached from the first run keeps writing to that run only.
        stale.record_frame();
        stale.record_underrun();
        stale.publish_latency(500.0);
        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Running);
        assert_eq!(status.frames_processed, 0);
        assert_eq!(status.underruns, 0);
        assert_eq!(status.latency_ms, 0.0);
        assert!(stale.stop_requested());
        assert!(!pipeline.shared.load().stop_requested());
        assert_eq!(first.capture.write(&[0.5; 64]), 0);
    }

    #[test]
    fn reconfigure_only_while_stopped() {
        let pipeline = external();
        let config = PipelineConfig {
            sample_rate: 48_000,
            processing: ProcessingMode::External,
            ..PipelineConfig::default()
        };
        let _ports = pipeline.start().expect("start");
        assert!(pipeline.reconfigure(config.clone()).is_err());
        pipeline.stop();
        pipeline.reconfigure(config).expect("reconfigure");
        assert_eq!(pipeline.config().sample_rate, 48_000);
    }

    #[test]
    fn setters_clamp_and_report() {
        let pipeline = external();
        assert_eq!(pipeline.set_pitch(30.0), 12.0);
        assert_eq!(pipeline.set_formant(0.1), 0.5);
        assert_eq!(pipeline.set_volume(5.0), 2.0);
        let applied = pipeline
            .set_stage_param(StageKind::Delay, "feedback", 2.0)
            .expect("known parameter");
        assert_eq!(applied, 0.95);
        assert!(pipeline
            .set_stage_param_by_id("Chorus", "rate_hz", 3.0)
            .is_ok());
        assert!(matches!(
            pipeline.set_stage_param_by_id("flanger", "rate_hz", 1.0),
            Err(Error::Parameter(_))
        ));

        let params = pipeline.params();
        assert_eq!(params.pitch_semitones, 12.0);
        assert_eq!(params.effects.delay.params.feedback, 0.95);
        assert_eq!(params.effects.chorus.params.rate_hz, 3.0);
    }

    #[test]
    fn thread_mode_processes_and_stops() {
        let pipeline = AudioPipeline::new(PipelineConfig {
            sample_rate: 8_000,
            frame_size: 256,
            hop_size: 64,
            cepstral_order: 16,
            ..PipelineConfig::default()
        })
        .expect("valid config");
        let mut ports = pipeline.start().expect("start");
        ports.capture.write(&[0.1; 64 * 8]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pipeline.status().frames_processed < 8 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pipeline.status().frames_processed, 8);
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }
}
