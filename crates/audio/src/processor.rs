//! The processing tick: capture ring → frames → engine → effects → playback ring.

use std::{sync::Arc, time::Instant};

use tracing::warn;
use voxmorph_dsp::{sanitize, Consumer, FrameScheduler, Producer, RingMonitor, Sample, SmoothedParam};
use voxmorph_effects::{EffectsChain, PitchFormantEngine};

use crate::{status::Shared, throttle::LogThrottle, ParameterSet, ParameterStore, PipelineConfig};

const VOLUME_RAMP_MS: f32 = 20.0;
const UNDERRUN: &str = "underrun";
const OVERRUN: &str = "overrun";

/// Owns all per-run DSP state. Everything is allocated in [`Processor::new`].
pub(crate) struct Processor {
    capture: Consumer,
    playback: Producer,
    capture_monitor: RingMonitor,
    playback_monitor: RingMonitor,
    scheduler: FrameScheduler,
    engine: PitchFormantEngine,
    chain: EffectsChain,
    params: Arc<ParameterStore>,
    shared: Arc<Shared>,
    volume: SmoothedParam,
    bypassed: bool,
    input: Vec<Sample>,
    analysis: Vec<Sample>,
    synthesis: Vec<Sample>,
    block: Vec<Sample>,
    sample_rate: f32,
    throttle: LogThrottle,
    report_interval: usize,
    since_report: usize,
    reported_underruns: u64,
    reported_overruns: u64,
}

impl Processor {
    pub(crate) fn new(
        config: &PipelineConfig,
        capture: Consumer,
        playback: Producer,
        params: Arc<ParameterStore>,
        shared: Arc<Shared>,
    ) -> Self {
        let sample_rate = config.sample_rate as f32;
        let frame = config.frame_size;
        let hop = config.hop_size;
        let initial_volume = ParameterSet::clamp_volume(params.snapshot().volume);
        let report_interval =
            (config.status_log_interval_ms as usize * config.sample_rate as usize / 1000).max(hop);

        Self {
            capture_monitor: capture.monitor(),
            playback_monitor: playback.monitor(),
            capture,
            playback,
            scheduler: FrameScheduler::new(frame, hop),
            engine: PitchFormantEngine::new(frame, hop, config.cepstral_order),
            chain: EffectsChain::new(sample_rate, &config.stage_order),
            params,
            shared,
            volume: SmoothedParam::new(initial_volume, VOLUME_RAMP_MS, sample_rate),
            bypassed: false,
            input: vec![0.0; hop],
            analysis: vec![0.0; frame],
            synthesis: vec![0.0; frame],
            block: vec![0.0; hop],
            sample_rate,
            throttle: LogThrottle::new(&[UNDERRUN, OVERRUN]),
            report_interval,
            since_report: 0,
            reported_underruns: 0,
            reported_overruns: 0,
        }
    }

    /// Processes every complete hop available in the capture ring.
    ///
    /// Returns the number of frames produced. Never fails: xruns are counted, non-finite
    /// values are muted inside the stages.
    pub(crate) fn tick(&mut self) -> usize {
        let hop = self.scheduler.hop_size();
        let mut frames = 0;
        while !self.shared.stop_requested() {
            let wanted = hop - self.scheduler.buffered();
            if wanted > 0 {
                let got = self.capture.read(&mut self.input[..wanted]);
                self.scheduler.write_input(&self.input[..got]);
            }
            if !self.scheduler.frame_ready() {
                break;
            }
            self.process_frame();
            frames += 1;
        }
        self.publish_latency();
        self.report_xruns(frames * hop);
        frames
    }

    fn process_frame(&mut self) {
        let params = self.params.snapshot();
        self.scheduler.take_frame(&mut self.analysis);

        let (pitch, formant) = if params.bypass {
            (0.0, 1.0)
        } else {
            (params.pitch_semitones, params.formant_ratio)
        };
        self.engine
            .process(&self.analysis, &mut self.synthesis, pitch, formant);
        self.scheduler.overlap_add(&self.synthesis, &mut self.block);

        if params.bypass {
            if !self.bypassed {
                self.chain.reset();
                self.bypassed = true;
            }
        } else {
            self.bypassed = false;
            self.chain.process(&mut self.block, &params.effects);
        }

        self.volume
            .set_target(ParameterSet::clamp_volume(params.volume));
        for sample in &mut self.block {
            *sample *= self.volume.next();
        }
        sanitize(&mut self.block);

        self.playback.write(&self.block);
        self.shared.record_frame();
    }

    fn publish_latency(&self) {
        let playback_backlog = self.playback.capacity() - self.playback.available_to_write();
        let samples = self.capture.available_to_read()
            + self.scheduler.buffered()
            + self.scheduler.latency_samples()
            + playback_backlog;
        self.shared
            .publish_latency(samples as f32 * 1000.0 / self.sample_rate);
    }

    fn report_xruns(&mut self, processed: usize) {
        self.since_report += processed;
        if self.since_report < self.report_interval {
            return;
        }
        self.since_report = 0;
        let now = Instant::now();

        let underruns = self.shared.underruns();
        if underruns > self.reported_underruns {
            if let Some(occurrence) = self.throttle.should_log(UNDERRUN, now) {
                warn!(
                    new = underruns - self.reported_underruns,
                    total = underruns,
                    occurrence,
                    "playback underrun"
                );
            }
            self.reported_underruns = underruns;
        }

        let overruns =
            self.capture_monitor.overrun_count() + self.playback_monitor.overrun_count();
        if overruns > self.reported_overruns {
            if let Some(occurrence) = self.throttle.should_log(OVERRUN, now) {
                warn!(
                    new = overruns - self.reported_overruns,
                    total = overruns,
                    dropped = self.capture_monitor.dropped_samples()
                        + self.playback_monitor.dropped_samples(),
                    occurrence,
                    "buffer overrun"
                );
            }
            self.reported_overruns = overruns;
        }
    }

    /// Discards unread capture samples at the end of a run.
    pub(crate) fn finish(&mut self) {
        self.capture.clear();
    }
}
