//! Device-side ends of the pipeline.
//!
//! Both ports are called from audio device callbacks. They never block, allocate or log:
//! each call is a bounded loop over preallocated scratch plus one ring transfer per chunk.

use std::sync::Arc;

use voxmorph_dsp::{sanitize_sample, Consumer, Producer, Sample};

use crate::status::Shared;

/// Samples over which the last output value fades to zero on underrun.
pub const UNDERRUN_FADE_SAMPLES: usize = 64;

/// Ports handed to the device layer by [`crate::AudioPipeline::start`].
pub struct DevicePorts {
    pub capture: CapturePort,
    pub playback: PlaybackPort,
}

/// Receives interleaved input blocks and feeds the capture ring.
pub struct CapturePort {
    producer: Producer,
    shared: Arc<Shared>,
    channels: usize,
    input_gain: f32,
    soft_clip: bool,
    scratch: Box<[Sample]>,
}

impl CapturePort {
    pub(crate) fn new(
        producer: Producer,
        shared: Arc<Shared>,
        channels: usize,
        block_size: usize,
        input_gain: f32,
        soft_clip: bool,
    ) -> Self {
        Self {
            producer,
            shared,
            channels: channels.max(1),
            input_gain,
            soft_clip,
            scratch: vec![0.0; block_size.max(1)].into_boxed_slice(),
        }
    }

    /// Downmixes `interleaved` to mono, conditions it and queues it for processing.
    ///
    /// Returns the number of frames queued. Input is discarded unless the pipeline is running.
    /// A trailing partial frame is ignored.
    pub fn write(&mut self, interleaved: &[Sample]) -> usize {
        if !self.shared.is_running() {
            return 0;
        }
        let channels = self.channels;
        let scale = self.input_gain / channels as f32;
        let mut queued = 0;
        for chunk in interleaved.chunks(self.scratch.len() * channels) {
            let frames = chunk.len() / channels;
            for (out, frame) in self.scratch[..frames]
                .iter_mut()
                .zip(chunk.chunks_exact(channels))
            {
                let mono = frame.iter().map(|&s| sanitize_sample(s)).sum::<Sample>() * scale;
                *out = if self.soft_clip { mono.tanh() } else { mono };
            }
            queued += self.producer.write(&self.scratch[..frames]);
        }
        queued
    }
}

/// Fills interleaved output blocks from the playback ring.
pub struct PlaybackPort {
    consumer: Consumer,
    shared: Arc<Shared>,
    channels: usize,
    scratch: Box<[Sample]>,
    /// Last sample taken from the ring; the underrun fade starts here.
    last: Sample,
    fade_pos: usize,
}

impl PlaybackPort {
    pub(crate) fn new(
        consumer: Consumer,
        shared: Arc<Shared>,
        channels: usize,
        block_size: usize,
    ) -> Self {
        Self {
            consumer,
            shared,
            channels: channels.max(1),
            scratch: vec![0.0; block_size.max(1)].into_boxed_slice(),
            last: 0.0,
            fade_pos: UNDERRUN_FADE_SAMPLES,
        }
    }

    /// Fills `interleaved`, duplicating the mono signal into every channel.
    ///
    /// Returns the number of frames taken from the ring. A shortfall while running counts one
    /// underrun per call and is covered by a short fade to silence.
    pub fn read(&mut self, interleaved: &mut [Sample]) -> usize {
        if !self.shared.is_running() {
            interleaved.fill(0.0);
            return 0;
        }
        let channels = self.channels;
        let mut delivered = 0;
        let mut starved = false;
        for chunk in interleaved.chunks_mut(self.scratch.len() * channels) {
            let frames = chunk.len() / channels;
            let got = self.consumer.read(&mut self.scratch[..frames]);
            if got > 0 {
                self.last = self.scratch[got - 1];
                self.fade_pos = 0;
            }
            if got < frames {
                starved = true;
                for i in got..frames {
                    let faded = self.fade_next();
                    self.scratch[i] = faded;
                }
            }
            delivered += got;

            for (frame, &mono) in chunk.chunks_exact_mut(channels).zip(&self.scratch[..frames]) {
                frame.fill(mono);
            }
            chunk[frames * channels..].fill(0.0);
        }
        if starved {
            self.shared.record_underrun();
        }
        delivered
    }

    fn fade_next(&mut self) -> Sample {
        if self.fade_pos >= UNDERRUN_FADE_SAMPLES {
            return 0.0;
        }
        self.fade_pos += 1;
        let remaining = 1.0 - self.fade_pos as Sample / UNDERRUN_FADE_SAMPLES as Sample;
        self.last * remaining
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use voxmorph_dsp::{OverflowPolicy, RingBuffer};

    use super::*;
    use crate::PipelineState;

    fn running() -> Arc<Shared> {
        let shared = Arc::new(Shared::new());
        shared.set_state(PipelineState::Running);
        shared
    }

    #[test]
    fn capture_downmixes_stereo() {
        let shared = running();
        let (producer, mut consumer) = RingBuffer::with_capacity(64, OverflowPolicy::DropOldest);
        let mut port = CapturePort::new(producer, shared, 2, 4, 1.0, false);

        let queued = port.write(&[0.2, 0.4, -0.5, 0.5, 1.0, 0.0, 0.3, 0.3, 0.1, 0.1, 9.0]);
        assert_eq!(queued, 5);

        let mut out = [0.0; 5];
        assert_eq!(consumer.read(&mut out), 5);
        for (got, want) in out.iter().zip([0.3, 0.0, 0.5, 0.3, 0.1]) {
            assert_relative_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn capture_soft_clips_after_gain() {
        let shared = running();
        let (producer, mut consumer) = RingBuffer::with_capacity(8, OverflowPolicy::DropOldest);
        let mut port = CapturePort::new(producer, shared, 1, 8, 4.0, true);
        port.write(&[0.5, f32::NAN]);
        let mut out = [0.0; 2];
        consumer.read(&mut out);
        assert_relative_eq!(out[0], 2.0f32.tanh(), epsilon = 1e-6);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn ports_are_inert_when_not_running() {
        let shared = Arc::new(Shared::new());
        let (producer, consumer) = RingBuffer::with_capacity(8, OverflowPolicy::DropOldest);
        let mut capture = CapturePort::new(producer, Arc::clone(&shared), 1, 8, 1.0, false);
        let mut playback = PlaybackPort::new(consumer, Arc::clone(&shared), 1, 8);

        assert_eq!(capture.write(&[0.5; 4]), 0);
        let mut out = [1.0; 4];
        assert_eq!(playback.read(&mut out), 0);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(shared.underruns(), 0);
    }

    #[test]
    fn underrun_fades_out_and_counts_once_per_call() {
        let shared = running();
        let (mut producer, consumer) = RingBuffer::with_capacity(256, OverflowPolicy::DropNewest);
        let mut playback = PlaybackPort::new(consumer, Arc::clone(&shared), 2, 32);
        producer.write(&[0.8; 10]);

        let mut out = vec![0.0; 2 * 200];
        assert_eq!(playback.read(&mut out), 10);
        assert_eq!(shared.underruns(), 1);

        let left: Vec<f32> = out.iter().step_by(2).copied().collect();
        assert_eq!(&out[0..2], &[0.8, 0.8]);
        assert!(left[10] < 0.8 && left[10] > 0.7);
        for pair in left[10..10 + UNDERRUN_FADE_SAMPLES].windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert!(left[10 + UNDERRUN_FADE_SAMPLES..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn playback_resumes_in_order_after_starvation() {
        let shared = running();
        let (mut producer, consumer) = RingBuffer::with_capacity(64, OverflowPolicy::DropNewest);
        let mut playback = PlaybackPort::new(consumer, Arc::clone(&shared), 1, 16);

        let mut out = [0.0; 8];
        playback.read(&mut out);
        assert_eq!(shared.underruns(), 1);

        producer.write(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = [0.0; 4];
        assert_eq!(playback.read(&mut out), 4);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(shared.underruns(), 1);
    }
}
