//! Overlapping analysis frames in, continuous stream out.
//!
//! The scheduler keeps the last `frame_size` input samples. Each time `hop_size` fresh
//! samples have been written it can hand out a windowed analysis frame. On the way back a
//! processed frame is weighted by the synthesis window and overlap-added into an
//! accumulator whose first `hop_size` samples are then final.
//!
//! The synthesis window is normalised per position so that the product of both windows sums
//! to exactly one across all overlapping frames. An unmodified frame therefore comes back out
//! bit-for-bit up to float rounding, delayed by `frame_size - hop_size` samples.

use std::f32::consts::PI;

use crate::Sample;

/// Periodic Hann window of length `len`.
pub fn hann_window(len: usize) -> Vec<Sample> {
    (0..len)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / len as f32).cos())
        .collect()
}

pub struct FrameScheduler {
    frame_size: usize,
    hop_size: usize,
    history: Vec<Sample>,
    fill: usize,
    analysis_window: Vec<Sample>,
    synthesis_window: Vec<Sample>,
    accumulator: Vec<Sample>,
}

impl FrameScheduler {
    /// Creates a scheduler for the given geometry.
    ///
    /// `hop_size` must be non-zero and divide `frame_size`; callers validate configuration first.
    pub fn new(frame_size: usize, hop_size: usize) -> Self {
        debug_assert!(hop_size > 0 && frame_size % hop_size == 0);
        let analysis_window = hann_window(frame_size);

        let mut overlap_energy = vec![0.0f32; hop_size];
        for (n, w) in analysis_window.iter().enumerate() {
            overlap_energy[n % hop_size] += w * w;
        }
        let synthesis_window = analysis_window
            .iter()
            .enumerate()
            .map(|(n, &w)| {
                let energy = overlap_energy[n % hop_size];
                if energy > 1e-9 {
                    w / energy
                } else {
                    0.0
                }
            })
            .collect();

        Self {
            frame_size,
            hop_size,
            history: vec![0.0; frame_size],
            fill: 0,
            analysis_window,
            synthesis_window,
            accumulator: vec![0.0; frame_size],
        }
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    #[inline]
    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Samples written since the last frame was taken.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.fill
    }

    /// Algorithmic delay between an input sample and its reconstructed output.
    #[inline]
    pub fn latency_samples(&self) -> usize {
        self.frame_size - self.hop_size
    }

    /// Appends new input and returns how many samples were accepted.
    ///
    /// At most one hop is accepted between calls to [`FrameScheduler::take_frame`].
    pub fn write_input(&mut self, samples: &[Sample]) -> usize {
        let count = samples.len().min(self.hop_size - self.fill);
        let start = self.frame_size - self.hop_size + self.fill;
        self.history[start..start + count].copy_from_slice(&samples[..count]);
        self.fill += count;
        count
    }

    #[inline]
    pub fn frame_ready(&self) -> bool {
        self.fill == self.hop_size
    }

    /// Copies the windowed analysis frame into `frame` and advances by one hop.
    ///
    /// Returns `false` and leaves `frame` untouched when a full hop has not arrived yet.
    pub fn take_frame(&mut self, frame: &mut [Sample]) -> bool {
        if !self.frame_ready() {
            return false;
        }
        for ((out, &x), &w) in frame
            .iter_mut()
            .zip(&self.history)
            .zip(&self.analysis_window)
        {
            *out = x * w;
        }
        self.history.copy_within(self.hop_size.., 0);
        self.fill = 0;
        true
    }

    /// Overlap-adds a synthesised frame and writes the finished hop into `output`.
    pub fn overlap_add(&mut self, frame: &[Sample], output: &mut [Sample]) {
        for ((acc, &x), &w) in self
            .accumulator
            .iter_mut()
            .zip(frame)
            .zip(&self.synthesis_window)
        {
            *acc += x * w;
        }
        let hop = self.hop_size;
        output[..hop].copy_from_slice(&self.accumulator[..hop]);
        self.accumulator.copy_within(hop.., 0);
        let tail = self.frame_size - hop;
        self.accumulator[tail..].fill(0.0);
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.accumulator.fill(0.0);
        self.fill = 0;
    }
}
