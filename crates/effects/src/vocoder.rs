//! Phase-vocoder pitch shifter with independent cepstral formant shifting.
//!
//! Frames arrive already weighted by the analysis window and leave un-windowed; the
//! scheduler applies the synthesis window during overlap-add.
//!
//! Each bin's true frequency is estimated from the phase advance since the previous frame.
//! A smooth cepstral envelope is estimated from the magnitudes. Pitch shifting moves the
//! bins by `r = 2^(semitones / 12)` and then swaps each bin's source envelope for the one at
//! its destination, so resonances stay put. Formant shifting resamples that destination
//! envelope alone. A pitch-shifted frame is finally scaled back to the input frame's
//! weighted energy: remapping pulls a partial's bins apart or piles them together, which
//! leaves part of its energy at the frame edges where the synthesis window discards it.

use std::{f32::consts::PI, sync::Arc};

use num_complex::Complex32;
use once_cell::sync::Lazy;
use rustfft::{Fft, FftPlanner};
use voxmorph_dsp::{
    all_finite, hann_window, sanitize, sanitize_sample, EffectMetadata, ParameterRange,
    ParameterSpec, ParameterUnit, Sample, MIN_MAGNITUDE,
};

const TWO_PI: f32 = 2.0 * PI;
const MIN_PITCH_RATIO: f32 = 0.25;
const MAX_PITCH_RATIO: f32 = 4.0;
const MIN_FORMANT_RATIO: f32 = 0.25;
const MAX_FORMANT_RATIO: f32 = 4.0;
/// Envelope correction is bounded to about ±24 dB.
const MAX_ENVELOPE_GAIN: f32 = 16.0;
/// Level matching after a pitch shift is bounded to about ±18 dB.
const MAX_LEVEL_GAIN: f32 = 8.0;
/// Frames with less weighted energy than this are left as they are.
const LEVEL_FLOOR: f32 = 1e-12;

pub const PITCH_RANGE: ParameterRange = ParameterRange {
    min: -12.0,
    max: 12.0,
    step: 0.1,
};

pub const FORMANT_RANGE: ParameterRange = ParameterRange {
    min: 0.5,
    max: 2.0,
    step: 0.01,
};

static VOICE_PARAMS: Lazy<Vec<ParameterSpec>> = Lazy::new(|| {
    vec![
        ParameterSpec {
            id: "pitch",
            name: "Pitch",
            range: PITCH_RANGE,
            default: 0.0,
            unit: ParameterUnit::Semitones,
        },
        ParameterSpec {
            id: "formant",
            name: "Formant",
            range: FORMANT_RANGE,
            default: 1.0,
            unit: ParameterUnit::Ratio,
        },
    ]
});

static VOICE_METADATA: Lazy<Arc<EffectMetadata>> = Lazy::new(|| {
    Arc::new(EffectMetadata::new(
        "voice",
        "Pitch & Formant",
        VOICE_PARAMS.as_slice(),
    ))
});

/// Parameter metadata for the pitch and formant controls.
pub fn voice_metadata() -> &'static EffectMetadata {
    VOICE_METADATA.as_ref()
}

/// Converts a semitone offset into a frequency ratio.
#[inline]
pub fn semitones_to_ratio(semitones: f32) -> f32 {
    2.0f32.powf(semitones / 12.0)
}

#[inline]
fn wrap_phase(phase: f32) -> f32 {
    phase - TWO_PI * (phase / TWO_PI).round()
}

pub struct PitchFormantEngine {
    frame_size: usize,
    hop_size: usize,
    cepstral_order: usize,
    fft_forward: Arc<dyn Fft<f32>>,
    fft_inverse: Arc<dyn Fft<f32>>,
    forward_scratch_len: usize,
    inverse_scratch_len: usize,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    cepstrum: Vec<Complex32>,
    last_phase: Vec<f32>,
    sum_phase: Vec<f32>,
    ana_magn: Vec<f32>,
    ana_freq: Vec<f32>,
    envelope: Vec<f32>,
    syn_magn: Vec<f32>,
    syn_freq: Vec<f32>,
    syn_env: Vec<f32>,
    syn_peak: Vec<f32>,
    /// Approximates the synthesis window when comparing frame levels.
    level_weight: Vec<f32>,
}

impl PitchFormantEngine {
    /// Plans the transforms and allocates every buffer the engine will ever use.
    ///
    /// `cepstral_order` is the number of low-quefrency coefficients kept for the envelope.
    pub fn new(frame_size: usize, hop_size: usize, cepstral_order: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft_forward = planner.plan_fft_forward(frame_size);
        let fft_inverse = planner.plan_fft_inverse(frame_size);
        let forward_scratch_len = fft_forward.get_inplace_scratch_len();
        let inverse_scratch_len = fft_inverse.get_inplace_scratch_len();
        let bins = frame_size / 2 + 1;

        Self {
            frame_size,
            hop_size,
            cepstral_order: cepstral_order.clamp(1, frame_size / 2 - 1),
            fft_forward,
            fft_inverse,
            forward_scratch_len,
            inverse_scratch_len,
            scratch: vec![Complex32::new(0.0, 0.0); forward_scratch_len.max(inverse_scratch_len)],
            spectrum: vec![Complex32::new(0.0, 0.0); frame_size],
            cepstrum: vec![Complex32::new(0.0, 0.0); frame_size],
            last_phase: vec![0.0; bins],
            sum_phase: vec![0.0; bins],
            ana_magn: vec![0.0; bins],
            ana_freq: vec![0.0; bins],
            envelope: vec![1.0; bins],
            syn_magn: vec![0.0; bins],
            syn_freq: vec![0.0; bins],
            syn_env: vec![1.0; bins],
            syn_peak: vec![0.0; bins],
            level_weight: hann_window(frame_size),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Transforms one analysis frame.
    ///
    /// `input` and `output` must both be `frame_size` long. A zero shift with a unit formant
    /// ratio copies the frame through while keeping the phase history current.
    pub fn process(
        &mut self,
        input: &[Sample],
        output: &mut [Sample],
        pitch_semitones: f32,
        formant_ratio: f32,
    ) {
        let n = self.frame_size;
        let pitch_semitones = if pitch_semitones.is_finite() {
            pitch_semitones
        } else {
            0.0
        };
        let formant_ratio = if formant_ratio.is_finite() {
            formant_ratio.clamp(MIN_FORMANT_RATIO, MAX_FORMANT_RATIO)
        } else {
            1.0
        };

        for (bin, &x) in self.spectrum.iter_mut().zip(&input[..n]) {
            *bin = Complex32::new(sanitize_sample(x), 0.0);
        }
        self.fft_forward.process_with_scratch(
            &mut self.spectrum,
            &mut self.scratch[..self.forward_scratch_len],
        );
        self.analyse();

        if pitch_semitones == 0.0 && formant_ratio == 1.0 {
            for (out, &x) in output[..n].iter_mut().zip(&input[..n]) {
                *out = sanitize_sample(x);
            }
            self.sum_phase.copy_from_slice(&self.last_phase);
            return;
        }

        let ratio = semitones_to_ratio(pitch_semitones).clamp(MIN_PITCH_RATIO, MAX_PITCH_RATIO);
        self.estimate_envelope();
        self.remap_bins(ratio);
        self.synthesise(ratio, formant_ratio);

        self.fft_inverse.process_with_scratch(
            &mut self.spectrum,
            &mut self.scratch[..self.inverse_scratch_len],
        );
        let scale = 1.0 / n as f32;
        for (out, bin) in output[..n].iter_mut().zip(&self.spectrum) {
            *out = bin.re * scale;
        }

        if all_finite(&output[..n]) {
            if ratio != 1.0 {
                self.match_level(&input[..n], &mut output[..n]);
            }
            sanitize(&mut output[..n]);
        } else {
            self.reset();
            output[..n].fill(0.0);
        }
    }

    /// Clears the phase history.
    pub fn reset(&mut self) {
        self.last_phase.fill(0.0);
        self.sum_phase.fill(0.0);
        self.ana_magn.fill(0.0);
        self.ana_freq.fill(0.0);
        self.envelope.fill(1.0);
        self.syn_magn.fill(0.0);
        self.syn_freq.fill(0.0);
        self.syn_env.fill(1.0);
        self.syn_peak.fill(0.0);
    }

    /// Magnitudes plus true bin frequencies (in bins) from the phase advance.
    fn analyse(&mut self) {
        let half = self.frame_size / 2;
        let expected = TWO_PI * self.hop_size as f32 / self.frame_size as f32;
        let oversample = self.frame_size as f32 / self.hop_size as f32;

        for k in 0..=half {
            let bin = self.spectrum[k];
            let phase = bin.im.atan2(bin.re);
            let delta = wrap_phase(phase - self.last_phase[k] - k as f32 * expected);
            self.last_phase[k] = phase;

            self.ana_magn[k] = bin.norm();
            self.ana_freq[k] = k as f32 + delta * oversample / TWO_PI;
        }
    }

    /// Smooth spectral envelope from the low-quefrency part of the real cepstrum.
    fn estimate_envelope(&mut self) {
        let n = self.frame_size;
        let half = n / 2;
        let order = self.cepstral_order;

        for k in 0..n {
            let mirrored = if k <= half { k } else { n - k };
            let log_magn = self.ana_magn[mirrored].max(MIN_MAGNITUDE).ln();
            self.cepstrum[k] = Complex32::new(log_magn, 0.0);
        }
        self.fft_inverse.process_with_scratch(
            &mut self.cepstrum,
            &mut self.scratch[..self.inverse_scratch_len],
        );

        let scale = 1.0 / n as f32;
        for (q, c) in self.cepstrum.iter_mut().enumerate() {
            let keep = q <= order || q >= n - order;
            *c = if keep {
                Complex32::new(c.re * scale, 0.0)
            } else {
                Complex32::new(0.0, 0.0)
            };
        }
        self.fft_forward.process_with_scratch(
            &mut self.cepstrum,
            &mut self.scratch[..self.forward_scratch_len],
        );

        for (envelope, bin) in self.envelope.iter_mut().zip(&self.cepstrum[..=half]) {
            *envelope = bin.re.exp().max(MIN_MAGNITUDE);
        }
    }

    /// Moves bins by `ratio`. The strongest source bin sets frequency and source envelope.
    fn remap_bins(&mut self, ratio: f32) {
        let half = self.frame_size / 2;

        if ratio == 1.0 {
            self.syn_magn.copy_from_slice(&self.ana_magn);
            self.syn_freq.copy_from_slice(&self.ana_freq);
            self.syn_env.copy_from_slice(&self.envelope);
            return;
        }

        self.syn_magn.fill(0.0);
        self.syn_peak.fill(0.0);
        self.syn_env.fill(1.0);
        for (k, freq) in self.syn_freq.iter_mut().enumerate() {
            *freq = k as f32;
        }

        for k in 0..=half {
            let target = (k as f32 * ratio).round() as usize;
            if target > half {
                break;
            }
            let magn = self.ana_magn[k];
            self.syn_magn[target] += magn;
            if magn > self.syn_peak[target] {
                self.syn_peak[target] = magn;
                self.syn_freq[target] = self.ana_freq[k] * ratio;
                self.syn_env[target] = self.envelope[k];
            }
        }
    }

    /// Scales `output` to the weighted energy of `input`.
    fn match_level(&self, input: &[Sample], output: &mut [Sample]) {
        let mut reference = 0.0f32;
        let mut shifted = 0.0f32;
        for ((&x, &y), &w) in input.iter().zip(output.iter()).zip(&self.level_weight) {
            reference += (sanitize_sample(x) * w).powi(2);
            shifted += (y * w).powi(2);
        }
        if reference < LEVEL_FLOOR || shifted < LEVEL_FLOOR {
            return;
        }
        let gain = (reference / shifted)
            .sqrt()
            .clamp(1.0 / MAX_LEVEL_GAIN, MAX_LEVEL_GAIN);
        for y in output.iter_mut() {
            *y *= gain;
        }
    }

    /// Swaps source envelopes for the (possibly warped) destination envelope and builds the
    /// synthesis spectrum.
    fn synthesise(&mut self, ratio: f32, formant_ratio: f32) {
        let n = self.frame_size;
        let half = n / 2;
        let expected = TWO_PI * self.hop_size as f32 / n as f32;

        for k in 0..=half {
            let source = k as f32 / formant_ratio;
            let envelope = if source >= half as f32 {
                self.envelope[half]
            } else {
                let index = source as usize;
                let frac = source - index as f32;
                self.envelope[index] * (1.0 - frac) + self.envelope[index + 1] * frac
            };
            let correction = (envelope / self.syn_env[k])
                .clamp(1.0 / MAX_ENVELOPE_GAIN, MAX_ENVELOPE_GAIN);
            let magnitude = self.syn_magn[k] * correction;

            let phase = if ratio == 1.0 {
                self.last_phase[k]
            } else {
                wrap_phase(self.sum_phase[k] + expected * self.syn_freq[k])
            };
            self.sum_phase[k] = phase;

            let (sin, cos) = phase.sin_cos();
            if k == 0 || k == half {
                self.spectrum[k] = Complex32::new(magnitude * cos, 0.0);
            } else {
                self.spectrum[k] = Complex32::new(magnitude * cos, magnitude * sin);
                self.spectrum[n - k] = Complex32::new(magnitude * cos, -magnitude * sin);
            }
        }
    }
}
