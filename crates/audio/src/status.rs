//! Pipeline lifecycle state and the counters shared with the processing thread.

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
};

use atomic_float::AtomicF32;
use parking_lot::Mutex;
use serde::Serialize;
use voxmorph_dsp::RingMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PipelineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl PipelineState {
    fn to_u8(self) -> u8 {
        match self {
            PipelineState::Stopped => 0,
            PipelineState::Starting => 1,
            PipelineState::Running => 2,
            PipelineState::Stopping => 3,
            PipelineState::Error => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::Starting,
            2 => PipelineState::Running,
            3 => PipelineState::Stopping,
            4 => PipelineState::Error,
            _ => PipelineState::Stopped,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the status counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub underruns: u64,
    pub overruns: u64,
    pub latency_ms: f32,
    pub frames_processed: u64,
}

/// State of one run, shared by the control side, the ports and the processor.
///
/// Every start installs a fresh instance, so a processor or port left over from an earlier
/// run only ever touches its own (stopped) run.
pub(crate) struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    underruns: AtomicU64,
    frames_processed: AtomicU64,
    latency_ms: AtomicF32,
    /// Capture and playback rings of this run; overruns are read from them.
    monitors: Option<(RingMonitor, RingMonitor)>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    /// Idle state of a pipeline that has not run yet.
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(PipelineState::Stopped.to_u8()),
            stop: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            latency_ms: AtomicF32::new(0.0),
            monitors: None,
            last_error: Mutex::new(None),
        }
    }

    /// Fresh counters for a run over the given rings, in `Starting`.
    pub(crate) fn for_run(capture: RingMonitor, playback: RingMonitor) -> Self {
        let shared = Self {
            monitors: Some((capture, playback)),
            ..Self::new()
        };
        shared.set_state(PipelineState::Starting);
        shared
    }

    #[inline]
    pub(crate) fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PipelineState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    #[inline]
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Asks the processor to halt at its next frame boundary. A run is never resumed.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn record_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn publish_latency(&self, ms: f32) {
        self.latency_ms.store(ms, Ordering::Release);
    }

    pub(crate) fn latency_ms(&self) -> f32 {
        self.latency_ms.load(Ordering::Acquire)
    }

    pub(crate) fn overruns(&self) -> u64 {
        self.monitors.as_ref().map_or(0, |(capture, playback)| {
            capture.overrun_count() + playback.overrun_count()
        })
    }

    pub(crate) fn set_last_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub(crate) fn snapshot(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state(),
            underruns: self.underruns(),
            overruns: self.overruns(),
            latency_ms: self.latency_ms(),
            frames_processed: self.frames_processed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use voxmorph_dsp::{OverflowPolicy, RingBuffer};

    use super::*;

    #[test]
    fn state_survives_u8_encoding() {
        for state in [
            PipelineState::Stopped,
            PipelineState::Starting,
            PipelineState::Running,
            PipelineState::Stopping,
            PipelineState::Error,
        ] {
            assert_eq!(PipelineState::from_u8(state.to_u8()), state);
        }
    }

    #[test]
    fn overruns_sum_both_rings() {
        let (mut capture_tx, capture_rx) = RingBuffer::with_capacity(4, OverflowPolicy::DropOldest);
        let (mut playback_tx, _playback_rx) =
            RingBuffer::with_capacity(4, OverflowPolicy::DropNewest);
        let shared = Shared::for_run(capture_rx.monitor(), playback_tx.monitor());
        assert_eq!(shared.state(), PipelineState::Starting);
        assert_eq!(shared.overruns(), 0);

        capture_tx.write(&[0.0; 6]);
        playback_tx.write(&[0.0; 6]);
        assert_eq!(shared.overruns(), 2);
        assert_eq!(Shared::new().overruns(), 0);
    }

    #[test]
    fn stop_request_is_sticky() {
        let shared = Shared::new();
        assert!(!shared.stop_requested());
        shared.request_stop();
        shared.request_stop();
        assert!(shared.stop_requested());
    }
}
