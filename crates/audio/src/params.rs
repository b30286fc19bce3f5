//! Live parameter set shared between control threads and the processing thread.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use voxmorph_effects::{EffectsParams, FORMANT_RANGE, PITCH_RANGE};

pub const MAX_VOLUME: f32 = 2.0;

/// Everything the processing thread reads at a frame boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSet {
    pub pitch_semitones: f32,
    pub formant_ratio: f32,
    /// Linear master gain, 0..=2.
    pub volume: f32,
    pub bypass: bool,
    pub effects: EffectsParams,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            pitch_semitones: 0.0,
            formant_ratio: 1.0,
            volume: 1.0,
            bypass: false,
            effects: EffectsParams::default(),
        }
    }
}

impl ParameterSet {
    pub fn clamp_pitch(semitones: f32) -> f32 {
        if semitones.is_nan() {
            0.0
        } else {
            PITCH_RANGE.clamp(semitones)
        }
    }

    pub fn clamp_formant(ratio: f32) -> f32 {
        if ratio.is_nan() {
            1.0
        } else {
            FORMANT_RANGE.clamp(ratio)
        }
    }

    pub fn clamp_volume(volume: f32) -> f32 {
        if volume.is_nan() {
            1.0
        } else {
            volume.clamp(0.0, MAX_VOLUME)
        }
    }
}

/// Single-writer-at-a-time, wait-free-reader parameter snapshot.
///
/// Writers serialize on a mutex, build the next set and publish it with one pointer swap.
/// The processing thread only ever calls [`ParameterStore::snapshot`], which never blocks.
///
/// The set replaced by a write is parked under the writer lock until the following write,
/// so the last reference to a stale snapshot is released by a control thread rather than
/// by a reader whose load raced the swap.
pub struct ParameterStore {
    current: ArcSwap<ParameterSet>,
    /// Previously published set, dropped by the next writer.
    retired: Mutex<Option<Arc<ParameterSet>>>,
    generation: AtomicU64,
}

impl ParameterStore {
    pub fn new(initial: ParameterSet) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(initial)),
            retired: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn snapshot(&self) -> ParameterSet {
        **self.current.load()
    }

    /// Applies `edit` to a copy of the live set and publishes the result atomically.
    pub fn update<R>(&self, edit: impl FnOnce(&mut ParameterSet) -> R) -> R {
        let mut retired = self.retired.lock();
        let mut next = **self.current.load();
        let result = edit(&mut next);
        self.publish(&mut retired, next);
        result
    }

    /// Like [`ParameterStore::update`], but publishes only when `edit` succeeds.
    pub fn try_update<R, E>(
        &self,
        edit: impl FnOnce(&mut ParameterSet) -> Result<R, E>,
    ) -> Result<R, E> {
        let mut retired = self.retired.lock();
        let mut next = **self.current.load();
        let result = edit(&mut next)?;
        self.publish(&mut retired, next);
        Ok(result)
    }

    fn publish(&self, retired: &mut Option<Arc<ParameterSet>>, next: ParameterSet) {
        let previous = self.current.swap(Arc::new(next));
        // Drops the set retired by the previous write, here on the writer's thread.
        *retired = Some(previous);
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Number of published updates, for change detection.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(ParameterSet::default())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use voxmorph_effects::StageKind;

    use super::*;

    #[test]
    fn update_publishes_a_new_snapshot() {
        let store = ParameterStore::default();
        let before = store.snapshot();
        store.update(|p| {
            p.pitch_semitones = 4.0;
            p.effects.set_enabled(StageKind::Chorus, true);
        });
        let after = store.snapshot();
        assert_eq!(before, ParameterSet::default());
        assert_eq!(after.pitch_semitones, 4.0);
        assert!(after.effects.chorus.enabled);
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn clamps_control_values() {
        assert_eq!(ParameterSet::clamp_pitch(40.0), 12.0);
        assert_eq!(ParameterSet::clamp_pitch(f32::NAN), 0.0);
        assert_eq!(ParameterSet::clamp_formant(0.1), 0.5);
        assert_eq!(ParameterSet::clamp_volume(-1.0), 0.0);
    }

    #[test]
    fn failed_edit_is_not_published() {
        let store = ParameterStore::default();
        let result = store.try_update(|p| {
            p.pitch_semitones = 7.0;
            p.effects.set_param(StageKind::Reverb, "wobble", 1.0)
        });
        assert!(result.is_err());
        assert_eq!(store.snapshot(), ParameterSet::default());
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn replaced_snapshot_outlives_the_swap() {
        let store = ParameterStore::default();
        let first = store.current.load_full();
        store.update(|p| p.volume = 0.5);
        // Store plus the local handle: the writer still holds the replaced set.
        assert_eq!(Arc::strong_count(&first), 2);

        let second = store.current.load_full();
        store.update(|p| p.volume = 0.75);
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(Arc::strong_count(&second), 2);
        assert_eq!(*second, ParameterSet { volume: 0.5, ..ParameterSet::default() });
    }

    #[test]
    fn concurrent_writers_never_lose_updates() {
        let store = Arc::new(ParameterStore::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.update(|p| p.effects.delay.params.time_s += 0.001);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer panicked");
        }
        assert_eq!(store.generation(), 1_000);
        let time = store.snapshot().effects.delay.params.time_s;
        assert!((time - 1.3).abs() < 1e-3, "time={time}");
    }
}
