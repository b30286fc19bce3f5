//! Built-in voice presets and the binder that applies them.

use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use voxmorph_effects::{
    ChorusParams, CompressorParams, DelayParams, DistortionParams, EffectsParams, ReverbParams,
    StageSettings,
};

use crate::{Error, ParameterSet, ParameterStore, Result};

/// Grouping used by a preset picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresetCategory {
    Neutral,
    Human,
    Character,
    Creature,
    Space,
    Device,
}

impl PresetCategory {
    pub fn name(&self) -> &'static str {
        match self {
            PresetCategory::Neutral => "Neutral",
            PresetCategory::Human => "Human",
            PresetCategory::Character => "Character",
            PresetCategory::Creature => "Creature",
            PresetCategory::Space => "Space",
            PresetCategory::Device => "Device",
        }
    }
}

/// Immutable named parameter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preset {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: PresetCategory,
    pub params: ParameterSet,
}

impl Preset {
    fn matches(&self, key: &str) -> bool {
        self.id.eq_ignore_ascii_case(key) || self.name.eq_ignore_ascii_case(key)
    }
}

fn voice(pitch_semitones: f32, formant_ratio: f32, effects: EffectsParams) -> ParameterSet {
    ParameterSet {
        pitch_semitones,
        formant_ratio,
        effects,
        ..ParameterSet::default()
    }
}

fn on<P>(params: P) -> StageSettings<P> {
    StageSettings {
        enabled: true,
        params,
    }
}

static CATALOG: Lazy<Arc<[Preset]>> = Lazy::new(|| {
    let presets = vec![
        Preset {
            id: "default",
            name: "Default",
            description: "Unprocessed voice",
            category: PresetCategory::Neutral,
            params: ParameterSet::default(),
        },
        Preset {
            id: "woman",
            name: "Woman",
            description: "Raised pitch with slightly brighter formants",
            category: PresetCategory::Human,
            params: voice(4.0, 1.2, EffectsParams::default()),
        },
        Preset {
            id: "anime_girl",
            name: "Anime Girl",
            description: "High, bright and lightly doubled",
            category: PresetCategory::Character,
            params: voice(
                7.0,
                1.35,
                EffectsParams {
                    chorus: on(ChorusParams {
                        rate_hz: 1.5,
                        depth: 0.2,
                        voices: 2.0,
                        mix: 0.25,
                    }),
                    reverb: on(ReverbParams {
                        room_size: 0.3,
                        damping: 0.6,
                        mix: 0.15,
                    }),
                    ..EffectsParams::default()
                },
            ),
        },
        Preset {
            id: "male",
            name: "Male Voice",
            description: "Lowered pitch with deeper formants",
            category: PresetCategory::Human,
            params: voice(-4.0, 0.85, EffectsParams::default()),
        },
        Preset {
            id: "child",
            name: "Child Voice",
            description: "Small vocal tract and high pitch",
            category: PresetCategory::Human,
            params: voice(6.0, 1.5, EffectsParams::default()),
        },
        Preset {
            id: "monster",
            name: "Monster",
            description: "Very low, gritty and large",
            category: PresetCategory::Creature,
            params: voice(
                -10.0,
                0.6,
                EffectsParams {
                    distortion: on(DistortionParams {
                        drive_db: 18.0,
                        tone: 0.3,
                        mix: 0.6,
                    }),
                    reverb: on(ReverbParams {
                        room_size: 0.7,
                        damping: 0.4,
                        mix: 0.3,
                    }),
                    ..EffectsParams::default()
                },
            ),
        },
        Preset {
            id: "darth_vader",
            name: "Darth Vader",
            description: "Deep, compressed and slightly distorted",
            category: PresetCategory::Character,
            params: voice(
                -6.0,
                0.75,
                EffectsParams {
                    distortion: on(DistortionParams {
                        drive_db: 9.0,
                        tone: 0.25,
                        mix: 0.4,
                    }),
                    reverb: on(ReverbParams {
                        room_size: 0.4,
                        damping: 0.5,
                        mix: 0.2,
                    }),
                    compressor: on(CompressorParams {
                        threshold_db: -24.0,
                        ratio: 6.0,
                        attack_ms: 3.0,
                        release_ms: 120.0,
                        makeup_db: 6.0,
                    }),
                    ..EffectsParams::default()
                },
            ),
        },
        Preset {
            id: "ghost",
            name: "Ghost",
            description: "Airy, wavering and far away",
            category: PresetCategory::Creature,
            params: voice(
                3.0,
                1.1,
                EffectsParams {
                    chorus: on(ChorusParams {
                        rate_hz: 0.4,
                        depth: 0.8,
                        voices: 4.0,
                        mix: 0.6,
                    }),
                    reverb: on(ReverbParams {
                        room_size: 0.95,
                        damping: 0.2,
                        mix: 0.6,
                    }),
                    delay: on(DelayParams {
                        time_s: 0.45,
                        feedback: 0.5,
                        mix: 0.3,
                    }),
                    ..EffectsParams::default()
                },
            ),
        },
        Preset {
            id: "telephone",
            name: "Telephone",
            description: "Band-limited, clipped and squashed",
            category: PresetCategory::Device,
            params: voice(
                0.0,
                1.0,
                EffectsParams {
                    distortion: on(DistortionParams {
                        drive_db: 24.0,
                        tone: 0.35,
                        mix: 0.8,
                    }),
                    compressor: on(CompressorParams {
                        threshold_db: -30.0,
                        ratio: 10.0,
                        attack_ms: 1.0,
                        release_ms: 60.0,
                        makeup_db: 8.0,
                    }),
                    ..EffectsParams::default()
                },
            ),
        },
        Preset {
            id: "chipmunk",
            name: "Chipmunk",
            description: "An octave up with matching formants",
            category: PresetCategory::Character,
            params: voice(12.0, 2.0, EffectsParams::default()),
        },
        Preset {
            id: "demon",
            name: "Demon",
            description: "An octave down, distorted and echoing",
            category: PresetCategory::Creature,
            params: voice(
                -12.0,
                0.55,
                EffectsParams {
                    distortion: on(DistortionParams {
                        drive_db: 30.0,
                        tone: 0.2,
                        mix: 0.7,
                    }),
                    delay: on(DelayParams {
                        time_s: 0.18,
                        feedback: 0.35,
                        mix: 0.25,
                    }),
                    reverb: on(ReverbParams {
                        room_size: 0.8,
                        damping: 0.3,
                        mix: 0.35,
                    }),
                    ..EffectsParams::default()
                },
            ),
        },
        Preset {
            id: "cave",
            name: "Cave",
            description: "Unaltered voice in a large echoing space",
            category: PresetCategory::Space,
            params: voice(
                0.0,
                1.0,
                EffectsParams {
                    reverb: on(ReverbParams {
                        room_size: 0.9,
                        damping: 0.15,
                        mix: 0.5,
                    }),
                    delay: on(DelayParams {
                        time_s: 0.6,
                        feedback: 0.4,
                        mix: 0.3,
                    }),
                    ..EffectsParams::default()
                },
            ),
        },
    ];
    presets.into()
});

/// The fixed preset catalog in display order.
pub fn catalog() -> &'static [Preset] {
    &CATALOG
}

/// Finds a preset by id or display name, ignoring ASCII case.
pub fn find(key: &str) -> Option<&'static Preset> {
    let key = key.trim();
    CATALOG.iter().find(|preset| preset.matches(key))
}

/// Copies catalog entries into a live [`ParameterStore`].
pub struct PresetBinder<'a> {
    store: &'a ParameterStore,
}

impl<'a> PresetBinder<'a> {
    pub fn new(store: &'a ParameterStore) -> Self {
        Self { store }
    }

    /// Publishes the preset's voice and stage settings in one swap and returns the live set;
    /// the processor picks them up at the next frame boundary. Master volume and bypass are
    /// the user's and stay as they are. Unknown names leave the live set untouched.
    #[instrument(skip(self))]
    pub fn apply(&self, name: &str) -> Result<ParameterSet> {
        let preset = find(name).ok_or_else(|| Error::UnknownPreset(name.to_string()))?;
        let live = self.store.update(|p| {
            p.pitch_semitones = preset.params.pitch_semitones;
            p.formant_ratio = preset.params.formant_ratio;
            p.effects = preset.params.effects;
            *p
        });
        debug!(preset = preset.id, "applied preset");
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use voxmorph_effects::{StageKind, StageParams, FORMANT_RANGE, PITCH_RANGE};

    use super::*;

    #[test]
    fn catalog_lists_the_expected_voices() {
        let names: Vec<_> = catalog().iter().map(|p| p.name).collect();
        for expected in [
            "Default",
            "Woman",
            "Anime Girl",
            "Male Voice",
            "Child Voice",
            "Monster",
            "Darth Vader",
            "Ghost",
            "Telephone",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn ids_and_names_are_unique() {
        let presets = catalog();
        for (i, a) in presets.iter().enumerate() {
            for b in &presets[i + 1..] {
                assert_ne!(a.id, b.id);
                assert!(!a.name.eq_ignore_ascii_case(b.name));
            }
        }
    }

    #[test]
    fn every_preset_is_already_in_range() {
        for preset in catalog() {
            let p = &preset.params;
            assert!(PITCH_RANGE.contains(p.pitch_semitones), "{}", preset.id);
            assert!(FORMANT_RANGE.contains(p.formant_ratio), "{}", preset.id);
            let fx = &p.effects;
            assert_eq!(fx.reverb.params, fx.reverb.params.clamped(), "{}", preset.id);
            assert_eq!(fx.chorus.params, fx.chorus.params.clamped(), "{}", preset.id);
            assert_eq!(fx.distortion.params, fx.distortion.params.clamped(), "{}", preset.id);
            assert_eq!(fx.compressor.params, fx.compressor.params.clamped(), "{}", preset.id);
            assert_eq!(fx.delay.params, fx.delay.params.clamped(), "{}", preset.id);
        }
    }

    #[test]
    fn lookup_by_id_or_name_ignores_case() {
        assert_eq!(find("anime girl").map(|p| p.id), Some("anime_girl"));
        assert_eq!(find("DARTH_VADER").map(|p| p.id), Some("darth_vader"));
        assert!(find("robot").is_none());
    }

    #[test]
    fn applying_twice_is_deterministic() {
        let store = ParameterStore::default();
        let binder = PresetBinder::new(&store);
        let first = binder.apply("Woman").expect("known preset");
        let live_first = store.snapshot();
        let second = binder.apply("Woman").expect("known preset");
        assert_eq!(first, second);
        assert_eq!(live_first, store.snapshot());
    }

    #[test]
    fn preset_keeps_master_volume_and_bypass() {
        let store = ParameterStore::default();
        store.update(|p| {
            p.volume = 0.25;
            p.bypass = true;
        });
        let applied = PresetBinder::new(&store).apply("Woman").expect("known preset");
        let woman = find("woman").expect("catalog entry");
        assert_eq!(applied.volume, 0.25);
        assert!(applied.bypass);
        assert_eq!(applied.pitch_semitones, woman.params.pitch_semitones);
        assert_eq!(applied.effects, woman.params.effects);
        assert_eq!(store.snapshot(), applied);
    }

    #[test]
    fn unknown_preset_leaves_parameters_unchanged() {
        let store = ParameterStore::default();
        store.update(|p| {
            p.pitch_semitones = 3.0;
            p.effects.set_enabled(StageKind::Delay, true);
        });
        let before = store.snapshot();
        let generation = store.generation();

        let err = PresetBinder::new(&store).apply("nonexistent").unwrap_err();
        assert!(matches!(err, Error::UnknownPreset(ref name) if name == "nonexistent"));
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.generation(), generation);
    }
}
