use crate::duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

// Process-local identity of a queue entry. Never persisted: a reloaded
// queue gets fresh ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(Uuid);

impl PlaybackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlaybackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId(Uuid);

impl CollectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioItem {
    #[serde(skip)]
    playback_id: PlaybackId,
    #[serde(default)]
    pub collection: Option<CollectionId>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub track_number: Option<u32>,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub duration: Duration,
    #[serde(default)]
    pub display_text: String,
    #[serde(default)]
    pub display_subtext: String,
    #[serde(default)]
    pub album_art: Option<Url>,
    pub playback_url: Url,
    #[serde(default)]
    pub metadata_loaded: bool,
}

impl AudioItem {
    pub fn new(playback_url: Url, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            playback_id: PlaybackId::new(),
            collection: None,
            id: None,
            track_number: None,
            display_text: title.clone(),
            title,
            artist: String::new(),
            album: String::new(),
            duration: Duration::ZERO,
            display_subtext: String::new(),
            album_art: None,
            playback_url,
            metadata_loaded: false,
        }
    }

    pub fn playback_id(&self) -> PlaybackId {
        self.playback_id
    }

    pub fn display_duration(&self) -> String {
        duration::formatted_time(self.duration)
    }

    pub fn resolve_artwork(
        &self,
        resolver: &dyn ArtworkResolver,
        done: Box<dyn FnOnce(Option<Artwork>) + Send>,
    ) {
        match &self.album_art {
            Some(url) => resolver.resolve(url, done),
            None => done(None),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioItemCollection {
    #[serde(default)]
    pub id: CollectionId,
    pub display_text: String,
    #[serde(default)]
    pub display_subtext: String,
    #[serde(default)]
    pub album_art: Option<Url>,
    pub items: Vec<AudioItem>,
}

impl AudioItemCollection {
    pub fn new(display_text: impl Into<String>, items: Vec<AudioItem>) -> Self {
        let id = CollectionId::new();
        let items = items
            .into_iter()
            .map(|mut item| {
                item.collection = Some(id);
                item
            })
            .collect();
        Self {
            id,
            display_text: display_text.into(),
            display_subtext: String::new(),
            album_art: None,
            items,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().map(|item| item.duration).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artwork {
    pub url: Url,
    pub bytes: Vec<u8>,
}

pub trait MetadataLoader {
    fn load_metadata(&self, item: &AudioItem, done: Box<dyn FnOnce(AudioItem) + Send>);
}

pub trait ArtworkResolver {
    fn resolve(&self, url: &Url, done: Box<dyn FnOnce(Option<Artwork>) + Send>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackwardStyle {
    #[default]
    RestartTrack,
    AlwaysPrevious,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct EqualizerSettings {
    pub enabled: bool,
    pub bass_gain_db: f32,
    pub mid_gain_db: f32,
    pub treble_gain_db: f32,
}

impl EqualizerSettings {
    pub const MAX_GAIN_DB: f32 = 15.0;

    pub fn clamped(self) -> Self {
        let clamp = |gain: f32| {
            if gain.is_finite() {
                gain.clamp(-Self::MAX_GAIN_DB, Self::MAX_GAIN_DB)
            } else {
                0.0
            }
        };
        Self {
            enabled: self.enabled,
            bass_gain_db: clamp(self.bass_gain_db),
            mid_gain_db: clamp(self.mid_gain_db),
            treble_gain_db: clamp(self.treble_gain_db),
        }
    }

    pub fn is_flat(&self) -> bool {
        !self.enabled
            || (self.bass_gain_db == 0.0 && self.mid_gain_db == 0.0 && self.treble_gain_db == 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackTuning {
    #[serde(default = "default_backward_restart_threshold_ms")]
    pub backward_restart_threshold_ms: u32,
    #[serde(default = "default_preload_window_ms")]
    pub preload_window_ms: u32,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u32,
}

impl PlaybackTuning {
    pub fn backward_restart_threshold(&self) -> Duration {
        Duration::from_millis(u64::from(self.backward_restart_threshold_ms))
    }

    pub fn preload_window(&self) -> Duration {
        Duration::from_millis(u64::from(self.preload_window_ms))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.progress_interval_ms.max(1)))
    }
}

impl Default for PlaybackTuning {
    fn default() -> Self {
        Self {
            backward_restart_threshold_ms: default_backward_restart_threshold_ms(),
            preload_window_ms: default_preload_window_ms(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

fn default_backward_restart_threshold_ms() -> u32 {
    3_000
}

fn default_preload_window_ms() -> u32 {
    10_000
}

fn default_progress_interval_ms() -> u32 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersistedQueue {
    pub items: Vec<AudioItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    #[serde(default)]
    pub queue: PersistedQueue,
    #[serde(default)]
    pub current_index: Option<usize>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub loop_queue: bool,
    #[serde(default)]
    pub loop_item: bool,
    #[serde(default)]
    pub backward_style: BackwardStyle,
    #[serde(default = "default_saved_volume")]
    pub volume: f32,
    #[serde(default)]
    pub equalizer: EqualizerSettings,
    #[serde(default)]
    pub tuning: PlaybackTuning,
}

fn default_saved_volume() -> f32 {
    1.0
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            queue: PersistedQueue::default(),
            current_index: None,
            shuffle: false,
            loop_queue: false,
            loop_item: false,
            backward_style: BackwardStyle::default(),
            volume: default_saved_volume(),
            equalizer: EqualizerSettings::default(),
            tuning: PlaybackTuning::default(),
        }
    }
}
