use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use upnext::audio::{BackendDataSource, BackendEvent, BackendState, NullOutput, StreamingBackend};
use upnext::library;
use upnext::model::{AudioItem, PlaybackId, PlaybackTuning};
use url::Url;

fn write_wav(path: &Path, duration_ms: u32) {
    let sample_rate: u32 = 8_000;
    let samples = sample_rate * duration_ms / 1_000;
    let data_size = samples * 2;
    let mut bytes = Vec::with_capacity(44 + data_size as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_size).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16_u32.to_le_bytes());
    bytes.extend_from_slice(&1_u16.to_le_bytes());
    bytes.extend_from_slice(&1_u16.to_le_bytes());
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    bytes.extend_from_slice(&2_u16.to_le_bytes());
    bytes.extend_from_slice(&16_u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_size.to_le_bytes());
    bytes.resize(44 + data_size as usize, 0);
    fs::write(path, bytes).expect("write wav");
}

struct Playlist {
    items: Vec<AudioItem>,
    requested: Vec<PlaybackId>,
}

impl Playlist {
    fn position(&self, identifier: PlaybackId) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.playback_id() == identifier)
    }
}

impl BackendDataSource for Playlist {
    fn is_last_track(&self, _url: &Url, identifier: PlaybackId) -> bool {
        self.position(identifier) == Some(self.items.len() - 1)
    }

    fn next_track_identifier(&self, _url: &Url, identifier: PlaybackId) -> Option<PlaybackId> {
        let index = self.position(identifier)?;
        self.items.get(index + 1).map(AudioItem::playback_id)
    }

    fn load_next_track_url(&mut self, identifier: PlaybackId) {
        self.requested.push(identifier);
    }
}

fn tick_until(
    backend: &mut StreamingBackend,
    playlist: &mut Playlist,
    deadline: Duration,
    mut done: impl FnMut(&BackendEvent) -> bool,
) -> Vec<BackendEvent> {
    let started = Instant::now();
    let mut seen = Vec::new();
    while started.elapsed() < deadline {
        let events = backend.tick(playlist);
        let requests: Vec<PlaybackId> = playlist.requested.drain(..).collect();
        for id in requests {
            if let Some(index) = playlist.position(id) {
                let url = playlist.items[index].playback_url.clone();
                backend.next_track_url_loaded(id, &url);
            }
        }
        let finished = events.iter().any(&mut done);
        seen.extend(events);
        if finished {
            return seen;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached; saw {seen:?}");
}

#[test]
fn short_local_tracks_hand_off_in_order() {
    let dir = tempdir().expect("tempdir");
    let mut items = Vec::new();
    for name in ["one", "two", "three"] {
        let path = dir.path().join(format!("{name}.wav"));
        write_wav(&path, 250);
        items.push(library::item_for_path(&path).expect("item"));
    }
    let ids: Vec<PlaybackId> = items.iter().map(AudioItem::playback_id).collect();
    let mut playlist = Playlist {
        items,
        requested: Vec::new(),
    };

    let mut backend = StreamingBackend::new(Box::new(NullOutput::new()), PlaybackTuning::default());
    let first = playlist.items[0].playback_url.clone();
    backend.play_url(&first, ids[0]);

    let events = tick_until(&mut backend, &mut playlist, Duration::from_secs(5), |event| {
        matches!(event, BackendEvent::FinishedPlaying { next: None, .. })
    });

    let finished: Vec<(PlaybackId, Option<PlaybackId>)> = events
        .iter()
        .filter_map(|event| match event {
            BackendEvent::FinishedPlaying {
                identifier, next, ..
            } => Some((*identifier, *next)),
            _ => None,
        })
        .collect();
    assert_eq!(
        finished,
        vec![
            (ids[0], Some(ids[1])),
            (ids[1], Some(ids[2])),
            (ids[2], None),
        ]
    );
    let buffering = events
        .iter()
        .filter(|event| **event == BackendEvent::StateChanged(BackendState::Buffering))
        .count();
    assert_eq!(buffering, 1, "only the initial open buffers");
    assert_eq!(backend.state(), BackendState::Stopped);
}

#[test]
fn durations_come_from_the_file() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("long.wav");
    write_wav(&path, 2_000);
    let item = library::item_for_path(&path).expect("item");
    let mut playlist = Playlist {
        items: vec![item.clone()],
        requested: Vec::new(),
    };

    let mut backend = StreamingBackend::new(Box::new(NullOutput::new()), PlaybackTuning::default());
    backend.play_url(&item.playback_url, item.playback_id());
    tick_until(&mut backend, &mut playlist, Duration::from_secs(5), |event| {
        *event == BackendEvent::StateChanged(BackendState::Playing)
    });

    let duration = backend.current_duration().expect("duration");
    assert!(duration >= Duration::from_millis(1_900) && duration <= Duration::from_millis(2_100));
    assert_eq!(backend.next_url(), None, "single track never preloads");
}
