use crate::audio::{AudioOutput, BackendDataSource, BackendEvent, BackendState, StreamingBackend};
use crate::duration;
use crate::error::StreamError;
use crate::model::{
    AudioItem, BackwardStyle, EqualizerSettings, MetadataLoader, PersistedState, PlaybackId,
    PlaybackTuning,
};
use crate::queue::{QueueObserver, UpNextQueue};
use std::collections::HashSet;
use std::rc::Weak;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Error,
}

impl PlaybackState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Buffering => "buffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedrawReason {
    Buffering,
    Playing,
    Stopped,
    Paused,
    Error,
    TrackChanged,
    QueueChanged,
}

pub trait PlayerDelegate {
    fn ui_needs_redraw(&self, reason: RedrawReason);
    fn error_raised(&self, error: &StreamError, url: &Url);
    fn downloaded_bytes(&self, downloaded: u64, total: Option<u64>);
    fn progress_changed(&self, elapsed: Duration, total: Duration);
    fn audio_session_set_up(&self);

    fn interruption_began(&self) -> bool {
        false
    }

    fn interruption_ended(&self, _should_resume: bool) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Forward,
    Backward,
}

fn neighbour(
    queue: &UpNextQueue,
    index: usize,
    shuffle: bool,
    wrap: bool,
    step: Step,
) -> Option<usize> {
    let len = queue.len();
    if index >= len {
        return None;
    }
    let position = if shuffle {
        queue.shuffle_position_of(index)?
    } else {
        index
    };
    let target = match step {
        Step::Forward if position + 1 < len => position + 1,
        Step::Forward if wrap => 0,
        Step::Backward if position > 0 => position - 1,
        Step::Backward if wrap => len - 1,
        _ => return None,
    };
    if shuffle {
        queue.logical_index_at(target)
    } else {
        Some(target)
    }
}

struct QueueCursor<'a> {
    queue: &'a UpNextQueue,
    shuffle: bool,
    loop_queue: bool,
    loop_item: bool,
    requests: Vec<PlaybackId>,
}

impl QueueCursor<'_> {
    fn locate(&self, url: &Url, identifier: PlaybackId) -> Option<usize> {
        self.queue
            .index_of_id(identifier)
            .or_else(|| self.queue.index_of_url(url))
    }

    fn following(&self, url: &Url, identifier: PlaybackId) -> Option<usize> {
        let index = self.locate(url, identifier)?;
        neighbour(self.queue, index, self.shuffle, self.loop_queue, Step::Forward)
    }
}

impl BackendDataSource for QueueCursor<'_> {
    fn is_last_track(&self, url: &Url, identifier: PlaybackId) -> bool {
        self.loop_item || self.following(url, identifier).is_none()
    }

    fn next_track_identifier(&self, url: &Url, identifier: PlaybackId) -> Option<PlaybackId> {
        self.following(url, identifier)
            .and_then(|index| self.queue.get(index))
            .map(AudioItem::playback_id)
    }

    fn load_next_track_url(&mut self, identifier: PlaybackId) {
        self.requests.push(identifier);
    }
}

pub struct Player {
    queue: UpNextQueue,
    backend: StreamingBackend,
    delegate: Option<Weak<dyn PlayerDelegate>>,
    metadata: Option<Box<dyn MetadataLoader>>,
    loaded_tx: Sender<AudioItem>,
    loaded_rx: Receiver<AudioItem>,
    requested: HashSet<PlaybackId>,
    current_index: Option<usize>,
    current_id: Option<PlaybackId>,
    state: PlaybackState,
    shuffle: bool,
    loop_queue: bool,
    loop_item: bool,
    backward_style: BackwardStyle,
    last_error: Option<StreamError>,
    interrupted: bool,
}

impl Player {
    pub fn new(output: Box<dyn AudioOutput>, tuning: PlaybackTuning) -> Self {
        Self::with_queue(output, tuning, UpNextQueue::new())
    }

    pub fn with_queue(
        output: Box<dyn AudioOutput>,
        tuning: PlaybackTuning,
        queue: UpNextQueue,
    ) -> Self {
        let (loaded_tx, loaded_rx) = mpsc::channel();
        Self {
            queue,
            backend: StreamingBackend::new(output, tuning),
            delegate: None,
            metadata: None,
            loaded_tx,
            loaded_rx,
            requested: HashSet::new(),
            current_index: None,
            current_id: None,
            state: PlaybackState::Idle,
            shuffle: false,
            loop_queue: false,
            loop_item: false,
            backward_style: BackwardStyle::default(),
            last_error: None,
            interrupted: false,
        }
    }

    pub fn from_persisted(output: Box<dyn AudioOutput>, state: PersistedState) -> Self {
        let queue = UpNextQueue::from_persisted(state.queue);
        let mut player = Self::with_queue(output, state.tuning, queue);
        player.loop_queue = state.loop_queue;
        player.loop_item = state.loop_item;
        player.backward_style = state.backward_style;
        player.backend.set_volume(state.volume);
        player.backend.set_equalizer(state.equalizer);

        if let Some(index) = state.current_index.filter(|&index| index < player.queue.len()) {
            player.current_index = Some(index);
            player.current_id = player.queue.get(index).map(AudioItem::playback_id);
            player.queue.set_anchor(index);
        }
        if state.shuffle {
            player.shuffle = true;
            player.queue.reshuffle();
        }
        player
    }

    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            queue: self.queue.to_persisted(),
            current_index: self.current_index,
            shuffle: self.shuffle,
            loop_queue: self.loop_queue,
            loop_item: self.loop_item,
            backward_style: self.backward_style,
            volume: self.backend.volume(),
            equalizer: self.backend.equalizer(),
            tuning: self.backend.tuning(),
        }
    }

    pub fn set_delegate(&mut self, delegate: Weak<dyn PlayerDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn set_queue_observer(&mut self, observer: Weak<dyn QueueObserver>) {
        self.queue.set_observer(observer);
    }

    pub fn set_metadata_loader(&mut self, loader: Box<dyn MetadataLoader>) {
        self.metadata = Some(loader);
        self.request_upcoming_metadata();
    }

    pub fn output_name(&self) -> String {
        self.backend.output_name()
    }

    pub fn queue(&self) -> &UpNextQueue {
        &self.queue
    }

    pub fn edit_queue<R>(&mut self, edit: impl FnOnce(&mut UpNextQueue) -> R) -> R {
        let result = edit(&mut self.queue);
        self.resync_current();
        self.revalidate_preload();
        self.redraw(RedrawReason::QueueChanged);
        self.request_upcoming_metadata();
        result
    }

    pub fn replace_queue(&mut self, items: Vec<AudioItem>, start: Option<usize>) {
        self.backend.stop();
        self.queue.replace_all(items);
        self.current_index = None;
        self.current_id = None;
        self.requested.clear();
        self.redraw(RedrawReason::QueueChanged);
        match start {
            Some(index) if self.set_index(index) => {}
            _ => self.set_state(PlaybackState::Stopped),
        }
    }

    fn resync_current(&mut self) {
        let Some(id) = self.current_id else {
            return;
        };
        if let Some(index) = self.queue.index_of_id(id) {
            self.current_index = Some(index);
            self.queue.set_anchor(index);
            return;
        }

        debug!(%id, "current item left the queue");
        if self.queue.is_empty() {
            self.current_index = None;
            self.current_id = None;
            self.backend.stop();
            if self.state != PlaybackState::Idle {
                self.set_state(PlaybackState::Stopped);
            }
            return;
        }

        let index = self
            .current_index
            .unwrap_or(0)
            .min(self.queue.len() - 1);
        if matches!(self.state, PlaybackState::Playing | PlaybackState::Buffering) {
            self.play_index(index);
        } else {
            self.backend.stop();
            self.adopt_index(index);
            self.redraw(RedrawReason::TrackChanged);
            if self.state != PlaybackState::Idle {
                self.set_state(PlaybackState::Stopped);
            }
        }
    }

    pub fn set_index(&mut self, index: usize) -> bool {
        if index >= self.queue.len() {
            warn!(index, len = self.queue.len(), "ignoring out-of-range queue index");
            return false;
        }
        self.play_index(index);
        true
    }

    pub fn play_item_at_index(&mut self, index: usize) -> bool {
        self.set_index(index)
    }

    fn play_index(&mut self, index: usize) {
        let Some(item) = self.queue.get(index) else {
            return;
        };
        let (url, id) = (item.playback_url.clone(), item.playback_id());
        self.adopt_index(index);
        self.last_error = None;
        self.interrupted = false;
        debug!(%url, index, "playing queue item");
        self.backend.play_url(&url, id);
        self.redraw(RedrawReason::TrackChanged);
        self.set_state(PlaybackState::Buffering);
        self.request_upcoming_metadata();
    }

    fn adopt_index(&mut self, index: usize) {
        self.current_index = Some(index);
        self.current_id = self.queue.get(index).map(AudioItem::playback_id);
        self.queue.set_anchor(index);
    }

    pub fn resume(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        match self.state {
            PlaybackState::Playing | PlaybackState::Buffering => {}
            PlaybackState::Paused if self.backend.current_identifier().is_some() => {
                self.interrupted = false;
                self.backend.resume();
                self.sync_with_backend();
            }
            _ => {
                let index = self
                    .current_index
                    .or_else(|| self.first_index())
                    .unwrap_or(0);
                self.play_index(index);
            }
        }
    }

    pub fn pause(&mut self) {
        if matches!(self.state, PlaybackState::Playing | PlaybackState::Buffering) {
            self.backend.pause();
            self.set_state(PlaybackState::Paused);
        }
    }

    pub fn stop(&mut self) {
        self.backend.stop();
        self.interrupted = false;
        self.set_state(PlaybackState::Stopped);
    }

    pub fn forward(&mut self) -> bool {
        let Some(next) = self.next_index() else {
            return false;
        };
        let next_id = self.queue.get(next).map(AudioItem::playback_id);
        if next_id.is_some()
            && self.backend.next_identifier() == next_id
            && self.backend.skip_to_preloaded()
        {
            debug!(index = next, "forward onto preloaded stream");
            self.adopt_index(next);
            self.last_error = None;
            self.redraw(RedrawReason::TrackChanged);
            self.sync_with_backend();
            self.request_upcoming_metadata();
            return true;
        }
        self.play_index(next);
        true
    }

    pub fn backward(&mut self) -> bool {
        if self.backward_style == BackwardStyle::RestartTrack
            && let Some(index) = self.current_index
            && self.elapsed() >= self.backend.tuning().backward_restart_threshold()
        {
            self.restart_current(index);
            return true;
        }
        match self.previous_index() {
            Some(previous) => {
                self.play_index(previous);
                true
            }
            None => false,
        }
    }

    fn restart_current(&mut self, index: usize) {
        let same_stream = self.backend.current_identifier() == self.current_id;
        if same_stream && self.backend.is_active_ready() {
            self.seek_to(Duration::ZERO);
        } else {
            self.play_index(index);
        }
    }

    pub fn seek_to(&mut self, position: Duration) {
        if let Err(error) = self.backend.seek_to(position) {
            self.seek_failed(error);
        }
    }

    pub fn seek_to_percent(&mut self, percent: f32) {
        if let Err(error) = self.backend.seek_to_percent(percent) {
            self.seek_failed(error);
        }
    }

    // Nothing stays audible behind an `Error` state; resume reopens the item.
    fn seek_failed(&mut self, error: StreamError) {
        self.backend.stop();
        self.interrupted = false;
        self.raise(error);
    }

    pub fn begin_interruption(&mut self) {
        if self.delegate_handles(|delegate| delegate.interruption_began()) {
            return;
        }
        if matches!(self.state, PlaybackState::Playing | PlaybackState::Buffering) {
            self.pause();
            self.interrupted = true;
        }
    }

    pub fn end_interruption(&mut self, should_resume: bool) {
        if self.delegate_handles(|delegate| delegate.interruption_ended(should_resume)) {
            return;
        }
        let interrupted = std::mem::take(&mut self.interrupted);
        if interrupted && should_resume && self.state == PlaybackState::Paused {
            self.resume();
        }
    }

    pub fn next_index(&self) -> Option<usize> {
        let index = self.current_index?;
        neighbour(&self.queue, index, self.shuffle, self.loop_queue, Step::Forward)
    }

    pub fn previous_index(&self) -> Option<usize> {
        let index = self.current_index?;
        neighbour(&self.queue, index, self.shuffle, self.loop_queue, Step::Backward)
    }

    pub fn next_item(&self) -> Option<&AudioItem> {
        self.next_index().and_then(|index| self.queue.get(index))
    }

    pub fn previous_item(&self) -> Option<&AudioItem> {
        self.previous_index().and_then(|index| self.queue.get(index))
    }

    pub fn current_item(&self) -> Option<&AudioItem> {
        self.current_index.and_then(|index| self.queue.get(index))
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn is_playing_first_item(&self) -> bool {
        self.current_index.is_some_and(|index| {
            neighbour(&self.queue, index, self.shuffle, false, Step::Backward).is_none()
        })
    }

    pub fn is_playing_last_item(&self) -> bool {
        self.current_index.is_some_and(|index| {
            neighbour(&self.queue, index, self.shuffle, false, Step::Forward).is_none()
        })
    }

    fn first_index(&self) -> Option<usize> {
        if self.queue.is_empty() {
            None
        } else if self.shuffle {
            self.queue.logical_index_at(0)
        } else {
            Some(0)
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn is_buffering(&self) -> bool {
        self.state == PlaybackState::Buffering
    }

    pub fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.backend.elapsed()
    }

    pub fn duration(&self) -> Duration {
        self.backend
            .current_duration()
            .or_else(|| self.current_item().map(|item| item.duration))
            .unwrap_or_default()
    }

    pub fn percent_elapsed(&self) -> f32 {
        duration::fraction(self.elapsed(), self.duration())
    }

    pub fn volume(&self) -> f32 {
        self.backend.volume()
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.backend.set_volume(volume);
    }

    pub fn equalizer(&self) -> EqualizerSettings {
        self.backend.equalizer()
    }

    pub fn set_equalizer(&mut self, settings: EqualizerSettings) {
        self.backend.set_equalizer(settings);
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn set_shuffle(&mut self, shuffle: bool) {
        if self.shuffle == shuffle {
            return;
        }
        self.shuffle = shuffle;
        if shuffle {
            if let Some(index) = self.current_index {
                self.queue.set_anchor(index);
            }
            self.queue.reshuffle();
        }
        self.revalidate_preload();
        self.redraw(RedrawReason::QueueChanged);
    }

    pub fn loop_queue(&self) -> bool {
        self.loop_queue
    }

    pub fn set_loop_queue(&mut self, loop_queue: bool) {
        if self.loop_queue != loop_queue {
            self.loop_queue = loop_queue;
            self.revalidate_preload();
        }
    }

    pub fn loop_item(&self) -> bool {
        self.loop_item
    }

    pub fn set_loop_item(&mut self, loop_item: bool) {
        if self.loop_item != loop_item {
            self.loop_item = loop_item;
            self.revalidate_preload();
        }
    }

    pub fn backward_style(&self) -> BackwardStyle {
        self.backward_style
    }

    pub fn set_backward_style(&mut self, style: BackwardStyle) {
        self.backward_style = style;
    }

    pub fn tuning(&self) -> PlaybackTuning {
        self.backend.tuning()
    }

    pub fn set_tuning(&mut self, tuning: PlaybackTuning) {
        self.backend.set_tuning(tuning);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.backend.downloaded_bytes()
    }

    pub fn total_file_bytes(&self) -> Option<u64> {
        self.backend.total_file_bytes()
    }

    pub fn tick(&mut self) {
        self.apply_loaded_metadata();

        let mut cursor = QueueCursor {
            queue: &self.queue,
            shuffle: self.shuffle,
            loop_queue: self.loop_queue,
            loop_item: self.loop_item,
            requests: Vec::new(),
        };
        let events = self.backend.tick(&mut cursor);
        let requests = cursor.requests;

        for event in events {
            self.handle_backend_event(event);
        }
        for id in requests {
            let Some(item) = self.queue.item_for_id(id) else {
                continue;
            };
            let url = item.playback_url.clone();
            self.backend.next_track_url_loaded(id, &url);
            if let Some(index) = self.queue.index_of_id(id) {
                self.request_metadata(index);
            }
        }
    }

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::AudioSessionReady => self.notify(|delegate| delegate.audio_session_set_up()),
            BackendEvent::StateChanged(state) => {
                if state == self.backend.state() && self.state != PlaybackState::Error {
                    self.sync_with_backend();
                }
            }
            BackendEvent::PlaybackProgress { elapsed, total } => {
                let total = total.unwrap_or_else(|| self.duration());
                self.notify(|delegate| delegate.progress_changed(elapsed, total));
            }
            BackendEvent::DownloadProgress {
                active: true,
                downloaded,
                total,
            } => self.notify(|delegate| delegate.downloaded_bytes(downloaded, total)),
            BackendEvent::DownloadProgress { active: false, .. } => {}
            BackendEvent::StreamFailed(error) => self.raise(error),
            BackendEvent::FinishedPlaying {
                identifier, next, ..
            } => self.on_finished(identifier, next),
        }
    }

    fn on_finished(&mut self, identifier: PlaybackId, next: Option<PlaybackId>) {
        if self.current_id != Some(identifier) {
            debug!(%identifier, "finished stream is no longer current");
        }
        if self.loop_item
            && let Some(index) = self.current_index
        {
            self.play_index(index);
            return;
        }
        if let Some(index) = next.and_then(|id| self.queue.index_of_id(id)) {
            self.adopt_index(index);
            self.redraw(RedrawReason::TrackChanged);
            self.sync_with_backend();
            self.request_upcoming_metadata();
            return;
        }
        match self.next_index() {
            Some(index) => self.play_index(index),
            None => self.stop(),
        }
    }

    fn raise(&mut self, error: StreamError) {
        warn!(url = %error.url, kind = %error.kind, detail = %error.detail, "stream error");
        let url = error.url.clone();
        self.notify(|delegate| delegate.error_raised(&error, &url));
        self.last_error = Some(error);
        self.set_state(PlaybackState::Error);
    }

    fn sync_with_backend(&mut self) {
        let state = match self.backend.state() {
            BackendState::Stopped => PlaybackState::Stopped,
            BackendState::Buffering => PlaybackState::Buffering,
            BackendState::Playing => PlaybackState::Playing,
            BackendState::Paused => PlaybackState::Paused,
        };
        self.set_state(state);
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        self.state = state;
        let reason = match state {
            PlaybackState::Buffering => RedrawReason::Buffering,
            PlaybackState::Playing => RedrawReason::Playing,
            PlaybackState::Paused => RedrawReason::Paused,
            PlaybackState::Error => RedrawReason::Error,
            PlaybackState::Idle | PlaybackState::Stopped => RedrawReason::Stopped,
        };
        self.redraw(reason);
    }

    fn revalidate_preload(&mut self) {
        let cursor = QueueCursor {
            queue: &self.queue,
            shuffle: self.shuffle,
            loop_queue: self.loop_queue,
            loop_item: self.loop_item,
            requests: Vec::new(),
        };
        self.backend.next_track_may_have_changed(&cursor);
    }

    fn request_upcoming_metadata(&mut self) {
        if self.metadata.is_none() {
            return;
        }
        if let Some(index) = self.current_index {
            self.request_metadata(index);
        }
        if let Some(index) = self.next_index() {
            self.request_metadata(index);
        }
    }

    fn request_metadata(&mut self, index: usize) {
        let (Some(loader), Some(item)) = (self.metadata.as_ref(), self.queue.get(index)) else {
            return;
        };
        if item.metadata_loaded || !self.requested.insert(item.playback_id()) {
            return;
        }
        let loaded = self.loaded_tx.clone();
        loader.load_metadata(
            item,
            Box::new(move |item| {
                let _ = loaded.send(item);
            }),
        );
    }

    fn apply_loaded_metadata(&mut self) {
        while let Ok(item) = self.loaded_rx.try_recv() {
            let id = item.playback_id();
            self.requested.remove(&id);
            if self.queue.refresh_item(item).is_none() {
                continue;
            }
            let reason = if self.current_id == Some(id) {
                RedrawReason::TrackChanged
            } else {
                RedrawReason::QueueChanged
            };
            self.redraw(reason);
        }
    }

    fn redraw(&self, reason: RedrawReason) {
        self.notify(|delegate| delegate.ui_needs_redraw(reason));
    }

    fn notify(&self, call: impl FnOnce(&dyn PlayerDelegate)) {
        if let Some(delegate) = self.delegate.as_ref().and_then(Weak::upgrade) {
            call(delegate.as_ref());
        }
    }

    fn delegate_handles(&self, call: impl FnOnce(&dyn PlayerDelegate) -> bool) -> bool {
        self.delegate
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|delegate| call(delegate.as_ref()))
    }
}
