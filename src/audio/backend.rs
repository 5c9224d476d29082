use super::{AudioOutput, NativeEvent, NativeEventKind, NativeFailure, StreamToken};
use crate::error::{StreamError, StreamErrorKind};
use crate::model::{EqualizerSettings, PlaybackId, PlaybackTuning};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use url::Url;

pub trait BackendDataSource {
    fn is_last_track(&self, url: &Url, identifier: PlaybackId) -> bool;
    fn next_track_identifier(&self, url: &Url, identifier: PlaybackId) -> Option<PlaybackId>;
    fn load_next_track_url(&mut self, identifier: PlaybackId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Stopped,
    Buffering,
    Playing,
    Paused,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    AudioSessionReady,
    StateChanged(BackendState),
    PlaybackProgress {
        elapsed: Duration,
        total: Option<Duration>,
    },
    DownloadProgress {
        active: bool,
        downloaded: u64,
        total: Option<u64>,
    },
    StreamFailed(StreamError),
    FinishedPlaying {
        identifier: PlaybackId,
        url: Url,
        next: Option<PlaybackId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StartAt {
    Position(Duration),
    Percent(f32),
}

#[derive(Debug, Clone)]
struct StreamSlot {
    token: StreamToken,
    url: Url,
    identifier: PlaybackId,
    ready: bool,
    duration: Option<Duration>,
    start_at: Option<StartAt>,
    downloaded: u64,
    total: Option<u64>,
}

impl StreamSlot {
    fn new(token: StreamToken, url: Url, identifier: PlaybackId) -> Self {
        Self {
            token,
            url,
            identifier,
            ready: false,
            duration: None,
            start_at: None,
            downloaded: 0,
            total: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextTrack {
    Unrequested,
    AwaitingUrl(PlaybackId),
    Preloaded,
    Declined,
    Failed,
}

/// Owns the active and preload streams and runs the gapless handoff between
/// them. Native events are drained by [`StreamingBackend::tick`] on the
/// controlling thread.
pub struct StreamingBackend {
    output: Box<dyn AudioOutput>,
    events_tx: Sender<NativeEvent>,
    events_rx: Receiver<NativeEvent>,
    next_token: u64,
    active: Option<StreamSlot>,
    preload: Option<StreamSlot>,
    next_track: NextTrack,
    state: BackendState,
    paused: bool,
    volume: f32,
    equalizer: EqualizerSettings,
    tuning: PlaybackTuning,
    last_progress: Option<Instant>,
    session_announced: bool,
    pending: Vec<BackendEvent>,
}

impl StreamingBackend {
    pub fn new(output: Box<dyn AudioOutput>, tuning: PlaybackTuning) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            output,
            events_tx,
            events_rx,
            next_token: 0,
            active: None,
            preload: None,
            next_track: NextTrack::Unrequested,
            state: BackendState::Stopped,
            paused: false,
            volume: 1.0,
            equalizer: EqualizerSettings::default(),
            tuning,
            last_progress: None,
            session_announced: false,
            pending: Vec::new(),
        }
    }

    pub fn output_name(&self) -> String {
        self.output.name()
    }

    pub fn tuning(&self) -> PlaybackTuning {
        self.tuning
    }

    pub fn set_tuning(&mut self, tuning: PlaybackTuning) {
        self.tuning = tuning;
    }

    pub fn play_url(&mut self, url: &Url, identifier: PlaybackId) {
        self.open_active(url, identifier, None);
    }

    pub fn play_url_starting_at(&mut self, url: &Url, identifier: PlaybackId, percent: f32) {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.open_active(url, identifier, Some(StartAt::Percent(percent)));
    }

    fn open_active(&mut self, url: &Url, identifier: PlaybackId, start_at: Option<StartAt>) {
        self.close_all();
        let token = self.allocate_token();
        debug!(%url, %token, "opening stream");
        let mut slot = StreamSlot::new(token, url.clone(), identifier);
        slot.start_at = start_at;
        self.active = Some(slot);
        self.paused = false;
        self.output.open(token, url, self.events_tx.clone());
        self.set_state(BackendState::Buffering);
    }

    pub fn resume(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        self.paused = false;
        if active.ready {
            self.output.play(active.token);
            self.set_state(BackendState::Playing);
        } else {
            self.set_state(BackendState::Buffering);
        }
    }

    pub fn pause(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        self.paused = true;
        self.output.pause(active.token);
        self.set_state(BackendState::Paused);
    }

    pub fn stop(&mut self) {
        self.close_all();
        self.paused = false;
        self.set_state(BackendState::Stopped);
    }

    pub fn skip_to_preloaded(&mut self) -> bool {
        let Some(preload) = self.preload.take() else {
            return false;
        };
        if let Some(active) = self.active.take() {
            self.output.close(active.token);
        }
        debug!(url = %preload.url, "skipping to preloaded stream");
        self.promote(preload);
        true
    }

    fn promote(&mut self, slot: StreamSlot) {
        let ready = slot.ready;
        let token = slot.token;
        self.active = Some(slot);
        self.next_track = NextTrack::Unrequested;
        self.last_progress = None;
        if !ready {
            self.set_state(BackendState::Buffering);
        } else if self.paused {
            self.output.pause(token);
            self.set_state(BackendState::Paused);
        } else {
            self.output.play(token);
            self.set_state(BackendState::Playing);
        }
    }

    // Seeking with no active stream does nothing. Before the stream is ready
    // the position is held and applied on `Ready`.
    pub fn seek_to(&mut self, position: Duration) -> Result<(), StreamError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if !active.ready {
            active.start_at = Some(StartAt::Position(position));
            return Ok(());
        }
        let position = active
            .duration
            .map_or(position, |duration| position.min(duration));
        let (token, url, identifier) = (active.token, active.url.clone(), active.identifier);
        self.output.seek(token, position).map_err(|failure| {
            StreamError::new(failure.kind, url, identifier, failure.detail)
        })?;
        self.last_progress = None;
        Ok(())
    }

    pub fn seek_to_percent(&mut self, percent: f32) -> Result<(), StreamError> {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if !active.ready {
            active.start_at = Some(StartAt::Percent(percent));
            return Ok(());
        }
        let Some(duration) = active.duration else {
            return Err(StreamError::new(
                StreamErrorKind::Unknown,
                active.url.clone(),
                active.identifier,
                "stream length is unknown",
            ));
        };
        self.seek_to(duration.mul_f32(percent))
    }

    pub fn next_track_changed(&mut self) {
        if let Some(preload) = self.preload.take() {
            debug!(url = %preload.url, "discarding preload");
            self.output.close(preload.token);
        }
        self.next_track = NextTrack::Unrequested;
    }

    pub fn next_track_may_have_changed(&mut self, source: &dyn BackendDataSource) {
        let Some(active) = &self.active else {
            self.next_track_changed();
            return;
        };
        let expected = if source.is_last_track(&active.url, active.identifier) {
            None
        } else {
            source.next_track_identifier(&active.url, active.identifier)
        };
        let still_valid = match self.next_track {
            NextTrack::Unrequested | NextTrack::Failed => true,
            NextTrack::Declined => expected.is_none(),
            NextTrack::AwaitingUrl(id) => expected == Some(id),
            NextTrack::Preloaded => {
                self.preload.as_ref().map(|slot| slot.identifier) == expected
            }
        };
        if !still_valid {
            self.next_track_changed();
        }
    }

    pub fn next_track_url_loaded(&mut self, identifier: PlaybackId, url: &Url) {
        if self.next_track != NextTrack::AwaitingUrl(identifier) {
            trace!(%identifier, "ignoring url for a track no longer awaited");
            return;
        }
        let token = self.allocate_token();
        debug!(%url, %token, "opening preload");
        self.preload = Some(StreamSlot::new(token, url.clone(), identifier));
        self.next_track = NextTrack::Preloaded;
        self.output.open(token, url, self.events_tx.clone());
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.output.set_volume(self.volume);
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_equalizer(&mut self, settings: EqualizerSettings) {
        self.equalizer = settings.clamped();
        self.output.set_equalizer(self.equalizer);
    }

    pub fn equalizer(&self) -> EqualizerSettings {
        self.equalizer
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn current_url(&self) -> Option<&Url> {
        self.active.as_ref().map(|slot| &slot.url)
    }

    pub fn current_identifier(&self) -> Option<PlaybackId> {
        self.active.as_ref().map(|slot| slot.identifier)
    }

    pub fn next_url(&self) -> Option<&Url> {
        self.preload.as_ref().map(|slot| &slot.url)
    }

    pub fn next_identifier(&self) -> Option<PlaybackId> {
        self.preload.as_ref().map(|slot| slot.identifier)
    }

    pub fn is_preload_ready(&self) -> bool {
        self.preload.as_ref().is_some_and(|slot| slot.ready)
    }

    pub fn is_active_ready(&self) -> bool {
        self.active.as_ref().is_some_and(|slot| slot.ready)
    }

    pub fn current_duration(&self) -> Option<Duration> {
        self.active.as_ref().and_then(|slot| slot.duration)
    }

    pub fn elapsed(&self) -> Duration {
        let Some(active) = &self.active else {
            return Duration::ZERO;
        };
        let position = self.output.position(active.token).unwrap_or_default();
        active
            .duration
            .map_or(position, |duration| position.min(duration))
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.active.as_ref().map_or(0, |slot| slot.downloaded)
    }

    pub fn total_file_bytes(&self) -> Option<u64> {
        self.active.as_ref().and_then(|slot| slot.total)
    }

    pub fn tick(&mut self, source: &mut dyn BackendDataSource) -> Vec<BackendEvent> {
        self.output.poll();
        if !self.session_announced {
            self.session_announced = true;
            self.pending.push(BackendEvent::AudioSessionReady);
        }

        while let Ok(event) = self.events_rx.try_recv() {
            let is_active = self.active.as_ref().map(|slot| slot.token) == Some(event.token);
            let is_preload = self.preload.as_ref().map(|slot| slot.token) == Some(event.token);
            if is_active {
                self.on_active_event(event.kind, source);
            } else if is_preload {
                self.on_preload_event(event.kind);
            } else {
                trace!(token = %event.token, kind = ?event.kind, "discarding event for stale stream");
            }
        }

        self.check_preload(source);
        self.report_progress();
        std::mem::take(&mut self.pending)
    }

    fn on_active_event(&mut self, kind: NativeEventKind, source: &mut dyn BackendDataSource) {
        match kind {
            NativeEventKind::Ready { duration } => self.on_active_ready(duration),
            NativeEventKind::Stalled => {
                if self.state == BackendState::Playing {
                    self.set_state(BackendState::Buffering);
                }
            }
            NativeEventKind::Resumed => {
                if self.state == BackendState::Buffering && self.is_active_ready() && !self.paused {
                    self.set_state(BackendState::Playing);
                }
            }
            NativeEventKind::Downloaded { downloaded, total } => {
                if let Some(active) = self.active.as_mut() {
                    active.downloaded = downloaded;
                    active.total = total.or(active.total);
                }
                self.pending.push(BackendEvent::DownloadProgress {
                    active: true,
                    downloaded,
                    total,
                });
            }
            NativeEventKind::Failed(failure) => self.on_active_failed(failure),
            NativeEventKind::Ended => self.on_active_ended(source),
        }
    }

    fn on_active_ready(&mut self, duration: Option<Duration>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.ready = true;
        active.duration = duration.filter(|duration| !duration.is_zero());
        let token = active.token;
        let start = match active.start_at.take() {
            Some(StartAt::Position(position)) => Some(position),
            Some(StartAt::Percent(percent)) => active.duration.map(|d| d.mul_f32(percent)),
            None => None,
        };
        if let Some(position) = start.filter(|position| !position.is_zero())
            && let Err(failure) = self.output.seek(token, position)
        {
            warn!(detail = %failure.detail, "could not apply start position");
        }
        self.last_progress = None;
        if self.paused {
            self.set_state(BackendState::Paused);
        } else {
            self.output.play(token);
            self.set_state(BackendState::Playing);
        }
    }

    fn on_active_failed(&mut self, failure: NativeFailure) {
        let Some(active) = self.active.take() else {
            return;
        };
        let error = StreamError::new(failure.kind, active.url, active.identifier, failure.detail);
        self.output.close(active.token);
        self.next_track_changed();
        self.state = BackendState::Stopped;
        self.pending.push(BackendEvent::StreamFailed(error));
    }

    fn on_active_ended(&mut self, source: &mut dyn BackendDataSource) {
        let Some(finished) = self.active.take() else {
            return;
        };
        self.output.close(finished.token);
        let expected = if source.is_last_track(&finished.url, finished.identifier) {
            None
        } else {
            source.next_track_identifier(&finished.url, finished.identifier)
        };

        let handoff = match self.preload.take() {
            Some(preload) if Some(preload.identifier) == expected => Some(preload),
            Some(stale) => {
                debug!(url = %stale.url, "preload no longer matches the next track");
                self.output.close(stale.token);
                None
            }
            None => None,
        };

        let next = handoff.as_ref().map(|slot| slot.identifier);
        match handoff {
            Some(preload) => {
                debug!(url = %preload.url, "gapless handoff to preload");
                self.promote(preload);
            }
            None => {
                self.next_track = NextTrack::Unrequested;
                self.state = BackendState::Stopped;
            }
        }
        self.pending.push(BackendEvent::FinishedPlaying {
            identifier: finished.identifier,
            url: finished.url,
            next,
        });
    }

    fn on_preload_event(&mut self, kind: NativeEventKind) {
        match kind {
            NativeEventKind::Ready { duration } => {
                let Some(preload) = self.preload.as_mut() else {
                    return;
                };
                preload.ready = true;
                preload.duration = duration.filter(|duration| !duration.is_zero());
                let next = preload.token;
                debug!(url = %preload.url, "preload ready");
                if let Some(active) = &self.active {
                    self.output.chain(active.token, next);
                }
            }
            NativeEventKind::Downloaded { downloaded, total } => {
                if let Some(preload) = self.preload.as_mut() {
                    preload.downloaded = downloaded;
                    preload.total = total.or(preload.total);
                }
                self.pending.push(BackendEvent::DownloadProgress {
                    active: false,
                    downloaded,
                    total,
                });
            }
            NativeEventKind::Failed(failure) => {
                if let Some(preload) = self.preload.take() {
                    warn!(
                        url = %preload.url,
                        kind = %failure.kind,
                        detail = %failure.detail,
                        "preload failed; next track will open normally"
                    );
                    self.output.close(preload.token);
                }
                self.next_track = NextTrack::Failed;
            }
            NativeEventKind::Stalled | NativeEventKind::Resumed | NativeEventKind::Ended => {}
        }
    }

    fn check_preload(&mut self, source: &mut dyn BackendDataSource) {
        if self.next_track != NextTrack::Unrequested || self.state != BackendState::Playing {
            return;
        }
        let Some(active) = &self.active else {
            return;
        };
        let Some(duration) = active.duration else {
            return;
        };
        let window = self.tuning.preload_window();
        let remaining = duration.saturating_sub(self.elapsed());
        if duration > window && remaining > window {
            return;
        }

        let (url, identifier) = (active.url.clone(), active.identifier);
        if source.is_last_track(&url, identifier) {
            debug!(%url, "active stream is the last track; no preload");
            self.next_track = NextTrack::Declined;
            return;
        }
        match source.next_track_identifier(&url, identifier) {
            Some(next) => {
                debug!(%url, %next, "requesting next track url");
                self.next_track = NextTrack::AwaitingUrl(next);
                source.load_next_track_url(next);
            }
            None => self.next_track = NextTrack::Declined,
        }
    }

    fn report_progress(&mut self) {
        if self.state != BackendState::Playing {
            return;
        }
        let interval = self.tuning.progress_interval();
        if self
            .last_progress
            .is_some_and(|last| last.elapsed() < interval)
        {
            return;
        }
        self.last_progress = Some(Instant::now());
        self.pending.push(BackendEvent::PlaybackProgress {
            elapsed: self.elapsed(),
            total: self.current_duration(),
        });
    }

    fn set_state(&mut self, state: BackendState) {
        if self.state != state {
            self.state = state;
            self.pending.push(BackendEvent::StateChanged(state));
        }
    }

    fn close_all(&mut self) {
        if let Some(active) = self.active.take() {
            self.output.close(active.token);
        }
        self.next_track_changed();
        self.last_progress = None;
    }

    fn allocate_token(&mut self) -> StreamToken {
        self.next_token += 1;
        StreamToken::new(self.next_token)
    }
}

impl Drop for StreamingBackend {
    fn drop(&mut self) {
        self.close_all();
    }
}
