use super::{AudioOutput, NativeEvent, NativeEventKind, NativeFailure, StreamToken, probe};
use crate::error::StreamErrorKind;
use crate::model::EqualizerSettings;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use url::Url;

#[derive(Debug, Default)]
struct Script {
    durations: HashMap<Url, Duration>,
    default_duration: Option<Duration>,
    failures: HashMap<Url, NativeFailure>,
    deferred: HashSet<Url>,
    completions: Vec<Url>,
    finishes: Vec<Url>,
    breaks: Vec<(Url, NativeFailure)>,
    positions: Vec<(Url, Duration)>,
    opened: Vec<Url>,
    closed: Vec<Url>,
    playing: Vec<Url>,
    volume: f32,
    equalizer: EqualizerSettings,
}

#[derive(Debug, Clone, Default)]
pub struct NullControl {
    script: Arc<Mutex<Script>>,
}

impl NullControl {
    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_duration(&self, url: &Url, duration: Duration) {
        self.lock().durations.insert(url.clone(), duration);
    }

    pub fn set_default_duration(&self, duration: Option<Duration>) {
        self.lock().default_duration = duration;
    }

    pub fn fail_url(&self, url: &Url, kind: StreamErrorKind) {
        self.lock().failures.insert(
            url.clone(),
            NativeFailure::new(kind, format!("scripted failure for {url}")),
        );
    }

    pub fn defer_url(&self, url: &Url) {
        self.lock().deferred.insert(url.clone());
    }

    pub fn complete(&self, url: &Url) {
        let mut script = self.lock();
        script.deferred.remove(url);
        script.completions.push(url.clone());
    }

    pub fn finish(&self, url: &Url) {
        self.lock().finishes.push(url.clone());
    }

    pub fn break_url(&self, url: &Url, kind: StreamErrorKind) {
        self.lock().breaks.push((
            url.clone(),
            NativeFailure::new(kind, format!("scripted break for {url}")),
        ));
    }

    pub fn set_position(&self, url: &Url, position: Duration) {
        self.lock().positions.push((url.clone(), position));
    }

    pub fn opened(&self) -> Vec<Url> {
        self.lock().opened.clone()
    }

    pub fn closed(&self) -> Vec<Url> {
        self.lock().closed.clone()
    }

    pub fn playing(&self) -> Vec<Url> {
        self.lock().playing.clone()
    }

    pub fn volume(&self) -> f32 {
        self.lock().volume
    }

    pub fn equalizer(&self) -> EqualizerSettings {
        self.lock().equalizer
    }
}

#[derive(Debug)]
struct NullStream {
    url: Url,
    events: Sender<NativeEvent>,
    ready: bool,
    ended: bool,
    paused: bool,
    started_at: Option<Instant>,
    offset: Duration,
    duration: Option<Duration>,
    follower: Option<StreamToken>,
}

impl NullStream {
    fn position(&self) -> Duration {
        let mut position = self.offset;
        if let Some(started_at) = self.started_at {
            position = position.saturating_add(started_at.elapsed());
        }
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn audible(&self) -> bool {
        self.ready && !self.ended && !self.paused
    }

    fn start(&mut self) {
        self.paused = false;
        if self.ready && !self.ended && self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    fn halt(&mut self) {
        self.offset = self.position();
        self.started_at = None;
        self.paused = true;
    }

    fn send(&self, token: StreamToken, kind: NativeEventKind) {
        let _ = self.events.send(NativeEvent::new(token, kind));
    }
}

#[derive(Debug)]
pub struct NullOutput {
    control: NullControl,
    streams: HashMap<StreamToken, NullStream>,
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl NullOutput {
    pub fn new() -> Self {
        Self::with_control(NullControl::default())
    }

    pub fn with_control(control: NullControl) -> Self {
        control.lock().volume = 1.0;
        Self {
            control,
            streams: HashMap::new(),
        }
    }

    pub fn control(&self) -> NullControl {
        self.control.clone()
    }

    fn duration_for(&self, url: &Url) -> Option<Duration> {
        let script = self.control.lock();
        if let Some(duration) = script.durations.get(url) {
            return Some(*duration);
        }
        let default = script.default_duration;
        drop(script);
        if url.scheme() == "file"
            && let Ok(path) = url.to_file_path()
            && let Ok(report) = probe::probe_file(&path)
            && let Some(duration) = report.duration.filter(|duration| !duration.is_zero())
        {
            return Some(duration);
        }
        default
    }

    fn make_ready(&mut self, token: StreamToken) {
        let Some(stream) = self.streams.get_mut(&token) else {
            return;
        };
        if stream.ready {
            return;
        }
        stream.ready = true;
        if !stream.paused {
            stream.start();
        }
        stream.send(
            token,
            NativeEventKind::Ready {
                duration: stream.duration,
            },
        );
    }

    fn end(&mut self, token: StreamToken) {
        let Some(stream) = self.streams.get_mut(&token) else {
            return;
        };
        if stream.ended {
            return;
        }
        stream.ended = true;
        stream.offset = stream.position();
        stream.started_at = None;
        let follower = stream.follower.take();
        stream.send(token, NativeEventKind::Ended);
        if let Some(next) = follower.and_then(|next| self.streams.get_mut(&next)) {
            next.start();
        }
    }

    fn fail(&mut self, token: StreamToken, failure: NativeFailure) {
        let Some(stream) = self.streams.get_mut(&token) else {
            return;
        };
        stream.ended = true;
        stream.offset = stream.position();
        stream.started_at = None;
        stream.follower = None;
        stream.send(token, NativeEventKind::Failed(failure));
    }

    fn tokens_for(&self, url: &Url) -> Vec<StreamToken> {
        let mut tokens: Vec<StreamToken> = self
            .streams
            .iter()
            .filter(|(_, stream)| &stream.url == url)
            .map(|(token, _)| *token)
            .collect();
        tokens.sort();
        tokens
    }

    fn publish_playing(&self) {
        let mut playing: Vec<(StreamToken, Url)> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.audible())
            .map(|(token, stream)| (*token, stream.url.clone()))
            .collect();
        playing.sort();
        self.control.lock().playing = playing.into_iter().map(|(_, url)| url).collect();
    }
}

impl AudioOutput for NullOutput {
    fn name(&self) -> String {
        "Null audio output".to_string()
    }

    fn open(&mut self, token: StreamToken, url: &Url, events: Sender<NativeEvent>) {
        let duration = self.duration_for(url);
        let (failure, deferred) = {
            let mut script = self.control.lock();
            script.opened.push(url.clone());
            (script.failures.get(url).cloned(), script.deferred.contains(url))
        };
        if let Some(failure) = failure {
            let _ = events.send(NativeEvent::new(token, NativeEventKind::Failed(failure)));
            return;
        }
        self.streams.insert(
            token,
            NullStream {
                url: url.clone(),
                events,
                ready: false,
                ended: false,
                paused: true,
                started_at: None,
                offset: Duration::ZERO,
                duration,
                follower: None,
            },
        );
        if !deferred {
            self.make_ready(token);
        }
    }

    fn play(&mut self, token: StreamToken) {
        if let Some(stream) = self.streams.get_mut(&token) {
            stream.start();
        }
        self.publish_playing();
    }

    fn pause(&mut self, token: StreamToken) {
        if let Some(stream) = self.streams.get_mut(&token) {
            stream.halt();
        }
        self.publish_playing();
    }

    fn close(&mut self, token: StreamToken) {
        if let Some(stream) = self.streams.remove(&token) {
            self.control.lock().closed.push(stream.url);
        }
        for stream in self.streams.values_mut() {
            if stream.follower == Some(token) {
                stream.follower = None;
            }
        }
        self.publish_playing();
    }

    fn seek(&mut self, token: StreamToken, position: Duration) -> Result<(), NativeFailure> {
        let stream = self.streams.get_mut(&token).ok_or_else(|| {
            NativeFailure::new(StreamErrorKind::Unknown, format!("{token} is not open"))
        })?;
        stream.offset = stream
            .duration
            .map_or(position, |duration| position.min(duration));
        stream.ended = false;
        stream.started_at = (!stream.paused && stream.ready).then(Instant::now);
        Ok(())
    }

    fn position(&self, token: StreamToken) -> Option<Duration> {
        self.streams.get(&token).map(NullStream::position)
    }

    fn set_volume(&mut self, volume: f32) {
        self.control.lock().volume = volume.clamp(0.0, 1.0);
    }

    fn set_equalizer(&mut self, settings: EqualizerSettings) {
        self.control.lock().equalizer = settings.clamped();
    }

    fn chain(&mut self, current: StreamToken, next: StreamToken) {
        if !self.streams.contains_key(&next) {
            return;
        }
        if let Some(stream) = self.streams.get_mut(&current) {
            stream.follower = Some(next);
        }
    }

    fn poll(&mut self) {
        let (completions, finishes, breaks, positions) = {
            let mut script = self.control.lock();
            (
                std::mem::take(&mut script.completions),
                std::mem::take(&mut script.finishes),
                std::mem::take(&mut script.breaks),
                std::mem::take(&mut script.positions),
            )
        };

        for url in completions {
            for token in self.tokens_for(&url) {
                self.make_ready(token);
            }
        }
        for (url, position) in positions {
            for token in self.tokens_for(&url) {
                if let Some(stream) = self.streams.get_mut(&token) {
                    stream.offset = position;
                    stream.started_at = stream.audible().then(Instant::now);
                }
            }
        }
        for url in finishes {
            let audible = self
                .tokens_for(&url)
                .into_iter()
                .find(|token| self.streams.get(token).is_some_and(NullStream::audible));
            if let Some(token) = audible {
                self.end(token);
            }
        }

        for (url, failure) in breaks {
            let audible = self
                .tokens_for(&url)
                .into_iter()
                .find(|token| self.streams.get(token).is_some_and(NullStream::audible));
            if let Some(token) = audible {
                self.fail(token, failure);
            }
        }

        let natural: Vec<StreamToken> = self
            .streams
            .iter()
            .filter(|(_, stream)| {
                stream.audible()
                    && stream
                        .duration
                        .is_some_and(|duration| stream.position() >= duration)
            })
            .map(|(token, _)| *token)
            .collect();
        for token in natural {
            self.end(token);
        }
        self.publish_playing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::probe::fixtures::write_test_wav;
    use std::sync::mpsc;
    use std::thread;
    use tempfile::tempdir;

    fn url(name: &str) -> Url {
        Url::parse(&format!("https://example.com/{name}.mp3")).expect("url")
    }

    #[test]
    fn position_advances_only_while_playing() {
        let (tx, _rx) = mpsc::channel();
        let mut output = NullOutput::new();
        let token = StreamToken::new(1);
        output.open(token, &url("a"), tx);
        let opened = output.position(token).expect("position");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(output.position(token), Some(opened), "opened streams start paused");

        output.play(token);
        thread::sleep(Duration::from_millis(20));
        let playing = output.position(token).expect("position");
        assert!(playing > opened);

        output.pause(token);
        let paused = output.position(token).expect("position");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(output.position(token), Some(paused));
    }

    #[test]
    fn scripted_failure_is_reported_on_open() {
        let (tx, rx) = mpsc::channel();
        let mut output = NullOutput::new();
        let control = output.control();
        control.fail_url(&url("bad"), StreamErrorKind::NoNetwork);

        output.open(StreamToken::new(4), &url("bad"), tx);

        let event = rx.try_recv().expect("event");
        assert!(matches!(
            event.kind,
            NativeEventKind::Failed(NativeFailure { kind: StreamErrorKind::NoNetwork, .. })
        ));
    }

    #[test]
    fn deferred_open_waits_for_completion() {
        let (tx, rx) = mpsc::channel();
        let mut output = NullOutput::new();
        let control = output.control();
        control.defer_url(&url("slow"));

        output.open(StreamToken::new(2), &url("slow"), tx);
        assert!(rx.try_recv().is_err());

        control.complete(&url("slow"));
        output.poll();
        assert!(matches!(
            rx.try_recv().expect("ready").kind,
            NativeEventKind::Ready { .. }
        ));
    }

    #[test]
    fn chained_stream_starts_when_current_ends() {
        let (tx, rx) = mpsc::channel();
        let mut output = NullOutput::new();
        let control = output.control();
        let (a, b) = (StreamToken::new(1), StreamToken::new(2));
        output.open(a, &url("a"), tx.clone());
        output.open(b, &url("b"), tx);
        output.play(a);
        output.chain(a, b);

        control.finish(&url("a"));
        output.poll();

        assert_eq!(control.playing(), vec![url("b")]);
        let kinds: Vec<_> = rx.try_iter().map(|event| (event.token, event.kind)).collect();
        assert!(kinds.contains(&(a, NativeEventKind::Ended)));
    }

    #[test]
    fn broken_stream_fails_without_starting_its_follower() {
        let (tx, rx) = mpsc::channel();
        let mut output = NullOutput::new();
        let control = output.control();
        let (a, b) = (StreamToken::new(1), StreamToken::new(2));
        output.open(a, &url("a"), tx.clone());
        output.open(b, &url("b"), tx);
        output.play(a);
        output.chain(a, b);

        control.break_url(&url("a"), StreamErrorKind::NoNetwork);
        output.poll();

        assert!(control.playing().is_empty());
        let kinds: Vec<_> = rx
            .try_iter()
            .filter(|event| event.token == a)
            .map(|event| event.kind)
            .collect();
        assert!(kinds.iter().any(|kind| matches!(
            kind,
            NativeEventKind::Failed(NativeFailure { kind: StreamErrorKind::NoNetwork, .. })
        )));
        assert!(!kinds.contains(&NativeEventKind::Ended));
    }

    #[test]
    fn known_duration_ends_naturally() {
        let dir = tempdir().expect("tempdir");
        let track = dir.path().join("fixture.wav");
        write_test_wav(&track, 60);
        let track_url = Url::from_file_path(&track).expect("file url");

        let (tx, rx) = mpsc::channel();
        let mut output = NullOutput::new();
        let token = StreamToken::new(9);
        output.open(token, &track_url, tx);
        output.play(token);
        thread::sleep(Duration::from_millis(100));
        output.poll();

        let kinds: Vec<_> = rx.try_iter().map(|event| event.kind).collect();
        assert!(matches!(kinds.first(), Some(NativeEventKind::Ready { duration: Some(_) })));
        assert!(kinds.contains(&NativeEventKind::Ended));
    }

    #[test]
    fn unknown_duration_never_auto_ends() {
        let (tx, rx) = mpsc::channel();
        let mut output = NullOutput::new();
        let token = StreamToken::new(5);
        output.open(token, &url("live"), tx);
        output.play(token);
        thread::sleep(Duration::from_millis(30));
        output.poll();
        assert!(rx.try_iter().all(|event| event.kind != NativeEventKind::Ended));
    }
}
