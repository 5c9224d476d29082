use super::equalizer::{EqualizerControl, Equalized};
use super::http::{self, BufferReader, StreamBuffer};
use super::{AudioOutput, NativeEvent, NativeEventKind, NativeFailure, StreamToken, errors, probe};
use crate::error::StreamErrorKind;
use crate::model::EqualizerSettings;
use anyhow::{Context, Result};
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::source::SeekError;
use rodio::{
    ChannelCount, Decoder, DeviceSinkBuilder, MixerDeviceSink, Player, SampleRate, Source,
};
use std::collections::HashMap;
#[cfg(unix)]
use std::ffi::CString;
use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use url::Url;

type BoxedSource = Box<dyn Source + Send>;
type Follower = Arc<Mutex<Option<(StreamToken, Arc<Player>)>>>;

struct OpenStream {
    player: Arc<Player>,
    cancelled: Arc<AtomicBool>,
    buffer: Option<Arc<StreamBuffer>>,
    follower: Follower,
}

enum Origin {
    File(PathBuf),
    Network(Arc<StreamBuffer>),
}

pub struct RodioOutput {
    sink: MixerDeviceSink,
    device: Option<String>,
    streams: HashMap<StreamToken, OpenStream>,
    volume: f32,
    equalizer: EqualizerControl,
}

impl RodioOutput {
    pub fn new(device: Option<&str>) -> Result<Self> {
        let sink = open_device_sink(device)?;
        Ok(Self {
            sink,
            device: device.map(ToOwned::to_owned),
            streams: HashMap::new(),
            volume: 1.0,
            equalizer: EqualizerControl::default(),
        })
    }

    pub fn available_outputs() -> Vec<String> {
        let mut outputs: Vec<String> = with_silenced_stderr(|| {
            rodio::cpal::default_host()
                .output_devices()
                .ok()
                .into_iter()
                .flatten()
                .filter_map(|device| device_name(&device))
                .collect()
        });
        outputs.sort_by_cached_key(|name| name.to_ascii_lowercase());
        outputs.dedup();
        outputs
    }

    fn origin_for(
        url: &Url,
        token: StreamToken,
        events: &Sender<NativeEvent>,
    ) -> Result<Origin, NativeFailure> {
        match url.scheme() {
            "file" => url.to_file_path().map(Origin::File).map_err(|()| {
                NativeFailure::new(StreamErrorKind::InvalidUrl, "file URL has no local path")
            }),
            "http" | "https" => http::spawn_download(url, token, events.clone())
                .map(Origin::Network)
                .map_err(|err| errors::from_io(&err)),
            other => Err(errors::unsupported_scheme(other)),
        }
    }
}

impl AudioOutput for RodioOutput {
    fn name(&self) -> String {
        self.device
            .clone()
            .unwrap_or_else(|| "System default output (CPAL)".to_string())
    }

    fn open(&mut self, token: StreamToken, url: &Url, events: Sender<NativeEvent>) {
        let player = Arc::new(Player::connect_new(self.sink.mixer()));
        player.pause();
        player.set_volume(self.volume);
        let cancelled = Arc::new(AtomicBool::new(false));
        let follower = Follower::default();

        let origin = match Self::origin_for(url, token, &events) {
            Ok(origin) => origin,
            Err(failure) => {
                let _ = events.send(NativeEvent::new(token, NativeEventKind::Failed(failure)));
                return;
            }
        };
        let buffer = match &origin {
            Origin::Network(buffer) => Some(Arc::clone(buffer)),
            Origin::File(_) => None,
        };

        let failures = events.clone();
        let opener = Opener {
            token,
            url: url.clone(),
            events,
            player: Arc::clone(&player),
            buffer: buffer.clone(),
            cancelled: Arc::clone(&cancelled),
            follower: Arc::clone(&follower),
            equalizer: self.equalizer.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("upnext-open-{token}"))
            .spawn(move || opener.run(origin));
        if let Err(err) = spawned {
            if let Some(buffer) = &buffer {
                buffer.cancel();
            }
            let failure = errors::from_io(&err);
            let _ = failures.send(NativeEvent::new(token, NativeEventKind::Failed(failure)));
            return;
        }

        self.streams.insert(
            token,
            OpenStream {
                player,
                cancelled,
                buffer,
                follower,
            },
        );
    }

    fn play(&mut self, token: StreamToken) {
        if let Some(stream) = self.streams.get(&token) {
            stream.player.play();
        }
    }

    fn pause(&mut self, token: StreamToken) {
        if let Some(stream) = self.streams.get(&token) {
            stream.player.pause();
        }
    }

    fn close(&mut self, token: StreamToken) {
        let Some(stream) = self.streams.remove(&token) else {
            return;
        };
        stream.cancelled.store(true, Ordering::Release);
        if let Some(buffer) = &stream.buffer {
            buffer.cancel();
        }
        stream.player.stop();
        for other in self.streams.values() {
            let mut follower = other.follower.lock().unwrap_or_else(PoisonError::into_inner);
            if follower.as_ref().is_some_and(|(next, _)| *next == token) {
                *follower = None;
            }
        }
    }

    fn seek(&mut self, token: StreamToken, position: Duration) -> Result<(), NativeFailure> {
        let stream = self.streams.get(&token).ok_or_else(|| {
            NativeFailure::new(StreamErrorKind::Unknown, format!("{token} is not open"))
        })?;
        stream
            .player
            .try_seek(position)
            .map_err(|err| NativeFailure::new(StreamErrorKind::Unknown, format!("seek failed: {err:?}")))
    }

    fn position(&self, token: StreamToken) -> Option<Duration> {
        self.streams.get(&token).map(|stream| stream.player.get_pos())
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        for stream in self.streams.values() {
            stream.player.set_volume(self.volume);
        }
    }

    fn set_equalizer(&mut self, settings: EqualizerSettings) {
        self.equalizer.set(settings);
    }

    fn chain(&mut self, current: StreamToken, next: StreamToken) {
        let (Some(current), Some(next_stream)) = (self.streams.get(&current), self.streams.get(&next))
        else {
            return;
        };
        *current.follower.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((next, Arc::clone(&next_stream.player)));
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        let tokens: Vec<StreamToken> = self.streams.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }
    }
}

struct Opener {
    token: StreamToken,
    url: Url,
    events: Sender<NativeEvent>,
    player: Arc<Player>,
    buffer: Option<Arc<StreamBuffer>>,
    cancelled: Arc<AtomicBool>,
    follower: Follower,
    equalizer: EqualizerControl,
}

impl Opener {
    fn run(self, origin: Origin) {
        let built = match origin {
            Origin::File(path) => open_file(&path),
            Origin::Network(buffer) => open_network(&buffer, &self.url, self.token, &self.events),
        };
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let kind = match built {
            Ok((decoder, duration)) => {
                let source = EndWatch {
                    inner: Equalized::new(decoder, self.equalizer),
                    token: self.token,
                    events: self.events.clone(),
                    follower: self.follower,
                    buffer: self.buffer,
                    fired: false,
                };
                self.player.append(source);
                NativeEventKind::Ready { duration }
            }
            Err(failure) => NativeEventKind::Failed(failure),
        };
        let _ = self.events.send(NativeEvent::new(self.token, kind));
    }
}

fn open_file(path: &Path) -> Result<(BoxedSource, Option<Duration>), NativeFailure> {
    let report = probe::probe_file(path)?;
    let file = File::open(path).map_err(|err| errors::from_io(&err))?;
    let byte_len = file.metadata().map(|meta| meta.len()).ok();

    let mut builder = Decoder::builder()
        .with_data(file)
        .with_seekable(true)
        .with_gapless(true);
    if let Some(len) = byte_len {
        builder = builder.with_byte_len(len);
    }
    if let Some(extension) = path.extension().and_then(OsStr::to_str) {
        builder = builder.with_hint(extension);
    }
    let decoder = builder.build().map_err(|err| errors::from_decoder(&err))?;
    let duration = report.duration.or_else(|| decoder.total_duration());
    Ok((Box::new(decoder), duration))
}

fn open_network(
    buffer: &Arc<StreamBuffer>,
    url: &Url,
    token: StreamToken,
    events: &Sender<NativeEvent>,
) -> Result<(BoxedSource, Option<Duration>), NativeFailure> {
    buffer.wait_for(http::PREBUFFER_BYTES)?;
    if buffer.is_cancelled() {
        return Err(http::cancelled());
    }
    let extension = Path::new(url.path())
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase);
    let report = probe::probe_media(
        Box::new(BufferReader::new(Arc::clone(buffer))),
        extension.as_deref(),
    )?;

    let total = buffer.total();
    let reader = BufferReader::new(Arc::clone(buffer)).reporting_stalls(token, events.clone());
    let mut builder = Decoder::builder()
        .with_data(reader)
        .with_seekable(total.is_some())
        .with_gapless(true);
    if let Some(total) = total {
        builder = builder.with_byte_len(total);
    }
    if let Some(extension) = extension.as_deref() {
        builder = builder.with_hint(extension);
    }
    let decoder = builder.build().map_err(|err| errors::from_decoder(&err))?;
    let duration = report.duration.or_else(|| decoder.total_duration());
    Ok((Box::new(decoder), duration))
}

/// Reports the end of its inner source and starts the chained follower from
/// the mixer thread, so the next track begins on the very next sample. A
/// source cut short by a failed download reports `Failed` and starts nothing.
struct EndWatch<S> {
    inner: S,
    token: StreamToken,
    events: Sender<NativeEvent>,
    follower: Follower,
    buffer: Option<Arc<StreamBuffer>>,
    fired: bool,
}

impl<S: Source> Iterator for EndWatch<S> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.inner.next();
        if sample.is_none() && !self.fired {
            self.fired = true;
            let follower = self
                .follower
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let kind = match self.buffer.as_ref().and_then(|buffer| buffer.failure()) {
                Some(failure) => NativeEventKind::Failed(failure),
                None => {
                    if let Some((_, next)) = follower {
                        next.play();
                    }
                    NativeEventKind::Ended
                }
            };
            let _ = self.events.send(NativeEvent::new(self.token, kind));
        }
        sample
    }
}

impl<S: Source> Source for EndWatch<S> {
    fn current_span_len(&self) -> Option<usize> {
        self.inner.current_span_len()
    }

    fn channels(&self) -> ChannelCount {
        self.inner.channels()
    }

    fn sample_rate(&self) -> SampleRate {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }

    fn try_seek(&mut self, pos: Duration) -> Result<(), SeekError> {
        self.inner.try_seek(pos)
    }
}

fn device_name(device: &rodio::Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|description| description.name().to_string())
}

fn open_device_sink(output: Option<&str>) -> Result<MixerDeviceSink> {
    let mut sink = with_silenced_stderr(|| -> Result<MixerDeviceSink> {
        let host = rodio::cpal::default_host();
        if let Some(requested) = output {
            let device = host
                .output_devices()
                .context("failed to enumerate output devices")?
                .find(|candidate| device_name(candidate).as_deref() == Some(requested))
                .with_context(|| format!("audio output device not found: {requested}"))?;
            return DeviceSinkBuilder::from_device(device)
                .context("failed to open selected output device")?
                .with_error_callback(|_| {})
                .open_sink_or_fallback()
                .context("failed to start selected output stream");
        }

        let default_err = match DeviceSinkBuilder::from_default_device()
            .context("failed to open default system output stream")
            .and_then(|builder| {
                builder
                    .with_error_callback(|_| {})
                    .open_sink_or_fallback()
                    .context("failed to start default output stream")
            }) {
            Ok(sink) => return Ok(sink),
            Err(err) => err,
        };

        let mut candidates: Vec<String> = host
            .output_devices()
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|device| device_name(&device))
            .collect();
        candidates.sort_by_cached_key(|name| {
            let lower = name.to_ascii_lowercase();
            let rank = if lower.contains("pulse") {
                0_u8
            } else if lower.contains("pipewire") {
                1_u8
            } else if lower.contains("default") {
                2_u8
            } else {
                3_u8
            };
            (rank, lower)
        });
        candidates.dedup();

        for candidate in candidates {
            let Some(device) = host
                .output_devices()
                .ok()
                .into_iter()
                .flatten()
                .find(|entry| device_name(entry).as_deref() == Some(candidate.as_str()))
            else {
                continue;
            };
            let opened = DeviceSinkBuilder::from_device(device)
                .context("failed to open fallback output device")
                .and_then(|builder| {
                    builder
                        .with_error_callback(|_| {})
                        .open_sink_or_fallback()
                        .context("failed to start fallback output stream")
                });
            if let Ok(sink) = opened {
                tracing::info!(device = %candidate, "using fallback output device");
                return Ok(sink);
            }
        }

        Err(default_err.context("unable to start any audio output stream"))
    })?;
    sink.log_on_drop(false);
    Ok(sink)
}

#[cfg(unix)]
fn with_silenced_stderr<T>(operation: impl FnOnce() -> T) -> T {
    let saved = unsafe { libc::dup(libc::STDERR_FILENO) };
    if saved < 0 {
        return operation();
    }

    let devnull = CString::new("/dev/null")
        .ok()
        .map(|path| unsafe { libc::open(path.as_ptr(), libc::O_WRONLY) })
        .unwrap_or(-1);

    if devnull >= 0 {
        unsafe {
            libc::dup2(devnull, libc::STDERR_FILENO);
            libc::close(devnull);
        }
    }

    let result = operation();

    unsafe {
        libc::dup2(saved, libc::STDERR_FILENO);
        libc::close(saved);
    }

    result
}

#[cfg(not(unix))]
fn with_silenced_stderr<T>(operation: impl FnOnce() -> T) -> T {
    operation()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::probe::fixtures::write_test_wav;
    use rodio::buffer::SamplesBuffer;
    use std::num::NonZero;
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn end_watch_reports_once_and_starts_follower() {
        let (tx, rx) = mpsc::channel();
        let follower = Follower::default();
        let token = StreamToken::new(3);
        let (next, _queue) = Player::new();
        next.pause();
        let next = Arc::new(next);
        *follower.lock().expect("follower") = Some((StreamToken::new(4), Arc::clone(&next)));
        let mut watch = EndWatch {
            inner: samples(),
            token,
            events: tx,
            follower,
            buffer: None,
            fired: false,
        };

        assert_eq!(watch.by_ref().count(), 3);
        assert_eq!(watch.next(), None);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events, vec![NativeEvent::new(token, NativeEventKind::Ended)]);
        assert!(!next.is_paused());
    }

    #[test]
    fn end_watch_reports_a_cut_download_as_failure() {
        let (tx, rx) = mpsc::channel();
        let follower = Follower::default();
        let token = StreamToken::new(7);
        let (next, _queue) = Player::new();
        next.pause();
        let next = Arc::new(next);
        *follower.lock().expect("follower") = Some((StreamToken::new(8), Arc::clone(&next)));
        let buffer = StreamBuffer::new();
        let failure = NativeFailure::new(StreamErrorKind::NoNetwork, "connection reset");
        buffer.finish(Some(failure.clone()));
        let mut watch = EndWatch {
            inner: samples(),
            token,
            events: tx,
            follower,
            buffer: Some(buffer),
            fired: false,
        };

        assert_eq!(watch.by_ref().count(), 3);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![NativeEvent::new(token, NativeEventKind::Failed(failure))]
        );
        assert!(next.is_paused(), "the follower must not start after a failure");
    }

    fn samples() -> SamplesBuffer {
        SamplesBuffer::new(
            NonZero::new(1).expect("channels"),
            NonZero::new(8_000).expect("rate"),
            vec![0.1_f32, 0.2, 0.3],
        )
    }

    #[test]
    fn local_wav_opens_with_duration() {
        let dir = tempdir().expect("tempdir");
        let track = dir.path().join("fixture.wav");
        write_test_wav(&track, 250);

        let (source, duration) = open_file(&track).expect("open should succeed");
        let duration = duration.expect("duration");
        assert!(duration >= Duration::from_millis(240));
        assert_eq!(source.channels().get(), 1);
    }

    #[test]
    fn unknown_scheme_fails_before_any_thread_starts() {
        let (tx, _rx) = mpsc::channel();
        let url = Url::parse("ftp://example.com/a.mp3").expect("url");
        let err = RodioOutput::origin_for(&url, StreamToken::new(1), &tx)
            .err()
            .expect("ftp is unsupported");
        assert_eq!(err.kind, StreamErrorKind::InvalidUrl);
    }
}
