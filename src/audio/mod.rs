mod backend;
pub mod equalizer;
pub mod errors;
mod http;
mod null_output;
pub mod probe;
mod rodio_output;

pub use backend::{BackendDataSource, BackendEvent, BackendState, StreamingBackend};
pub use null_output::{NullControl, NullOutput};
pub use rodio_output::RodioOutput;

use crate::error::StreamErrorKind;
use crate::model::EqualizerSettings;
use std::fmt;
use std::sync::mpsc::Sender;
use std::time::Duration;
use url::Url;

// Identity of one opened stream. Never reused within a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamToken(u64);

impl StreamToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFailure {
    pub kind: StreamErrorKind,
    pub detail: String,
}

impl NativeFailure {
    pub fn new(kind: StreamErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NativeEventKind {
    Ready { duration: Option<Duration> },
    Stalled,
    Resumed,
    Downloaded { downloaded: u64, total: Option<u64> },
    Failed(NativeFailure),
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NativeEvent {
    pub token: StreamToken,
    pub kind: NativeEventKind,
}

impl NativeEvent {
    pub fn new(token: StreamToken, kind: NativeEventKind) -> Self {
        Self { token, kind }
    }
}

/// Native output layer. Implementations do their decode and network work on
/// their own threads and report back only through the event sender handed to
/// [`AudioOutput::open`].
pub trait AudioOutput {
    fn name(&self) -> String;

    fn open(&mut self, token: StreamToken, url: &Url, events: Sender<NativeEvent>);
    fn play(&mut self, token: StreamToken);
    fn pause(&mut self, token: StreamToken);
    fn close(&mut self, token: StreamToken);
    fn seek(&mut self, token: StreamToken, position: Duration) -> Result<(), NativeFailure>;
    fn position(&self, token: StreamToken) -> Option<Duration>;
    fn set_volume(&mut self, volume: f32);
    fn set_equalizer(&mut self, settings: EqualizerSettings);

    fn chain(&mut self, _current: StreamToken, _next: StreamToken) {}

    fn poll(&mut self) {}
}
