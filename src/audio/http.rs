use super::errors;
use super::{NativeEvent, NativeEventKind, NativeFailure, StreamToken};
use crate::error::StreamErrorKind;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use url::Url;

const CHUNK_BYTES: usize = 16 * 1024;
const PROGRESS_STEP_BYTES: u64 = 64 * 1024;
pub const PREBUFFER_BYTES: u64 = 128 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct BufferState {
    data: Vec<u8>,
    total: Option<u64>,
    complete: bool,
    failure: Option<NativeFailure>,
}

#[derive(Debug, Default)]
pub struct StreamBuffer {
    state: Mutex<BufferState>,
    changed: Condvar,
    cancelled: AtomicBool,
}

impl StreamBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn total(&self) -> Option<u64> {
        self.lock().total
    }

    pub fn downloaded(&self) -> u64 {
        self.lock().data.len() as u64
    }

    fn set_total(&self, total: Option<u64>) {
        self.lock().total = total;
        self.changed.notify_all();
    }

    fn extend(&self, bytes: &[u8]) -> u64 {
        let mut state = self.lock();
        state.data.extend_from_slice(bytes);
        let len = state.data.len() as u64;
        drop(state);
        self.changed.notify_all();
        len
    }

    pub(super) fn finish(&self, failure: Option<NativeFailure>) {
        let mut state = self.lock();
        state.complete = true;
        if state.total.is_none() {
            state.total = Some(state.data.len() as u64);
        }
        state.failure = failure;
        drop(state);
        self.changed.notify_all();
    }

    pub fn failure(&self) -> Option<NativeFailure> {
        self.lock().failure.clone()
    }

    // Blocks until `bytes` are buffered, the download ends, or the stream is
    // cancelled. Returns the download failure if there was one.
    pub fn wait_for(&self, bytes: u64) -> Result<(), NativeFailure> {
        let mut state = self.lock();
        loop {
            if self.is_cancelled() {
                return Ok(());
            }
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            if state.complete || state.data.len() as u64 >= bytes {
                return Ok(());
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub fn spawn_download(
    url: &Url,
    token: StreamToken,
    events: Sender<NativeEvent>,
) -> io::Result<Arc<StreamBuffer>> {
    let buffer = StreamBuffer::new();
    let shared = Arc::clone(&buffer);
    let url = url.clone();
    thread::Builder::new()
        .name(format!("upnext-download-{token}"))
        .spawn(move || {
            let outcome = download(&url, &shared, token, &events);
            if let Err(failure) = &outcome {
                tracing::debug!(%url, detail = %failure.detail, "download failed");
            }
            settle(&shared, outcome, token, &events);
        })?;
    Ok(buffer)
}

fn settle(
    buffer: &StreamBuffer,
    outcome: Result<(), NativeFailure>,
    token: StreamToken,
    events: &Sender<NativeEvent>,
) {
    if buffer.is_cancelled() {
        return;
    }
    let failure = outcome.err();
    buffer.finish(failure.clone());
    let _ = events.send(NativeEvent::new(
        token,
        NativeEventKind::Downloaded {
            downloaded: buffer.downloaded(),
            total: buffer.total(),
        },
    ));
    if let Some(failure) = failure {
        let _ = events.send(NativeEvent::new(token, NativeEventKind::Failed(failure)));
    }
}

fn download(
    url: &Url,
    buffer: &StreamBuffer,
    token: StreamToken,
    events: &Sender<NativeEvent>,
) -> Result<(), NativeFailure> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None::<Duration>)
        .build()
        .map_err(|err| errors::from_reqwest(&err))?;
    let mut response = client
        .get(url.as_str())
        .send()
        .map_err(|err| errors::from_reqwest(&err))?;
    if !response.status().is_success() {
        return Err(errors::from_status(response.status()));
    }
    buffer.set_total(response.content_length());

    let mut chunk = vec![0_u8; CHUNK_BYTES];
    let mut reported = 0_u64;
    loop {
        if buffer.is_cancelled() {
            return Ok(());
        }
        let read = match response.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(errors::from_io(&err)),
        };
        let downloaded = buffer.extend(&chunk[..read]);
        if downloaded - reported >= PROGRESS_STEP_BYTES {
            reported = downloaded;
            let _ = events.send(NativeEvent::new(
                token,
                NativeEventKind::Downloaded {
                    downloaded,
                    total: buffer.total(),
                },
            ));
        }
    }
}

pub struct BufferReader {
    buffer: Arc<StreamBuffer>,
    position: u64,
    stalls: Option<(StreamToken, Sender<NativeEvent>)>,
}

impl BufferReader {
    pub fn new(buffer: Arc<StreamBuffer>) -> Self {
        Self {
            buffer,
            position: 0,
            stalls: None,
        }
    }

    pub fn reporting_stalls(mut self, token: StreamToken, events: Sender<NativeEvent>) -> Self {
        self.stalls = Some((token, events));
        self
    }

    fn notify(&self, kind: NativeEventKind) {
        if let Some((token, events)) = &self.stalls {
            let _ = events.send(NativeEvent::new(*token, kind));
        }
    }
}

impl Read for BufferReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut stalled = false;
        let mut state = self.buffer.lock();
        let result = loop {
            if self.buffer.is_cancelled() {
                break Ok(0);
            }
            let available = state.data.len() as u64;
            if self.position < available {
                let start = self.position as usize;
                let count = out.len().min(state.data.len() - start);
                out[..count].copy_from_slice(&state.data[start..start + count]);
                self.position += count as u64;
                break Ok(count);
            }
            if let Some(failure) = &state.failure {
                break Err(io::Error::other(failure.detail.clone()));
            }
            if state.complete {
                break Ok(0);
            }
            if !stalled {
                stalled = true;
                self.notify(NativeEventKind::Stalled);
            }
            state = self
                .buffer
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        };
        drop(state);
        if stalled {
            self.notify(NativeEventKind::Resumed);
        }
        result
    }
}

impl Seek for BufferReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let total = self.buffer.total().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "stream length is unknown")
                })?;
                total.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        self.position = target;
        Ok(target)
    }
}

impl symphonia::core::io::MediaSource for BufferReader {
    fn is_seekable(&self) -> bool {
        self.buffer.total().is_some()
    }

    fn byte_len(&self) -> Option<u64> {
        self.buffer.total()
    }
}

pub fn cancelled() -> NativeFailure {
    NativeFailure::new(StreamErrorKind::Unknown, "stream cancelled")
}
