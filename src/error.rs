use crate::model::PlaybackId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamErrorKind {
    #[error("audio output could not be initialised")]
    InitFailed,
    #[error("audio backend is unavailable")]
    BackendUnavailable,
    #[error("no network connection")]
    NoNetwork,
    #[error("invalid URL")]
    InvalidUrl,
    #[error("secure connection is not supported")]
    TlsUnsupported,
    #[error("server timed out")]
    ServerTimeout,
    #[error("could not open file")]
    FileOpenFailed,
    #[error("unsupported file format")]
    UnsupportedFileFormat,
    #[error("unsupported codec")]
    UnsupportedCodec,
    #[error("unsupported sample format")]
    UnsupportedSampleFormat,
    #[error("out of memory")]
    OutOfMemory,
    #[error("unknown playback error")]
    Unknown,
}

impl StreamErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::NoNetwork | Self::ServerTimeout | Self::BackendUnavailable
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{kind} while playing {url}: {detail}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub url: Url,
    pub identifier: PlaybackId,
    pub detail: String,
}

impl StreamError {
    pub fn new(
        kind: StreamErrorKind,
        url: Url,
        identifier: PlaybackId,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            url,
            identifier,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_url_and_detail() {
        let url = Url::parse("https://example.com/a.mp3").expect("url");
        let err = StreamError::new(
            StreamErrorKind::ServerTimeout,
            url,
            PlaybackId::new(),
            "no response after 10s",
        );
        let text = err.to_string();
        assert!(text.contains("server timed out"));
        assert!(text.contains("https://example.com/a.mp3"));
        assert!(text.contains("no response after 10s"));
    }

    #[test]
    fn only_network_style_failures_are_transient() {
        assert!(StreamErrorKind::NoNetwork.is_transient());
        assert!(StreamErrorKind::ServerTimeout.is_transient());
        assert!(!StreamErrorKind::UnsupportedCodec.is_transient());
        assert!(!StreamErrorKind::FileOpenFailed.is_transient());
    }
}
