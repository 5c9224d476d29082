use super::NativeFailure;
use crate::error::StreamErrorKind;
use std::io;
use symphonia::core::errors::Error as SymphoniaError;

pub fn from_io(err: &io::Error) -> NativeFailure {
    NativeFailure::new(io_kind(err), err.to_string())
}

fn io_kind(err: &io::Error) -> StreamErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::IsADirectory => {
            StreamErrorKind::FileOpenFailed
        }
        io::ErrorKind::TimedOut => StreamErrorKind::ServerTimeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::NetworkDown => StreamErrorKind::NoNetwork,
        io::ErrorKind::OutOfMemory => StreamErrorKind::OutOfMemory,
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
            StreamErrorKind::UnsupportedFileFormat
        }
        _ => StreamErrorKind::Unknown,
    }
}

pub fn from_reqwest(err: &reqwest::Error) -> NativeFailure {
    let kind = if err.is_timeout() {
        StreamErrorKind::ServerTimeout
    } else if err.is_builder() {
        StreamErrorKind::InvalidUrl
    } else if mentions_tls(err) {
        StreamErrorKind::TlsUnsupported
    } else if err.is_connect() {
        StreamErrorKind::NoNetwork
    } else if err.is_status() {
        StreamErrorKind::FileOpenFailed
    } else if err.is_body() || err.is_request() {
        StreamErrorKind::NoNetwork
    } else {
        StreamErrorKind::Unknown
    };
    NativeFailure::new(kind, error_chain(err))
}

// rustls and hyper bury certificate problems inside connect errors.
fn mentions_tls(err: &reqwest::Error) -> bool {
    let chain = error_chain(err).to_ascii_lowercase();
    chain.contains("certificate") || chain.contains("tls") || chain.contains("handshake")
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

pub fn from_status(status: reqwest::StatusCode) -> NativeFailure {
    let kind = match status.as_u16() {
        408 | 504 => StreamErrorKind::ServerTimeout,
        415 => StreamErrorKind::UnsupportedFileFormat,
        502 | 503 => StreamErrorKind::BackendUnavailable,
        _ => StreamErrorKind::FileOpenFailed,
    };
    NativeFailure::new(kind, format!("server answered {status}"))
}

pub fn from_symphonia(err: &SymphoniaError) -> NativeFailure {
    let kind = match err {
        SymphoniaError::IoError(io) => io_kind(io),
        SymphoniaError::Unsupported(what) => {
            let what = what.to_ascii_lowercase();
            if what.contains("channel") || what.contains("sample") {
                StreamErrorKind::UnsupportedSampleFormat
            } else if what.contains("codec") || what.contains("decoder") {
                StreamErrorKind::UnsupportedCodec
            } else {
                StreamErrorKind::UnsupportedFileFormat
            }
        }
        SymphoniaError::LimitError(_) => StreamErrorKind::OutOfMemory,
        SymphoniaError::DecodeError(_) => StreamErrorKind::UnsupportedFileFormat,
        _ => StreamErrorKind::Unknown,
    };
    NativeFailure::new(kind, err.to_string())
}

pub fn from_decoder(err: &rodio::decoder::DecoderError) -> NativeFailure {
    let kind = match err {
        rodio::decoder::DecoderError::UnrecognizedFormat => StreamErrorKind::UnsupportedFileFormat,
        _ => StreamErrorKind::UnsupportedCodec,
    };
    NativeFailure::new(kind, err.to_string())
}

pub fn unsupported_scheme(scheme: &str) -> NativeFailure {
    NativeFailure::new(
        StreamErrorKind::InvalidUrl,
        format!("unsupported URL scheme `{scheme}`"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_file_open_failed() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(from_io(&err).kind, StreamErrorKind::FileOpenFailed);
    }

    #[test]
    fn network_io_errors_map_to_no_network() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(from_io(&err).kind, StreamErrorKind::NoNetwork);
        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(from_io(&err).kind, StreamErrorKind::ServerTimeout);
    }

    #[test]
    fn symphonia_unsupported_is_split_by_message() {
        let codec = from_symphonia(&SymphoniaError::Unsupported("core (codec): unsupported codec"));
        assert_eq!(codec.kind, StreamErrorKind::UnsupportedCodec);
        let format = from_symphonia(&SymphoniaError::Unsupported("core (probe): no suitable format reader found"));
        assert_eq!(format.kind, StreamErrorKind::UnsupportedFileFormat);
        let layout = from_symphonia(&SymphoniaError::Unsupported("wav: too many channels"));
        assert_eq!(layout.kind, StreamErrorKind::UnsupportedSampleFormat);
        let limit = from_symphonia(&SymphoniaError::LimitError("buffer too large"));
        assert_eq!(limit.kind, StreamErrorKind::OutOfMemory);
    }

    #[test]
    fn http_statuses_are_classified() {
        assert_eq!(
            from_status(reqwest::StatusCode::NOT_FOUND).kind,
            StreamErrorKind::FileOpenFailed
        );
        assert_eq!(
            from_status(reqwest::StatusCode::GATEWAY_TIMEOUT).kind,
            StreamErrorKind::ServerTimeout
        );
        assert_eq!(
            from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE).kind,
            StreamErrorKind::BackendUnavailable
        );
    }

    #[test]
    fn unknown_scheme_is_invalid_url() {
        assert_eq!(unsupported_scheme("ftp").kind, StreamErrorKind::InvalidUrl);
    }

    #[test]
    fn decoder_failures_distinguish_format_from_codec() {
        assert_eq!(
            from_decoder(&rodio::decoder::DecoderError::UnrecognizedFormat).kind,
            StreamErrorKind::UnsupportedFileFormat
        );
    }
}
