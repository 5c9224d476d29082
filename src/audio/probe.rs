use super::NativeFailure;
use super::errors;
use crate::error::StreamErrorKind;
use std::ffi::OsStr;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeReport {
    pub duration: Option<Duration>,
    pub sample_rate: Option<u32>,
    pub channels: Option<usize>,
}

pub fn probe_file(path: &Path) -> Result<ProbeReport, NativeFailure> {
    let file = File::open(path).map_err(|err| errors::from_io(&err))?;
    probe_media(Box::new(file), path.extension().and_then(OsStr::to_str))
}

pub fn probe_media(
    source: Box<dyn MediaSource>,
    extension: Option<&str>,
) -> Result<ProbeReport, NativeFailure> {
    let stream = MediaSourceStream::new(source, MediaSourceStreamOptions::default());
    let mut hint = Hint::new();
    if let Some(extension) = extension {
        hint.with_extension(extension);
    }

    let probed = get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| errors::from_symphonia(&err))?;

    let track = probed.format.default_track().ok_or_else(|| {
        NativeFailure::new(
            StreamErrorKind::UnsupportedFileFormat,
            "container holds no audio track",
        )
    })?;
    let params = &track.codec_params;
    if params.codec == CODEC_TYPE_NULL {
        return Err(NativeFailure::new(
            StreamErrorKind::UnsupportedCodec,
            "track does not name a codec",
        ));
    }
    get_codecs()
        .make(params, &DecoderOptions::default())
        .map_err(|err| {
            let mut failure = errors::from_symphonia(&err);
            if failure.kind == StreamErrorKind::UnsupportedFileFormat {
                failure.kind = StreamErrorKind::UnsupportedCodec;
            }
            failure
        })?;

    Ok(ProbeReport {
        duration: codec_duration(params),
        sample_rate: params.sample_rate,
        channels: params.channels.map(|channels| channels.count()),
    })
}

pub fn codec_duration(params: &CodecParameters) -> Option<Duration> {
    if let (Some(time_base), Some(frame_count)) = (params.time_base, params.n_frames) {
        let time = time_base.calc_time(frame_count);
        return Some(Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac));
    }

    params
        .n_frames
        .zip(params.sample_rate)
        .filter(|(_, sample_rate)| *sample_rate > 0)
        .map(|(frame_count, sample_rate)| {
            Duration::from_secs_f64(frame_count as f64 / f64::from(sample_rate))
        })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;
    use std::path::Path;

    pub fn write_test_wav(path: &Path, duration_ms: u32) {
        let sample_rate: u32 = 44_100;
        let channels: u16 = 1;
        let bits_per_sample: u16 = 16;
        let bytes_per_sample = u32::from(bits_per_sample / 8);
        let total_samples = (u64::from(sample_rate) * u64::from(duration_ms) / 1_000) as u32;
        let data_size = total_samples * u32::from(channels) * bytes_per_sample;
        let byte_rate = sample_rate * u32::from(channels) * bytes_per_sample;
        let block_align = channels * (bits_per_sample / 8);
        let riff_chunk_size = 36_u32.saturating_add(data_size);

        let mut bytes = Vec::with_capacity((44_u32 + data_size) as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&riff_chunk_size.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16_u32.to_le_bytes());
        bytes.extend_from_slice(&1_u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&byte_rate.to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&bits_per_sample.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_size.to_le_bytes());
        bytes.resize((44_u32 + data_size) as usize, 0_u8);

        fs::write(path, bytes).expect("wav fixture should be written");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn wav_probe_reports_duration() {
        let dir = tempdir().expect("tempdir");
        let track = dir.path().join("fixture.wav");
        fixtures::write_test_wav(&track, 1_500);

        let report = probe_file(&track).expect("probe should succeed");
        let duration = report.duration.expect("duration");
        assert!(duration >= Duration::from_millis(1_490) && duration <= Duration::from_millis(1_510));
        assert_eq!(report.sample_rate, Some(44_100));
        assert_eq!(report.channels, Some(1));
    }

    #[test]
    fn missing_file_fails_to_open() {
        let dir = tempdir().expect("tempdir");
        let err = probe_file(&dir.path().join("missing.mp3")).expect_err("should fail");
        assert_eq!(err.kind, StreamErrorKind::FileOpenFailed);
    }

    #[test]
    fn garbage_is_an_unsupported_format() {
        let dir = tempdir().expect("tempdir");
        let track = dir.path().join("noise.bin");
        fs::write(&track, vec![0x5a_u8; 4096]).expect("write");
        let err = probe_file(&track).expect_err("should fail");
        assert_eq!(err.kind, StreamErrorKind::UnsupportedFileFormat);
    }
}
