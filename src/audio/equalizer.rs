use crate::model::EqualizerSettings;
use rodio::source::SeekError;
use rodio::{ChannelCount, SampleRate, Source};
use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const BASS_HZ: f32 = 120.0;
const MID_HZ: f32 = 1_000.0;
const MID_Q: f32 = 1.0;
const TREBLE_HZ: f32 = 8_000.0;
const SHELF_Q: f32 = 0.707;

#[derive(Debug, Clone, Default)]
pub struct EqualizerControl {
    shared: Arc<SharedGains>,
}

#[derive(Debug, Default)]
struct SharedGains {
    enabled: AtomicBool,
    bass: AtomicU32,
    mid: AtomicU32,
    treble: AtomicU32,
    revision: AtomicU64,
}

impl EqualizerControl {
    pub fn new(settings: EqualizerSettings) -> Self {
        let control = Self::default();
        control.set(settings);
        control
    }

    pub fn set(&self, settings: EqualizerSettings) {
        let settings = settings.clamped();
        let shared = &self.shared;
        shared.enabled.store(settings.enabled, Ordering::Relaxed);
        shared
            .bass
            .store(settings.bass_gain_db.to_bits(), Ordering::Relaxed);
        shared
            .mid
            .store(settings.mid_gain_db.to_bits(), Ordering::Relaxed);
        shared
            .treble
            .store(settings.treble_gain_db.to_bits(), Ordering::Relaxed);
        shared.revision.fetch_add(1, Ordering::Release);
    }

    pub fn settings(&self) -> EqualizerSettings {
        let shared = &self.shared;
        EqualizerSettings {
            enabled: shared.enabled.load(Ordering::Relaxed),
            bass_gain_db: f32::from_bits(shared.bass.load(Ordering::Relaxed)),
            mid_gain_db: f32::from_bits(shared.mid.load(Ordering::Relaxed)),
            treble_gain_db: f32::from_bits(shared.treble.load(Ordering::Relaxed)),
        }
    }

    fn revision(&self) -> u64 {
        self.shared.revision.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
        x1: 0.0,
        x2: 0.0,
        y1: 0.0,
        y2: 0.0,
    };

    fn with_coefficients(self, [b0, b1, b2, a0, a1, a2]: [f32; 6]) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            ..self
        }
    }

    fn low_shelf(self, sample_rate: f32, gain_db: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let omega = 2.0 * PI * BASS_HZ / sample_rate;
        let (sin, cos) = omega.sin_cos();
        let beta = 2.0 * a.sqrt() * (sin / (2.0 * SHELF_Q));
        self.with_coefficients([
            a * ((a + 1.0) - (a - 1.0) * cos + beta),
            2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
            a * ((a + 1.0) - (a - 1.0) * cos - beta),
            (a + 1.0) + (a - 1.0) * cos + beta,
            -2.0 * ((a - 1.0) + (a + 1.0) * cos),
            (a + 1.0) + (a - 1.0) * cos - beta,
        ])
    }

    fn peaking(self, sample_rate: f32, gain_db: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let omega = 2.0 * PI * MID_HZ / sample_rate;
        let (sin, cos) = omega.sin_cos();
        let alpha = sin / (2.0 * MID_Q);
        self.with_coefficients([
            1.0 + alpha * a,
            -2.0 * cos,
            1.0 - alpha * a,
            1.0 + alpha / a,
            -2.0 * cos,
            1.0 - alpha / a,
        ])
    }

    fn high_shelf(self, sample_rate: f32, gain_db: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let omega = 2.0 * PI * TREBLE_HZ.min(sample_rate * 0.45) / sample_rate;
        let (sin, cos) = omega.sin_cos();
        let beta = 2.0 * a.sqrt() * (sin / (2.0 * SHELF_Q));
        self.with_coefficients([
            a * ((a + 1.0) + (a - 1.0) * cos + beta),
            -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
            a * ((a + 1.0) + (a - 1.0) * cos - beta),
            (a + 1.0) - (a - 1.0) * cos + beta,
            2.0 * ((a - 1.0) - (a + 1.0) * cos),
            (a + 1.0) - (a - 1.0) * cos - beta,
        ])
    }

    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

pub struct Equalized<S> {
    inner: S,
    control: EqualizerControl,
    revision: u64,
    flat: bool,
    bands: Vec<[Biquad; 3]>,
    channel: usize,
    layout: (ChannelCount, SampleRate),
}

impl<S: Source> Equalized<S> {
    pub fn new(inner: S, control: EqualizerControl) -> Self {
        let layout = (inner.channels(), inner.sample_rate());
        let mut equalized = Self {
            inner,
            revision: control.revision(),
            control,
            flat: true,
            bands: Vec::new(),
            channel: 0,
            layout,
        };
        equalized.rebuild();
        equalized
    }

    fn rebuild(&mut self) {
        let settings = self.control.settings();
        self.revision = self.control.revision();
        self.flat = settings.is_flat();
        let channels = usize::from(self.layout.0.get());
        let rate = self.layout.1.get() as f32;
        if self.bands.len() != channels {
            self.bands = vec![[Biquad::IDENTITY; 3]; channels];
            self.channel = 0;
        }
        for [bass, mid, treble] in &mut self.bands {
            *bass = bass.low_shelf(rate, settings.bass_gain_db);
            *mid = mid.peaking(rate, settings.mid_gain_db);
            *treble = treble.high_shelf(rate, settings.treble_gain_db);
        }
    }
}

impl<S: Source> Iterator for Equalized<S> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.inner.next()?;
        if self.channel == 0 {
            let layout = (self.inner.channels(), self.inner.sample_rate());
            if layout != self.layout || self.control.revision() != self.revision {
                self.layout = layout;
                self.rebuild();
            }
        }
        let channel = self.channel;
        self.channel = (self.channel + 1) % self.bands.len().max(1);
        if self.flat {
            return Some(sample);
        }
        let Some(filters) = self.bands.get_mut(channel) else {
            return Some(sample);
        };
        let shaped = filters
            .iter_mut()
            .fold(sample, |value, filter| filter.process(value));
        Some(if shaped.is_finite() {
            shaped.clamp(-1.0, 1.0)
        } else {
            sample
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S: Source> Source for Equalized<S> {
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
        self.inner.try_seek(pos)?;
        for filters in &mut self.bands {
            for filter in filters.iter_mut() {
                filter.reset();
            }
        }
        self.channel = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rodio::buffer::SamplesBuffer;
    use std::num::NonZero;

    fn sine(frequency: f32, sample_rate: u32, seconds: f32) -> Vec<f32> {
        let count = (sample_rate as f32 * seconds) as usize;
        (0..count)
            .map(|n| 0.25 * (2.0 * PI * frequency * n as f32 / sample_rate as f32).sin())
            .collect()
    }

    fn mono(sample_rate: u32, samples: Vec<f32>) -> SamplesBuffer {
        SamplesBuffer::new(
            NonZero::new(1).expect("channels"),
            NonZero::new(sample_rate).expect("rate"),
            samples,
        )
    }

    fn rms(samples: &[f32]) -> f32 {
        let tail = &samples[samples.len() / 2..];
        (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt()
    }

    #[test]
    fn disabled_equalizer_is_transparent() {
        let input = sine(440.0, 44_100, 0.1);
        let source = mono(44_100, input.clone());
        let output: Vec<f32> = Equalized::new(source, EqualizerControl::default()).collect();
        assert_eq!(output, input);
    }

    #[test]
    fn bass_boost_raises_low_frequencies() {
        let input = sine(60.0, 44_100, 0.5);
        let control = EqualizerControl::new(EqualizerSettings {
            enabled: true,
            bass_gain_db: 12.0,
            ..EqualizerSettings::default()
        });
        let source = mono(44_100, input.clone());
        let output: Vec<f32> = Equalized::new(source, control).collect();
        assert!(rms(&output) > rms(&input) * 1.5);
    }

    #[test]
    fn treble_cut_lowers_high_frequencies() {
        let input = sine(12_000.0, 44_100, 0.5);
        let control = EqualizerControl::new(EqualizerSettings {
            enabled: true,
            treble_gain_db: -12.0,
            ..EqualizerSettings::default()
        });
        let source = mono(44_100, input.clone());
        let output: Vec<f32> = Equalized::new(source, control).collect();
        assert!(rms(&output) < rms(&input) * 0.6);
    }

    #[test]
    fn control_reports_clamped_settings() {
        let control = EqualizerControl::default();
        control.set(EqualizerSettings {
            enabled: true,
            bass_gain_db: 99.0,
            mid_gain_db: 3.0,
            treble_gain_db: -99.0,
        });
        let settings = control.settings();
        assert_eq!(settings.bass_gain_db, EqualizerSettings::MAX_GAIN_DB);
        assert_eq!(settings.mid_gain_db, 3.0);
        assert_eq!(settings.treble_gain_db, -EqualizerSettings::MAX_GAIN_DB);
    }
}
