// Peaking-biquad equalizer as a rodio Source adapter
// Bands are retuned live from an EqualizerControl shared with the backend

use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rodio::source::SeekError;
use rodio::Source;

use crate::model::EqualizerBands;

const BAND_Q: f32 = 1.0;
/// Samples between checks for new band settings.
const REFRESH_INTERVAL: usize = 2048;

/// "60Hz" -> 60.0, "3.6kHz" -> 3600.0. Case-insensitive.
pub fn parse_band_frequency(label: &str) -> Option<f32> {
    let lower = label.trim().to_ascii_lowercase();
    let (number, scale) = if let Some(n) = lower.strip_suffix("khz") {
        (n, 1000.0)
    } else if let Some(n) = lower.strip_suffix("hz") {
        (n, 1.0)
    } else {
        (lower.as_str(), 1.0)
    };
    let value: f32 = number.trim().parse().ok()?;
    (value > 0.0).then_some(value * scale)
}

#[derive(Debug, Default)]
struct Shared {
    bands: Vec<(f32, f32)>, // (frequency, gain dB)
    version: u64,
}

/// Handle the backend keeps to retune every live equalized source.
#[derive(Debug, Clone, Default)]
pub struct EqualizerControl {
    shared: Arc<Mutex<Shared>>,
}

impl EqualizerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` (or all-zero gains) turns filtering off.
    pub fn set(&self, bands: Option<&EqualizerBands>) {
        let parsed: Vec<(f32, f32)> = bands
            .map(|bands| {
                bands
                    .iter()
                    .filter_map(|(label, gain)| parse_band_frequency(label).map(|f| (f, *gain)))
                    .filter(|(_, gain)| gain.abs() >= 0.01)
                    .collect()
            })
            .unwrap_or_default();
        let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        shared.bands = parsed;
        shared.version += 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Biquad {
    fn peaking(frequency: f32, gain_db: f32, sample_rate: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let frequency = frequency.min(sample_rate * 0.45);
        let omega = 2.0 * PI * frequency / sample_rate;
        let (sin_omega, cos_omega) = omega.sin_cos();
        let alpha = sin_omega / (2.0 * BAND_Q);

        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_omega) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_omega) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }

    /// Direct form I; `state` is [x1, x2, y1, y2] for one channel.
    fn process(&self, x: f32, state: &mut [f32; 4]) -> f32 {
        let y = self.b0 * x + self.b1 * state[0] + self.b2 * state[1] - self.a1 * state[2] - self.a2 * state[3];
        state[1] = state[0];
        state[0] = x;
        state[3] = state[2];
        state[2] = y;
        y
    }
}

pub struct Equalized<S> {
    source: S,
    control: EqualizerControl,
    seen_version: u64,
    filters: Vec<Biquad>,
    /// filters.len() * channels entries, band-major.
    states: Vec<[f32; 4]>,
    channel: usize,
    countdown: usize,
}

impl<S> Equalized<S>
where
    S: Source<Item = f32>,
{
    pub fn new(source: S, control: EqualizerControl) -> Self {
        let mut eq = Self {
            source,
            control,
            seen_version: u64::MAX,
            filters: Vec::new(),
            states: Vec::new(),
            channel: 0,
            countdown: 0,
        };
        eq.refresh();
        eq
    }

    fn refresh(&mut self) {
        // Never block the audio thread on the control lock
        let Ok(shared) = self.control.shared.try_lock() else {
            return;
        };
        if shared.version == self.seen_version {
            return;
        }
        let sample_rate = self.source.sample_rate() as f32;
        self.filters = if sample_rate < 1.0 {
            Vec::new()
        } else {
            shared
                .bands
                .iter()
                .map(|&(frequency, gain)| Biquad::peaking(frequency, gain, sample_rate))
                .collect()
        };
        self.seen_version = shared.version;
        let channels = usize::from(self.source.channels().max(1));
        self.states = vec![[0.0; 4]; self.filters.len() * channels];
    }
}

impl<S> Iterator for Equalized<S>
where
    S: Source<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.source.next()?;
        let channels = usize::from(self.source.channels().max(1));

        if self.countdown == 0 && self.channel == 0 {
            self.refresh();
            self.countdown = REFRESH_INTERVAL;
        }
        self.countdown = self.countdown.saturating_sub(1);

        let channel = self.channel % channels;
        self.channel = (channel + 1) % channels;

        let mut y = sample;
        for (band, filter) in self.filters.iter().enumerate() {
            if let Some(state) = self.states.get_mut(band * channels + channel) {
                y = filter.process(y, state);
            }
        }
        Some(y)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.source.size_hint()
    }
}

impl<S> Source for Equalized<S>
where
    S: Source<Item = f32>,
{
    fn current_frame_len(&self) -> Option<usize> {
        self.source.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.source.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.source.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.source.total_duration()
    }

    fn try_seek(&mut self, pos: Duration) -> Result<(), SeekError> {
        for state in self.states.iter_mut() {
            *state = [0.0; 4];
        }
        self.channel = 0;
        self.source.try_seek(pos)
    }
}
