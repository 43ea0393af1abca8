use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use crate::error::{EngineError, Result};

pub const SPEED_RANGE: RangeInclusive<f32> = 0.25..=3.0;
pub const VOLUME_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const CROSSFADE_RANGE_SECS: RangeInclusive<f32> = 0.0..=12.0;
pub const EQ_GAIN_RANGE_DB: RangeInclusive<f32> = -12.0..=12.0;
pub const SLEEP_TIMER_RANGE_MINUTES: RangeInclusive<u32> = 1..=180;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatMode {
    #[default]
    None,
    One,
    All,
}

impl RepeatMode {
    pub fn cycle(self) -> Self {
        match self {
            RepeatMode::None => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::None,
        }
    }
}

/// Band label (e.g. "60Hz", "1kHz") to gain in dB.
pub type EqualizerBands = BTreeMap<String, f32>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSettings {
    pub shuffle_enabled: bool,
    pub repeat_mode: RepeatMode,
    pub playback_speed: f32,
    pub volume: f32,
    pub crossfade_duration: f32, // seconds
    pub gapless_playback: bool,
    pub equalizer_settings: EqualizerBands,
    pub equalizer_enabled: bool,
    pub sleep_timer_enabled: bool,
    pub sleep_timer_duration: u32, // minutes
    pub resume_after_reboot: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            shuffle_enabled: false,
            repeat_mode: RepeatMode::None,
            playback_speed: 1.0,
            volume: 0.7,
            crossfade_duration: 0.0,
            gapless_playback: true,
            equalizer_settings: default_equalizer_bands(),
            equalizer_enabled: false,
            sleep_timer_enabled: false,
            sleep_timer_duration: 30,
            resume_after_reboot: true,
        }
    }
}

pub fn default_equalizer_bands() -> EqualizerBands {
    ["60Hz", "230Hz", "910Hz", "3.6kHz", "14kHz"]
        .iter()
        .map(|label| (label.to_string(), 0.0))
        .collect()
}

fn check_f32(name: &str, value: f32, range: &RangeInclusive<f32>) -> Result<()> {
    if value.is_finite() && range.contains(&value) {
        Ok(())
    } else {
        Err(EngineError::invalid(format!(
            "{} {} outside {}..={}",
            name,
            value,
            range.start(),
            range.end()
        )))
    }
}

pub fn validate_speed(speed: f32) -> Result<()> {
    check_f32("playback speed", speed, &SPEED_RANGE)
}

pub fn validate_volume(volume: f32) -> Result<()> {
    check_f32("volume", volume, &VOLUME_RANGE)
}

pub fn validate_crossfade(seconds: f32) -> Result<()> {
    check_f32("crossfade duration", seconds, &CROSSFADE_RANGE_SECS)
}

pub fn validate_equalizer(bands: &EqualizerBands) -> Result<()> {
    for (label, gain) in bands {
        if label.trim().is_empty() {
            return Err(EngineError::invalid("equalizer band label must not be empty"));
        }
        check_f32(&format!("equalizer band {}", label), *gain, &EQ_GAIN_RANGE_DB)?;
    }
    Ok(())
}

pub fn validate_sleep_minutes(minutes: u32) -> Result<()> {
    if SLEEP_TIMER_RANGE_MINUTES.contains(&minutes) {
        Ok(())
    } else {
        Err(EngineError::invalid(format!(
            "sleep timer {} min outside {}..={}",
            minutes,
            SLEEP_TIMER_RANGE_MINUTES.start(),
            SLEEP_TIMER_RANGE_MINUTES.end()
        )))
    }
}

impl PlaybackSettings {
    /// Reject, never clamp.
    pub fn validate(&self) -> Result<()> {
        validate_speed(self.playback_speed)?;
        validate_volume(self.volume)?;
        validate_crossfade(self.crossfade_duration)?;
        validate_equalizer(&self.equalizer_settings)?;
        validate_sleep_minutes(self.sleep_timer_duration)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PlaybackSettings::default().validate().unwrap();
    }

    #[test]
    fn bounds_are_inclusive() {
        assert!(validate_speed(0.25).is_ok());
        assert!(validate_speed(3.0).is_ok());
        assert!(validate_speed(3.01).is_err());
        assert!(validate_volume(-0.1).is_err());
        assert!(validate_volume(f32::NAN).is_err());
        assert!(validate_crossfade(12.0).is_ok());
        assert!(validate_crossfade(12.5).is_err());
        assert!(validate_sleep_minutes(0).is_err());
        assert!(validate_sleep_minutes(180).is_ok());
    }

    #[test]
    fn equalizer_gain_out_of_range_is_rejected() {
        let mut bands = default_equalizer_bands();
        bands.insert("60Hz".into(), 12.5);
        assert!(matches!(validate_equalizer(&bands), Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn repeat_cycles_through_all_modes() {
        assert_eq!(RepeatMode::None.cycle(), RepeatMode::All);
        assert_eq!(RepeatMode::All.cycle(), RepeatMode::One);
        assert_eq!(RepeatMode::One.cycle(), RepeatMode::None);
    }
}
