// rodio renderer: one Sink per audible item, a second one during crossfades

use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::f32::consts::FRAC_PI_2;
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::backend::{foreign_source, AudioBackend, BackendError, Opened, Opener};
use super::equalizer::{EqualizerControl, Equalized};
use crate::model::{EqualizerBands, MediaItem};

#[derive(Debug, Clone, Copy, PartialEq)]
enum FadeKind {
    /// Outgoing sink fading down while the current one fades up.
    Cross,
    /// Current sink fading to silence.
    Out,
}

struct Fade {
    kind: FadeKind,
    started: Instant,
    length: Duration,
}

impl Fade {
    fn progress(&self) -> f32 {
        if self.length.is_zero() {
            return 1.0;
        }
        (self.started.elapsed().as_secs_f32() / self.length.as_secs_f32()).clamp(0.0, 1.0)
    }
}

type FileDecoder = Decoder<BufReader<File>>;

/// Open and probe `item`. No device access, so it can run off the engine thread.
fn open_decoder(item: &MediaItem) -> Result<Opened, BackendError> {
    let file = File::open(&item.file_path).map_err(|e| match e.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            BackendError::Transient(format!("Failed to open audio file: {}", e))
        }
        _ => BackendError::Persistent(format!("Failed to open audio file: {}", e)),
    })?;

    let decoder: FileDecoder = Decoder::new(BufReader::new(file)).map_err(|e| {
        BackendError::Persistent(format!("Unsupported audio format or corrupted file: {}", e))
    })?;
    Ok(Box::new(decoder))
}

pub struct RodioBackend {
    _stream: OutputStream,
    stream_handle: OutputStreamHandle,
    sink: Option<Sink>,
    outgoing: Option<Sink>,
    fade: Option<Fade>,
    volume: f32,
    speed: f32,
    equalizer: EqualizerControl,
}

impl RodioBackend {
    /// Opens the default output device.
    pub fn try_default() -> Result<Self, BackendError> {
        let (stream, stream_handle) =
            OutputStream::try_default().map_err(|e| BackendError::Persistent(format!("no audio output: {}", e)))?;
        Ok(Self {
            _stream: stream,
            stream_handle,
            sink: None,
            outgoing: None,
            fade: None,
            volume: 1.0,
            speed: 1.0,
            equalizer: EqualizerControl::new(),
        })
    }

    /// Put a decoder opened by [`open_decoder`] into a fresh paused sink.
    fn attach(&self, item: &MediaItem, opened: Opened) -> Result<(Sink, Duration), BackendError> {
        let decoder = opened.downcast::<FileDecoder>().map_err(|_| foreign_source())?;
        let duration = decoder.total_duration().unwrap_or(item.duration);

        let sink = Sink::try_new(&self.stream_handle)
            .map_err(|e| BackendError::Transient(format!("audio device busy: {}", e)))?;
        sink.pause();
        sink.set_speed(self.speed);
        sink.append(Equalized::new(decoder.convert_samples::<f32>(), self.equalizer.clone()));
        Ok((sink, duration))
    }

    fn drop_outgoing(&mut self) {
        if let Some(old) = self.outgoing.take() {
            old.stop();
        }
    }
}

// Equal-power curves keep perceived loudness flat through the fade
fn gain_in(t: f32) -> f32 {
    (t * FRAC_PI_2).sin()
}

fn gain_out(t: f32) -> f32 {
    (t * FRAC_PI_2).cos()
}

impl AudioBackend for RodioBackend {
    fn opener(&self) -> Opener {
        Arc::new(open_decoder)
    }

    fn load(&mut self, item: &MediaItem, opened: Opened) -> Result<Duration, BackendError> {
        self.stop();
        let (sink, duration) = self.attach(item, opened)?;
        sink.set_volume(self.volume);
        debug!("Loaded {} ({:?})", item.file_path.display(), duration);
        self.sink = Some(sink);
        Ok(duration)
    }

    fn play(&mut self) {
        if let Some(sink) = &self.sink {
            sink.play();
        }
    }

    fn pause(&mut self) {
        if let Some(sink) = &self.sink {
            sink.pause();
        }
        // A paused crossfade would otherwise resume with two audible items
        if self.outgoing.is_some() {
            self.drop_outgoing();
            self.fade = None;
            if let Some(sink) = &self.sink {
                sink.set_volume(self.volume);
            }
        }
    }

    fn stop(&mut self) {
        self.drop_outgoing();
        self.fade = None;
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn seek(&mut self, position: Duration) -> Result<(), BackendError> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        sink.try_seek(position).map_err(|e| match e {
            rodio::source::SeekError::NotSupported { .. } => BackendError::Persistent(e.to_string()),
            other => BackendError::Transient(other.to_string()),
        })
    }

    fn position(&self) -> Duration {
        self.sink.as_ref().map(Sink::get_pos).unwrap_or_default()
    }

    fn is_finished(&self) -> bool {
        self.sink.as_ref().map(Sink::empty).unwrap_or(false)
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if self.fade.is_none() {
            if let Some(sink) = &self.sink {
                sink.set_volume(self.volume);
            }
        }
    }

    fn set_speed(&mut self, speed: f32) {
        self.speed = speed;
        for sink in self.sink.iter().chain(self.outgoing.iter()) {
            sink.set_speed(speed);
        }
    }

    fn set_equalizer(&mut self, bands: Option<&EqualizerBands>) {
        self.equalizer.set(bands);
    }

    fn crossfade_to(&mut self, next: &MediaItem, opened: Opened, fade: Duration) -> Result<Duration, BackendError> {
        let (incoming, duration) = self.attach(next, opened)?;
        incoming.set_volume(0.0);
        incoming.play();

        self.drop_outgoing();
        self.outgoing = self.sink.replace(incoming);
        self.fade = Some(Fade {
            kind: FadeKind::Cross,
            started: Instant::now(),
            length: fade,
        });
        debug!("Crossfading into {} over {:?}", next.file_path.display(), fade);
        Ok(duration)
    }

    fn fade_out(&mut self, fade: Duration) {
        if self.sink.is_none() {
            return;
        }
        if self.fade.as_ref().is_some_and(|f| f.kind == FadeKind::Cross) {
            // Finish the crossfade abruptly; the sleep fade takes over
            self.drop_outgoing();
        }
        self.fade = Some(Fade {
            kind: FadeKind::Out,
            started: Instant::now(),
            length: fade,
        });
    }

    fn is_fading(&self) -> bool {
        self.fade.is_some()
    }

    fn tick(&mut self) {
        let (kind, t) = match &self.fade {
            Some(fade) => (fade.kind, fade.progress()),
            None => return,
        };
        match kind {
            FadeKind::Cross => {
                let drained = match &self.outgoing {
                    Some(old) => {
                        old.set_volume(self.volume * gain_out(t));
                        old.empty()
                    }
                    None => false,
                };
                if drained {
                    self.drop_outgoing();
                }
                if let Some(sink) = &self.sink {
                    sink.set_volume(self.volume * gain_in(t));
                }
                if t >= 1.0 {
                    self.drop_outgoing();
                    self.fade = None;
                }
            }
            FadeKind::Out => {
                if let Some(sink) = &self.sink {
                    sink.set_volume(self.volume * (1.0 - t));
                }
                if t >= 1.0 {
                    self.fade = None;
                }
            }
        }
    }
}

impl Drop for RodioBackend {
    fn drop(&mut self) {
        if self.sink.is_some() || self.outgoing.is_some() {
            debug!("Audio backend dropped while loaded; stopping output");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_power_curves_meet_at_the_ends() {
        assert!(gain_in(0.0).abs() < 1e-6);
        assert!((gain_in(1.0) - 1.0).abs() < 1e-6);
        assert!((gain_out(0.0) - 1.0).abs() < 1e-6);
        assert!(gain_out(1.0).abs() < 1e-6);
        let mid = gain_in(0.5).powi(2) + gain_out(0.5).powi(2);
        assert!((mid - 1.0).abs() < 1e-5);
    }

    #[test]
    fn zero_length_fade_is_complete() {
        let fade = Fade {
            kind: FadeKind::Out,
            started: Instant::now(),
            length: Duration::ZERO,
        };
        assert_eq!(fade.progress(), 1.0);
    }
}
