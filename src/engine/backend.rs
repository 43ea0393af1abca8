// Renderer seam between the engine state machine and the audio device

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::model::{EqualizerBands, MediaItem};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// Worth one more attempt (device busy, short read).
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Persistent(String),
}

impl BackendError {
    pub fn reason(&self) -> &str {
        match self {
            BackendError::Transient(r) | BackendError::Persistent(r) => r,
        }
    }
}

/// An item opened by an [`Opener`], not yet on the output. Each backend
/// downcasts it back to its own decoder type.
pub type Opened = Box<dyn Any + Send>;

/// Opens and probes a file. Runs on a helper thread under the load
/// timeout, so it must not touch the output device.
pub type Opener = Arc<dyn Fn(&MediaItem) -> Result<Opened, BackendError> + Send + Sync>;

pub(crate) fn foreign_source() -> BackendError {
    BackendError::Persistent("opened item came from another backend".into())
}

/// One playback decoder plus output. Owned by the engine thread, so it does
/// not need to be `Send`.
pub trait AudioBackend {
    fn opener(&self) -> Opener;

    /// Replace whatever is loaded with an item the opener produced, paused
    /// at zero. Returns the decoded duration, or zero when the container
    /// does not say.
    fn load(&mut self, item: &MediaItem, opened: Opened) -> Result<Duration, BackendError>;

    fn play(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);
    fn seek(&mut self, position: Duration) -> Result<(), BackendError>;

    fn position(&self) -> Duration;

    /// True once the loaded item has played out.
    fn is_finished(&self) -> bool;

    fn set_volume(&mut self, volume: f32);
    fn set_speed(&mut self, speed: f32);

    /// `None` bypasses the filter chain.
    fn set_equalizer(&mut self, bands: Option<&EqualizerBands>);

    /// Start `next` under the current item and fade between them over
    /// `fade`. On success `next` is the loaded item.
    fn crossfade_to(&mut self, next: &MediaItem, opened: Opened, fade: Duration) -> Result<Duration, BackendError>;

    /// Ramp the output to silence over `fade`.
    fn fade_out(&mut self, fade: Duration);

    fn is_fading(&self) -> bool;

    /// Called on every engine tick to advance fades.
    fn tick(&mut self) {}
}

impl<B: AudioBackend + ?Sized> AudioBackend for Box<B> {
    fn opener(&self) -> Opener {
        (**self).opener()
    }
    fn load(&mut self, item: &MediaItem, opened: Opened) -> Result<Duration, BackendError> {
        (**self).load(item, opened)
    }
    fn play(&mut self) {
        (**self).play()
    }
    fn pause(&mut self) {
        (**self).pause()
    }
    fn stop(&mut self) {
        (**self).stop()
    }
    fn seek(&mut self, position: Duration) -> Result<(), BackendError> {
        (**self).seek(position)
    }
    fn position(&self) -> Duration {
        (**self).position()
    }
    fn is_finished(&self) -> bool {
        (**self).is_finished()
    }
    fn set_volume(&mut self, volume: f32) {
        (**self).set_volume(volume)
    }
    fn set_speed(&mut self, speed: f32) {
        (**self).set_speed(speed)
    }
    fn set_equalizer(&mut self, bands: Option<&EqualizerBands>) {
        (**self).set_equalizer(bands)
    }
    fn crossfade_to(&mut self, next: &MediaItem, opened: Opened, fade: Duration) -> Result<Duration, BackendError> {
        (**self).crossfade_to(next, opened, fade)
    }
    fn fade_out(&mut self, fade: Duration) {
        (**self).fade_out(fade)
    }
    fn is_fading(&self) -> bool {
        (**self).is_fading()
    }
    fn tick(&mut self) {
        (**self).tick()
    }
}

/// Renderer that accepts everything and plays nothing. Used when no audio
/// device is available or the `audio` feature is off.
#[derive(Debug, Default)]
pub struct NullBackend {
    loaded: Option<Duration>,
    playing: bool,
    position: Duration,
}

impl AudioBackend for NullBackend {
    fn opener(&self) -> Opener {
        Arc::new(|item: &MediaItem| {
            if !item.file_path.is_file() {
                return Err(BackendError::Persistent(format!("{} does not exist", item.file_path.display())));
            }
            Ok(Box::new(item.duration) as Opened)
        })
    }

    fn load(&mut self, item: &MediaItem, opened: Opened) -> Result<Duration, BackendError> {
        opened.downcast::<Duration>().map_err(|_| foreign_source())?;
        self.loaded = Some(item.duration);
        self.playing = false;
        self.position = Duration::ZERO;
        Ok(item.duration)
    }

    fn play(&mut self) {
        self.playing = self.loaded.is_some();
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn stop(&mut self) {
        self.loaded = None;
        self.playing = false;
        self.position = Duration::ZERO;
    }

    fn seek(&mut self, position: Duration) -> Result<(), BackendError> {
        self.position = position;
        Ok(())
    }

    fn position(&self) -> Duration {
        self.position
    }

    fn is_finished(&self) -> bool {
        false
    }

    fn set_volume(&mut self, _volume: f32) {}
    fn set_speed(&mut self, _speed: f32) {}
    fn set_equalizer(&mut self, _bands: Option<&EqualizerBands>) {}

    fn crossfade_to(&mut self, next: &MediaItem, opened: Opened, _fade: Duration) -> Result<Duration, BackendError> {
        let duration = self.load(next, opened)?;
        self.playing = true;
        Ok(duration)
    }

    fn fade_out(&mut self, _fade: Duration) {}

    fn is_fading(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard};

    #[derive(Debug, Default)]
    pub struct MockState {
        pub loaded: Option<String>,
        pub loads: Vec<String>,
        pub crossfades: Vec<String>,
        pub playing: bool,
        pub position: Duration,
        pub finished: bool,
        pub volume: f32,
        pub speed: f32,
        pub equalizer: Option<EqualizerBands>,
        pub fading_out: bool,
        pub stops: u32,
        /// Scripted results per song id, consumed front to back.
        pub load_failures: HashMap<String, VecDeque<BackendError>>,
        pub crossfade_fails: bool,
        /// How long every open takes.
        pub open_delay: Duration,
    }

    /// Scripted renderer. Tests keep a `MockHandle` to move the playhead and
    /// inspect what the engine asked for.
    pub struct MockBackend {
        state: Arc<Mutex<MockState>>,
    }

    #[derive(Clone)]
    pub struct MockHandle {
        state: Arc<Mutex<MockState>>,
    }

    impl MockBackend {
        pub fn new() -> (Self, MockHandle) {
            let state = Arc::new(Mutex::new(MockState {
                volume: 1.0,
                speed: 1.0,
                ..Default::default()
            }));
            (
                Self {
                    state: Arc::clone(&state),
                },
                MockHandle { state },
            )
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }
    }

    impl MockHandle {
        pub fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }

        pub fn set_position(&self, position: Duration) {
            self.state().position = position;
        }

        pub fn finish(&self) {
            self.state().finished = true;
        }

        pub fn fail_load(&self, song_id: &str, error: BackendError) {
            self.state()
                .load_failures
                .entry(song_id.to_string())
                .or_default()
                .push_back(error);
        }

        pub fn loads(&self) -> Vec<String> {
            self.state().loads.clone()
        }

        pub fn playing(&self) -> bool {
            self.state().playing
        }
    }

    impl AudioBackend for MockBackend {
        fn opener(&self) -> Opener {
            let state = Arc::clone(&self.state);
            Arc::new(move |item: &MediaItem| {
                let delay = state.lock().unwrap().open_delay;
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                let mut state = state.lock().unwrap();
                state.loads.push(item.song_id.clone());
                match state
                    .load_failures
                    .get_mut(&item.song_id)
                    .and_then(|queue| queue.pop_front())
                {
                    Some(err) => Err(err),
                    None => Ok(Box::new(item.song_id.clone()) as Opened),
                }
            })
        }

        fn load(&mut self, item: &MediaItem, opened: Opened) -> Result<Duration, BackendError> {
            let id = opened.downcast::<String>().map_err(|_| foreign_source())?;
            let mut state = self.state();
            state.loaded = Some(*id);
            state.playing = false;
            state.position = Duration::ZERO;
            state.finished = false;
            Ok(item.duration)
        }

        fn play(&mut self) {
            let mut state = self.state();
            state.playing = state.loaded.is_some();
        }

        fn pause(&mut self) {
            self.state().playing = false;
        }

        fn stop(&mut self) {
            let mut state = self.state();
            state.loaded = None;
            state.playing = false;
            state.position = Duration::ZERO;
            state.stops += 1;
        }

        fn seek(&mut self, position: Duration) -> Result<(), BackendError> {
            let mut state = self.state();
            state.position = position;
            state.finished = false;
            Ok(())
        }

        fn position(&self) -> Duration {
            self.state().position
        }

        fn is_finished(&self) -> bool {
            self.state().finished
        }

        fn set_volume(&mut self, volume: f32) {
            self.state().volume = volume;
        }

        fn set_speed(&mut self, speed: f32) {
            self.state().speed = speed;
        }

        fn set_equalizer(&mut self, bands: Option<&EqualizerBands>) {
            self.state().equalizer = bands.cloned();
        }

        fn crossfade_to(&mut self, next: &MediaItem, opened: Opened, _fade: Duration) -> Result<Duration, BackendError> {
            if self.state().crossfade_fails {
                return Err(BackendError::Persistent("decoder not ready".into()));
            }
            let duration = self.load(next, opened)?;
            let mut state = self.state();
            state.crossfades.push(next.song_id.clone());
            state.playing = true;
            Ok(duration)
        }

        fn fade_out(&mut self, _fade: Duration) {
            self.state().fading_out = true;
        }

        fn is_fading(&self) -> bool {
            self.state().fading_out
        }

        fn tick(&mut self) {
            // Fades complete within one tick
            self.state().fading_out = false;
        }
    }
}
