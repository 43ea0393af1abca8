// Playback state machine
// Single-threaded: the engine worker owns it and drives it with commands
// and ticks. Everything observable goes out through `take_events` and the
// status/queue views.

use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::backend::{AudioBackend, BackendError, Opened};
use super::queue::PlayQueue;
use super::state::{EngineEvent, EngineState, PlaybackStatus, PlayedItem, QueueView, TrackTransition};
use super::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::settings::{
    validate_crossfade, validate_equalizer, validate_speed, validate_volume,
};
use crate::model::{EqualizerBands, MediaItem, PlaybackSettings, QueueSnapshot, RepeatMode};

/// skipToPrevious past this point restarts the current item instead.
pub const RESTART_THRESHOLD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
struct SleepTimer {
    deadline: Instant,
    fading: bool,
}

pub struct EngineCore<B> {
    backend: B,
    config: EngineConfig,
    queue: PlayQueue,
    state: EngineState,
    duration: Duration,
    /// Furthest point reached in the current item.
    high_water: Duration,
    /// Position reported while nothing is loaded (stopped at the end).
    held_position: Duration,
    consecutive_errors: u32,
    crossfade_armed: bool,

    repeat: RepeatMode,
    speed: f32,
    volume: f32,
    duck: Option<f32>,
    crossfade: Duration,
    gapless: bool,
    equalizer: EqualizerBands,
    equalizer_enabled: bool,
    sleep: Option<SleepTimer>,

    outbox: Vec<EngineEvent>,
}

impl<B: AudioBackend> EngineCore<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        let defaults = PlaybackSettings::default();
        let mut core = Self {
            backend,
            queue: PlayQueue::new(config.shuffle_seed),
            config,
            state: EngineState::Idle,
            duration: Duration::ZERO,
            high_water: Duration::ZERO,
            held_position: Duration::ZERO,
            consecutive_errors: 0,
            crossfade_armed: true,
            repeat: defaults.repeat_mode,
            speed: defaults.playback_speed,
            volume: defaults.volume,
            duck: None,
            crossfade: Duration::ZERO,
            gapless: defaults.gapless_playback,
            equalizer: defaults.equalizer_settings,
            equalizer_enabled: defaults.equalizer_enabled,
            sleep: None,
            outbox: Vec::new(),
        };
        core.apply_output();
        core
    }

    // ---- views ----------------------------------------------------------

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn position(&self) -> Duration {
        match self.state {
            EngineState::Ready | EngineState::Playing | EngineState::Paused => {
                let position = self.backend.position();
                if self.duration.is_zero() {
                    position
                } else {
                    position.min(self.duration)
                }
            }
            EngineState::Stopped | EngineState::Completed => self.held_position,
            EngineState::Idle | EngineState::Loading => Duration::ZERO,
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            playing: self.state == EngineState::Playing,
            position: self.position(),
            duration: self.duration,
            buffering: self.state == EngineState::Loading,
            speed: self.speed,
            current_index: self.queue.current_index(),
        }
    }

    pub fn current_item(&self) -> Option<MediaItem> {
        self.queue.current_item().cloned()
    }

    pub fn queue_view(&self) -> QueueView {
        QueueView {
            items: self.queue.items().to_vec(),
            current_index: self.queue.current_index(),
            shuffle_enabled: self.queue.is_shuffled(),
            upcoming: self.queue.upcoming(),
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::from_items(self.queue.items(), self.queue.current_index(), self.position())
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.outbox)
    }

    // ---- loading ----------------------------------------------------------

    fn apply_output(&mut self) {
        let volume = self.volume * self.duck.unwrap_or(1.0);
        self.backend.set_volume(volume);
        self.backend.set_speed(self.speed);
        let bands = self.equalizer_enabled.then_some(&self.equalizer);
        self.backend.set_equalizer(bands);
    }

    /// Open `item` on a helper thread. A decode that has not finished
    /// within `load_timeout` is abandoned and reported as `Timeout`; the
    /// helper finishes on its own and its result is dropped.
    fn open_with_deadline(&self, item: &MediaItem) -> Result<std::result::Result<Opened, BackendError>> {
        let open = self.backend.opener();
        let target = item.clone();
        let (tx, rx) = std_mpsc::channel();
        thread::Builder::new()
            .name("offtune-loader".to_string())
            .spawn(move || {
                let _ = tx.send(open(&target));
            })?;

        match rx.recv_timeout(self.config.load_timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                warn!("Opening {} took longer than {:?}", item.file_path.display(), self.config.load_timeout);
                Err(EngineError::Timeout(self.config.load_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Ok(Err(BackendError::Persistent("loader thread died".into()))),
        }
    }

    fn try_load(&mut self, item: &MediaItem) -> Result<std::result::Result<Duration, BackendError>> {
        Ok(match self.open_with_deadline(item)? {
            Ok(opened) => self.backend.load(item, opened),
            Err(e) => Err(e),
        })
    }

    fn load_with_retry(&mut self, item: &MediaItem) -> Result<Duration> {
        let mut attempt = self.try_load(item);
        if let Ok(Err(BackendError::Transient(reason))) = &attempt {
            debug!("Transient load error on {}, retrying: {}", item.title, reason);
            attempt = self.try_load(item);
        }

        match attempt {
            Ok(Ok(duration)) => Ok(duration),
            Ok(Err(e)) => Err(EngineError::LoadError {
                item_id: item.song_id.clone(),
                reason: e.reason().to_string(),
            }),
            Err(e) => {
                // Whatever was loaded before is no longer current
                self.backend.stop();
                Err(e)
            }
        }
    }

    /// Load the current item, skipping forward past items that fail. Gives
    /// up after `max_consecutive_errors` failures in a row.
    fn open_current(&mut self, play: bool) -> Result<()> {
        loop {
            let Some(item) = self.queue.current_item().cloned() else {
                self.state = EngineState::Idle;
                self.duration = Duration::ZERO;
                return Ok(());
            };

            self.state = EngineState::Loading;
            self.high_water = Duration::ZERO;
            self.held_position = Duration::ZERO;
            self.crossfade_armed = true;

            match self.load_with_retry(&item) {
                Ok(duration) => {
                    self.consecutive_errors = 0;
                    self.duration = if duration.is_zero() { item.duration } else { duration };
                    self.apply_output();
                    self.state = EngineState::Ready;
                    if play {
                        self.backend.play();
                        self.state = EngineState::Playing;
                    }
                    info!("Loaded {} - {}", item.artist, item.title);
                    return Ok(());
                }
                Err(err) => {
                    self.consecutive_errors += 1;
                    warn!(
                        kind = "LoadError",
                        item = %item.song_id,
                        attempt = self.consecutive_errors,
                        "Skipping {}: {}",
                        item.file_path.display(),
                        err
                    );
                    self.outbox.push(EngineEvent::LoadFailed {
                        item: item.clone(),
                        reason: err.to_string(),
                    });

                    if self.consecutive_errors >= self.config.max_consecutive_errors {
                        let errors = self.consecutive_errors;
                        self.consecutive_errors = 0;
                        self.backend.stop();
                        self.state = EngineState::Stopped;
                        self.duration = Duration::ZERO;
                        self.outbox.push(EngineEvent::QueueExhaustedByErrors { errors });
                        return Err(EngineError::QueueExhaustedByErrors(errors));
                    }

                    let repeat = if self.repeat == RepeatMode::None {
                        RepeatMode::None
                    } else {
                        RepeatMode::All
                    };
                    if self.queue.advance(repeat).is_none() {
                        self.backend.stop();
                        self.state = EngineState::Stopped;
                        self.duration = Duration::ZERO;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn is_loaded(&self) -> bool {
        matches!(
            self.state,
            EngineState::Ready | EngineState::Playing | EngineState::Paused
        )
    }

    /// Close out the current item. `natural_end` counts it as heard to the end.
    fn leave_current(&mut self, natural_end: bool) -> Option<PlayedItem> {
        let item = self.queue.current_item().cloned()?;
        let reached = if self.is_loaded() {
            self.backend.position().max(self.high_water)
        } else {
            self.high_water
        };
        let listened = if natural_end && !self.duration.is_zero() {
            self.duration
        } else {
            reached
        };
        self.high_water = Duration::ZERO;
        Some(PlayedItem {
            item,
            listened,
            duration: self.duration,
        })
    }

    fn emit_transition(&mut self, finished: Option<PlayedItem>) {
        if let Some(finished) = finished {
            let next = if self.is_loaded() { self.current_item() } else { None };
            self.outbox.push(EngineEvent::Transition(TrackTransition { finished, next }));
        }
    }

    fn stop_at_end(&mut self) {
        self.held_position = self.duration;
        self.backend.stop();
        self.state = EngineState::Stopped;
    }

    // ---- queue commands -----------------------------------------------------

    /// Replace the queue. Playback starts only when `play` is set.
    pub fn set_queue(&mut self, items: Vec<MediaItem>, start_at: usize, play: bool) -> Result<()> {
        if items.is_empty() {
            self.clear_queue();
            return Ok(());
        }
        if start_at >= items.len() {
            return Err(EngineError::invalid(format!(
                "start index {} out of range for {} items",
                start_at,
                items.len()
            )));
        }
        let finished = self.leave_current(false);
        self.backend.stop();
        self.consecutive_errors = 0;
        self.queue.set_items(items, start_at);
        let result = self.open_current(play);
        self.emit_transition(finished);
        result
    }

    /// `items[index]` first, then the rest of the list, then what came
    /// before it. Shuffle is switched off.
    pub fn play_from(&mut self, items: Vec<MediaItem>, index: usize) -> Result<()> {
        if index >= items.len() {
            return Err(EngineError::invalid(format!("index {} out of range", index)));
        }
        let mut rotated = items;
        rotated.rotate_left(index);
        self.queue.disable_shuffle();
        self.set_queue(rotated, 0, true)
    }

    /// Shuffle the whole list and start from the first item of the
    /// permutation.
    pub fn play_shuffled(&mut self, items: Vec<MediaItem>) -> Result<()> {
        if items.is_empty() {
            self.clear_queue();
            return Ok(());
        }
        let finished = self.leave_current(false);
        self.backend.stop();
        self.consecutive_errors = 0;
        self.queue.disable_shuffle();
        self.queue.set_items(items, 0);
        self.queue.enable_shuffle(true);
        let result = self.open_current(true);
        self.emit_transition(finished);
        result
    }

    /// Put a persisted queue back, paused at `position`.
    pub fn restore(&mut self, items: Vec<MediaItem>, index: usize, position: Duration) -> Result<()> {
        self.set_queue(items, index, false)?;
        if self.queue.current_index() == Some(index) && self.is_loaded() {
            self.seek(position)?;
            self.state = EngineState::Paused;
        }
        Ok(())
    }

    pub fn enqueue(&mut self, item: MediaItem) -> Result<()> {
        let was_empty = self.queue.current_index().is_none();
        self.queue.enqueue(item);
        if was_empty {
            self.open_current(false)?;
        }
        Ok(())
    }

    pub fn insert_next(&mut self, item: MediaItem) -> Result<()> {
        let was_empty = self.queue.current_index().is_none();
        self.queue.insert_next(item);
        if was_empty {
            self.open_current(false)?;
        }
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> Result<()> {
        if index >= self.queue.len() {
            return Err(EngineError::invalid(format!("no queue item at {}", index)));
        }
        if self.queue.current_index() != Some(index) {
            self.queue.remove_at(index);
            return Ok(());
        }

        let resume = self.state == EngineState::Playing;
        let finished = self.leave_current(false);
        self.backend.stop();
        self.queue.remove_at(index);
        let result = if self.queue.current_index().is_some() {
            self.open_current(resume)
        } else {
            self.state = if self.queue.is_empty() {
                EngineState::Idle
            } else {
                EngineState::Stopped
            };
            self.duration = Duration::ZERO;
            self.held_position = Duration::ZERO;
            Ok(())
        };
        self.emit_transition(finished);
        result
    }

    /// Drop every queue entry for `song_id`. Returns how many went.
    pub fn remove_song(&mut self, song_id: &str) -> Result<usize> {
        let mut removed = 0;
        while let Some(index) = self.queue.position_of(song_id) {
            self.remove_at(index)?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn move_item(&mut self, from: usize, to: usize) -> Result<()> {
        if self.queue.move_item(from, to) {
            Ok(())
        } else {
            Err(EngineError::invalid(format!("cannot move {} to {}", from, to)))
        }
    }

    pub fn clear_queue(&mut self) {
        let finished = self.leave_current(false);
        self.backend.stop();
        self.queue.clear();
        self.state = EngineState::Idle;
        self.duration = Duration::ZERO;
        self.held_position = Duration::ZERO;
        self.emit_transition(finished);
    }

    // ---- transport ------------------------------------------------------------

    pub fn play(&mut self) -> Result<()> {
        match self.state {
            EngineState::Ready | EngineState::Paused => {
                self.backend.play();
                self.state = EngineState::Playing;
                Ok(())
            }
            EngineState::Stopped | EngineState::Completed => self.open_current(true),
            EngineState::Playing | EngineState::Idle | EngineState::Loading => Ok(()),
        }
    }

    pub fn pause(&mut self) {
        if matches!(self.state, EngineState::Playing | EngineState::Ready) {
            self.high_water = self.high_water.max(self.backend.position());
            self.backend.pause();
            self.state = EngineState::Paused;
        }
    }

    pub fn toggle(&mut self) -> Result<()> {
        if self.state == EngineState::Playing {
            self.pause();
            Ok(())
        } else {
            self.play()
        }
    }

    pub fn stop(&mut self) {
        if self.is_loaded() {
            self.high_water = self.high_water.max(self.backend.position());
            self.backend.stop();
            self.state = EngineState::Stopped;
            self.held_position = Duration::ZERO;
        }
    }

    pub fn seek(&mut self, position: Duration) -> Result<()> {
        if !self.is_loaded() {
            return Err(EngineError::invalid("nothing loaded to seek in"));
        }
        let target = if self.duration.is_zero() {
            position
        } else {
            position.min(self.duration)
        };
        self.high_water = self.high_water.max(self.backend.position());

        let mut attempt = self.backend.seek(target);
        if let Err(BackendError::Transient(_)) = attempt {
            attempt = self.backend.seek(target);
        }
        attempt.map_err(|e| EngineError::DecoderFailure {
            path: self
                .queue
                .current_item()
                .map(|i| i.file_path.display().to_string())
                .unwrap_or_default(),
            reason: e.reason().to_string(),
        })
    }

    /// User skip. Under `RepeatMode::One` it moves on like `All`.
    pub fn skip_next(&mut self) -> Result<()> {
        if self.queue.current_index().is_none() {
            return Ok(());
        }
        let repeat = match self.repeat {
            RepeatMode::One => RepeatMode::All,
            other => other,
        };
        let resume = self.state == EngineState::Playing;

        if self.queue.peek_next(repeat).is_none() {
            if self.state == EngineState::Stopped {
                return Ok(());
            }
            let finished = self.leave_current(false);
            self.stop_at_end();
            self.emit_transition(finished);
            return Ok(());
        }

        let finished = self.leave_current(false);
        self.queue.advance(repeat);
        let result = self.open_current(resume);
        self.emit_transition(finished);
        result
    }

    pub fn skip_previous(&mut self) -> Result<()> {
        if self.queue.current_index().is_none() {
            return Ok(());
        }
        let repeat = match self.repeat {
            RepeatMode::One => RepeatMode::All,
            other => other,
        };

        if self.position() > RESTART_THRESHOLD || self.queue.peek_previous(repeat).is_none() {
            return if self.is_loaded() {
                self.seek(Duration::ZERO)
            } else {
                self.open_current(false)
            };
        }

        let resume = self.state == EngineState::Playing;
        let finished = self.leave_current(false);
        self.queue.retreat(repeat);
        let result = self.open_current(resume);
        self.emit_transition(finished);
        result
    }

    pub fn skip_to_index(&mut self, index: usize) -> Result<()> {
        if index >= self.queue.len() {
            return Err(EngineError::invalid(format!("no queue item at {}", index)));
        }
        let finished = self.leave_current(false);
        self.queue.jump_to(index);
        let result = self.open_current(true);
        self.emit_transition(finished);
        result
    }

    // ---- settings ---------------------------------------------------------------

    /// Off -> on draws a fresh permutation led by the current item.
    pub fn set_shuffle(&mut self, enabled: bool) {
        match (enabled, self.queue.is_shuffled()) {
            (true, false) => self.queue.enable_shuffle(false),
            (false, true) => self.queue.disable_shuffle(),
            _ => {}
        }
    }

    pub fn is_shuffled(&self) -> bool {
        self.queue.is_shuffled()
    }

    pub fn set_repeat_mode(&mut self, mode: RepeatMode) {
        self.repeat = mode;
    }

    pub fn set_speed(&mut self, speed: f32) -> Result<()> {
        validate_speed(speed)?;
        self.speed = speed;
        self.backend.set_speed(speed);
        Ok(())
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        validate_volume(volume)?;
        self.volume = volume;
        self.apply_output();
        Ok(())
    }

    /// Scale output while another app holds focus. `None` restores it.
    pub fn set_duck(&mut self, factor: Option<f32>) -> Result<()> {
        if let Some(factor) = factor {
            validate_volume(factor)?;
        }
        self.duck = factor;
        self.apply_output();
        Ok(())
    }

    pub fn set_equalizer(&mut self, bands: EqualizerBands, enabled: bool) -> Result<()> {
        validate_equalizer(&bands)?;
        self.equalizer = bands;
        self.equalizer_enabled = enabled;
        self.apply_output();
        Ok(())
    }

    pub fn set_crossfade(&mut self, seconds: f32) -> Result<()> {
        validate_crossfade(seconds)?;
        self.crossfade = Duration::from_secs_f32(seconds);
        Ok(())
    }

    pub fn set_gapless(&mut self, gapless: bool) {
        self.gapless = gapless;
    }

    /// All-or-nothing: an invalid field leaves every setting unchanged.
    pub fn apply_settings(&mut self, settings: &PlaybackSettings) -> Result<()> {
        settings.validate()?;
        self.set_shuffle(settings.shuffle_enabled);
        self.repeat = settings.repeat_mode;
        self.speed = settings.playback_speed;
        self.volume = settings.volume;
        self.crossfade = Duration::from_secs_f32(settings.crossfade_duration);
        self.gapless = settings.gapless_playback;
        self.equalizer = settings.equalizer_settings.clone();
        self.equalizer_enabled = settings.equalizer_enabled;
        self.apply_output();
        Ok(())
    }

    pub fn arm_sleep_timer(&mut self, after: Duration, now: Instant) -> Result<()> {
        if after.is_zero() {
            return Err(EngineError::invalid("sleep timer needs a positive duration"));
        }
        self.sleep = Some(SleepTimer {
            deadline: now + after,
            fading: false,
        });
        debug!("Sleep timer armed for {:?}", after);
        Ok(())
    }

    pub fn disarm_sleep_timer(&mut self) {
        self.sleep = None;
    }

    pub fn sleep_remaining(&self, now: Instant) -> Option<Duration> {
        self.sleep.map(|t| t.deadline.saturating_duration_since(now))
    }

    pub fn shutdown(&mut self) {
        self.backend.stop();
        self.state = EngineState::Stopped;
    }

    // ---- clock --------------------------------------------------------------------

    pub fn on_tick(&mut self, now: Instant) {
        self.backend.tick();
        self.check_sleep_timer(now);

        if self.state != EngineState::Playing {
            return;
        }
        let position = self.backend.position();
        self.high_water = self.high_water.max(position);

        if self.backend.is_finished() {
            self.finish_current();
        } else {
            self.maybe_crossfade(position);
        }
    }

    fn check_sleep_timer(&mut self, now: Instant) {
        let Some(timer) = self.sleep else {
            return;
        };
        let expired = if timer.fading {
            !self.backend.is_fading()
        } else if now >= timer.deadline {
            if !self.crossfade.is_zero() && self.state == EngineState::Playing {
                self.backend.fade_out(self.crossfade);
                self.sleep = Some(SleepTimer { fading: true, ..timer });
                false
            } else {
                true
            }
        } else {
            false
        };

        if expired {
            self.sleep = None;
            info!("Sleep timer fired");
            self.pause();
            self.stop();
            self.outbox.push(EngineEvent::SleepTimerFired);
        }
    }

    fn finish_current(&mut self) {
        self.state = EngineState::Completed;
        self.held_position = self.duration;
        let finished = self.leave_current(true);

        let result = match self.repeat {
            RepeatMode::One => self.open_current(true),
            repeat => match self.queue.advance(repeat) {
                Some(_) => self.open_current(true),
                None => {
                    self.stop_at_end();
                    Ok(())
                }
            },
        };
        if let Err(e) = result {
            warn!("Playback stopped: {}", e);
        }
        self.emit_transition(finished);
    }

    fn maybe_crossfade(&mut self, position: Duration) {
        if self.crossfade.is_zero()
            || !self.gapless
            || self.repeat == RepeatMode::One
            || !self.crossfade_armed
            || self.duration.is_zero()
        {
            return;
        }
        if self.duration.saturating_sub(position) > self.crossfade {
            return;
        }
        self.crossfade_armed = false;

        let Some(next_index) = self.queue.peek_next(self.repeat) else {
            return;
        };
        let Some(next) = self.queue.items().get(next_index).cloned() else {
            return;
        };

        let prepared = match self.open_with_deadline(&next) {
            Ok(Ok(opened)) => self.backend.crossfade_to(&next, opened, self.crossfade),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(BackendError::Transient(e.to_string())),
        };
        match prepared {
            Ok(duration) => {
                let finished = self.leave_current(true);
                self.queue.jump_to(next_index);
                self.duration = if duration.is_zero() { next.duration } else { duration };
                self.consecutive_errors = 0;
                self.crossfade_armed = true;
                self.apply_output();
                self.state = EngineState::Playing;
                debug!("Crossfaded into {}", next.title);
                self.emit_transition(finished);
            }
            Err(e) => {
                // Natural end will pick the next item up gaplessly
                debug!("Crossfade into {} unavailable: {}", next.title, e);
            }
        }
    }
}
