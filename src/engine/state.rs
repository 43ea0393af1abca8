use std::time::Duration;

use crate::model::MediaItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Loading,
    /// Loaded, not started yet.
    Ready,
    Playing,
    Paused,
    /// Natural end of an item, before the engine decides what follows.
    Completed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStatus {
    pub state: EngineState,
    pub playing: bool,
    pub position: Duration,
    pub duration: Duration,
    pub buffering: bool,
    pub speed: f32,
    pub current_index: Option<usize>,
}

impl Default for PlaybackStatus {
    fn default() -> Self {
        Self {
            state: EngineState::Idle,
            playing: false,
            position: Duration::ZERO,
            duration: Duration::ZERO,
            buffering: false,
            speed: 1.0,
            current_index: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueView {
    pub items: Vec<MediaItem>,
    pub current_index: Option<usize>,
    pub shuffle_enabled: bool,
    /// Indices still to play, in play order.
    pub upcoming: Vec<usize>,
}

/// An item the engine moved away from and how much of it was heard.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedItem {
    pub item: MediaItem,
    pub listened: Duration,
    pub duration: Duration,
}

impl PlayedItem {
    /// At least `min_listened`, or at least `fraction` of a known duration.
    pub fn reached(&self, min_listened: Duration, fraction: f64) -> bool {
        if self.listened >= min_listened {
            return true;
        }
        !self.duration.is_zero() && self.listened.as_secs_f64() >= self.duration.as_secs_f64() * fraction
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackTransition {
    pub finished: PlayedItem,
    /// What plays now. `None` when playback ran off the end of the queue.
    pub next: Option<MediaItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Transition(TrackTransition),
    LoadFailed { item: MediaItem, reason: String },
    QueueExhaustedByErrors { errors: u32 },
    SleepTimerFired,
}
