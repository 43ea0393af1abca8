// Playback engine handle + dedicated worker thread
// All state mutation happens on one thread running a current-thread runtime;
// callers talk to it through an ordered command channel and observe watch
// channels for the current item, playback state and queue

pub mod backend;
mod machine;
#[cfg(feature = "audio")]
pub mod equalizer;
pub mod queue;
#[cfg(feature = "audio")]
pub mod rodio_backend;
pub mod state;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::{EqualizerBands, MediaItem, PlaybackSettings, QueueSnapshot, RepeatMode};

pub use machine::{EngineCore, RESTART_THRESHOLD};
pub use backend::{AudioBackend, BackendError, NullBackend};
pub use state::{EngineEvent, EngineState, PlaybackStatus, PlayedItem, QueueView, TrackTransition};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub load_timeout: Duration,
    pub max_consecutive_errors: u32,
    pub shuffle_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            load_timeout: Duration::from_secs(10),
            max_consecutive_errors: 5,
            shuffle_seed: None,
        }
    }
}

/// Awaited on the engine thread for every transition, before the new
/// current item is published.
pub type TransitionHook = Arc<dyn Fn(TrackTransition) -> BoxFuture<'static, ()> + Send + Sync>;

enum Op {
    SetQueue {
        items: Vec<MediaItem>,
        start_at: usize,
        play: bool,
    },
    PlayFrom {
        items: Vec<MediaItem>,
        index: usize,
    },
    PlayShuffled(Vec<MediaItem>),
    Restore {
        items: Vec<MediaItem>,
        index: usize,
        position: Duration,
    },
    Play,
    Pause,
    Toggle,
    Stop,
    /// Target lives in the shared pending-seek slot.
    Seek,
    SkipNext,
    SkipPrevious,
    SkipToIndex(usize),
    Enqueue(MediaItem),
    InsertNext(MediaItem),
    RemoveAt(usize),
    RemoveSong(String),
    Move { from: usize, to: usize },
    ClearQueue,
    SetShuffle(bool),
    SetRepeat(RepeatMode),
    SetSpeed(f32),
    SetVolume(f32),
    SetDuck(Option<f32>),
    SetEqualizer { bands: EqualizerBands, enabled: bool },
    SetCrossfade(f32),
    SetGapless(bool),
    ApplySettings(Box<PlaybackSettings>),
    ArmSleepTimer(Duration),
    DisarmSleepTimer,
    Snapshot,
    Shutdown,
}

enum Outcome {
    Done,
    Removed(usize),
    Snapshot(QueueSnapshot),
}

struct Command {
    op: Op,
    reply: oneshot::Sender<Result<Outcome>>,
}

type PendingSeek = Arc<Mutex<Option<Duration>>>;

struct EngineWorker<B> {
    core: EngineCore<B>,
    commands: mpsc::UnboundedReceiver<Command>,
    current_tx: watch::Sender<Option<MediaItem>>,
    status_tx: watch::Sender<PlaybackStatus>,
    queue_tx: watch::Sender<QueueView>,
    events: broadcast::Sender<EngineEvent>,
    hook: Option<TransitionHook>,
    pending_seek: PendingSeek,
    tick_interval: Duration,
}

impl<B: AudioBackend> EngineWorker<B> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.publish();

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(Command { op, reply }) = command else {
                        break;
                    };
                    let shutdown = matches!(op, Op::Shutdown);
                    let result = self.apply(op);
                    self.flush().await;
                    let _ = reply.send(result);
                    if shutdown {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.core.on_tick(Instant::now());
                    self.flush().await;
                }
            }
        }

        self.core.shutdown();
        self.flush().await;
        info!("Playback engine stopped");
    }

    fn apply(&mut self, op: Op) -> Result<Outcome> {
        let core = &mut self.core;
        match op {
            Op::SetQueue { items, start_at, play } => core.set_queue(items, start_at, play)?,
            Op::PlayFrom { items, index } => core.play_from(items, index)?,
            Op::PlayShuffled(items) => core.play_shuffled(items)?,
            Op::Restore { items, index, position } => core.restore(items, index, position)?,
            Op::Play => core.play()?,
            Op::Pause => core.pause(),
            Op::Toggle => core.toggle()?,
            Op::Stop => core.stop(),
            Op::Seek => {
                let target = self
                    .pending_seek
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(target) = target {
                    core.seek(target)?;
                }
            }
            Op::SkipNext => core.skip_next()?,
            Op::SkipPrevious => core.skip_previous()?,
            Op::SkipToIndex(index) => core.skip_to_index(index)?,
            Op::Enqueue(item) => core.enqueue(item)?,
            Op::InsertNext(item) => core.insert_next(item)?,
            Op::RemoveAt(index) => core.remove_at(index)?,
            Op::RemoveSong(id) => return core.remove_song(&id).map(Outcome::Removed),
            Op::Move { from, to } => core.move_item(from, to)?,
            Op::ClearQueue => core.clear_queue(),
            Op::SetShuffle(enabled) => core.set_shuffle(enabled),
            Op::SetRepeat(mode) => core.set_repeat_mode(mode),
            Op::SetSpeed(speed) => core.set_speed(speed)?,
            Op::SetVolume(volume) => core.set_volume(volume)?,
            Op::SetDuck(factor) => core.set_duck(factor)?,
            Op::SetEqualizer { bands, enabled } => core.set_equalizer(bands, enabled)?,
            Op::SetCrossfade(seconds) => core.set_crossfade(seconds)?,
            Op::SetGapless(gapless) => core.set_gapless(gapless),
            Op::ApplySettings(settings) => core.apply_settings(&settings)?,
            Op::ArmSleepTimer(after) => core.arm_sleep_timer(after, Instant::now())?,
            Op::DisarmSleepTimer => core.disarm_sleep_timer(),
            Op::Snapshot => return Ok(Outcome::Snapshot(core.snapshot())),
            Op::Shutdown => core.shutdown(),
        }
        Ok(Outcome::Done)
    }

    /// Hook first, then events, then the watches.
    async fn flush(&mut self) {
        for event in self.core.take_events() {
            if let (EngineEvent::Transition(transition), Some(hook)) = (&event, &self.hook) {
                hook(transition.clone()).await;
            }
            let _ = self.events.send(event);
        }
        self.publish();
    }

    fn publish(&self) {
        let current = self.core.current_item();
        self.current_tx.send_if_modified(|slot| {
            if *slot != current {
                *slot = current;
                true
            } else {
                false
            }
        });
        let status = self.core.status();
        self.status_tx.send_if_modified(|slot| {
            if *slot != status {
                *slot = status;
                true
            } else {
                false
            }
        });
        let queue = self.core.queue_view();
        self.queue_tx.send_if_modified(|slot| {
            if *slot != queue {
                *slot = queue;
                true
            } else {
                false
            }
        });
    }
}

/// Cheap to clone; every clone talks to the same worker.
#[derive(Clone)]
pub struct PlaybackEngine {
    commands: mpsc::UnboundedSender<Command>,
    current: watch::Receiver<Option<MediaItem>>,
    status: watch::Receiver<PlaybackStatus>,
    queue: watch::Receiver<QueueView>,
    events: broadcast::Sender<EngineEvent>,
    pending_seek: PendingSeek,
}

impl PlaybackEngine {
    /// Start the worker thread. `make_backend` runs on that thread, so the
    /// backend itself never has to cross threads.
    pub async fn spawn<F, B>(config: EngineConfig, make_backend: F, hook: Option<TransitionHook>) -> Result<Self>
    where
        F: FnOnce() -> Result<B> + Send + 'static,
        B: AudioBackend + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (current_tx, current) = watch::channel(None);
        let (status_tx, status) = watch::channel(PlaybackStatus::default());
        let (queue_tx, queue) = watch::channel(QueueView::default());
        let (events, _) = broadcast::channel(64);
        let pending_seek: PendingSeek = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let worker_events = events.clone();
        let worker_seek = Arc::clone(&pending_seek);
        std::thread::Builder::new()
            .name("offtune-engine".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(EngineError::Io(e)));
                        return;
                    }
                };
                let backend = match make_backend() {
                    Ok(backend) => backend,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let worker = EngineWorker {
                    tick_interval: config.tick_interval,
                    core: EngineCore::new(backend, config),
                    commands: commands_rx,
                    current_tx,
                    status_tx,
                    queue_tx,
                    events: worker_events,
                    hook,
                    pending_seek: worker_seek,
                };
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(worker.run());
            })?;

        ready_rx.await.map_err(|_| EngineError::EngineUnavailable)??;
        debug!("Playback engine started");

        Ok(Self {
            commands: commands_tx,
            current,
            status,
            queue,
            events,
            pending_seek,
        })
    }

    async fn send(&self, op: Op) -> Result<Outcome> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command { op, reply })
            .map_err(|_| EngineError::EngineUnavailable)?;
        response.await.map_err(|_| EngineError::EngineUnavailable)?
    }

    async fn run(&self, op: Op) -> Result<()> {
        self.send(op).await.map(|_| ())
    }

    // ---- streams ----------------------------------------------------------

    pub fn current_item(&self) -> watch::Receiver<Option<MediaItem>> {
        self.current.clone()
    }

    pub fn playback_state(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    pub fn queue_view(&self) -> watch::Receiver<QueueView> {
        self.queue.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    // ---- queue ---------------------------------------------------------------

    /// Replace the queue. Stays paused on `start_at` unless `play_now`.
    pub async fn set_queue(&self, items: Vec<MediaItem>, start_at: usize, play_now: bool) -> Result<()> {
        self.run(Op::SetQueue {
            items,
            start_at,
            play: play_now,
        })
        .await
    }

    pub async fn play_from(&self, items: Vec<MediaItem>, index: usize) -> Result<()> {
        self.run(Op::PlayFrom { items, index }).await
    }

    pub async fn play_shuffled(&self, items: Vec<MediaItem>) -> Result<()> {
        self.run(Op::PlayShuffled(items)).await
    }

    pub async fn restore(&self, items: Vec<MediaItem>, index: usize, position: Duration) -> Result<()> {
        self.run(Op::Restore { items, index, position }).await
    }

    pub async fn enqueue(&self, item: MediaItem) -> Result<()> {
        self.run(Op::Enqueue(item)).await
    }

    pub async fn insert_next(&self, item: MediaItem) -> Result<()> {
        self.run(Op::InsertNext(item)).await
    }

    pub async fn remove_at(&self, index: usize) -> Result<()> {
        self.run(Op::RemoveAt(index)).await
    }

    pub async fn remove_song(&self, song_id: &str) -> Result<usize> {
        match self.send(Op::RemoveSong(song_id.to_string())).await? {
            Outcome::Removed(count) => Ok(count),
            _ => Ok(0),
        }
    }

    pub async fn move_item(&self, from: usize, to: usize) -> Result<()> {
        self.run(Op::Move { from, to }).await
    }

    pub async fn clear_queue(&self) -> Result<()> {
        self.run(Op::ClearQueue).await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        match self.send(Op::Snapshot).await? {
            Outcome::Snapshot(snapshot) => Ok(snapshot),
            _ => Err(EngineError::EngineUnavailable),
        }
    }

    // ---- transport -------------------------------------------------------------

    pub async fn play(&self) -> Result<()> {
        self.run(Op::Play).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.run(Op::Pause).await
    }

    pub async fn toggle(&self) -> Result<()> {
        self.run(Op::Toggle).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.run(Op::Stop).await
    }

    /// A seek still waiting in the channel is replaced, not queued behind.
    pub async fn seek_to(&self, position: Duration) -> Result<()> {
        let first = {
            let mut slot = self.seek_slot();
            let first = slot.is_none();
            *slot = Some(position);
            first
        };
        if !first {
            return Ok(());
        }
        let result = self.run(Op::Seek).await;
        if let Err(EngineError::EngineUnavailable) = &result {
            // Nobody will drain the slot; later seeks must not coalesce into it
            self.seek_slot().take();
        }
        result
    }

    fn seek_slot(&self) -> std::sync::MutexGuard<'_, Option<Duration>> {
        self.pending_seek
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn skip_to_next(&self) -> Result<()> {
        self.run(Op::SkipNext).await
    }

    pub async fn skip_to_previous(&self) -> Result<()> {
        self.run(Op::SkipPrevious).await
    }

    pub async fn skip_to_index(&self, index: usize) -> Result<()> {
        self.run(Op::SkipToIndex(index)).await
    }

    // ---- settings ---------------------------------------------------------------

    pub async fn set_shuffle(&self, enabled: bool) -> Result<()> {
        self.run(Op::SetShuffle(enabled)).await
    }

    pub async fn set_repeat_mode(&self, mode: RepeatMode) -> Result<()> {
        self.run(Op::SetRepeat(mode)).await
    }

    pub async fn set_speed(&self, speed: f32) -> Result<()> {
        self.run(Op::SetSpeed(speed)).await
    }

    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        self.run(Op::SetVolume(volume)).await
    }

    pub async fn set_duck(&self, factor: Option<f32>) -> Result<()> {
        self.run(Op::SetDuck(factor)).await
    }

    pub async fn set_equalizer(&self, bands: EqualizerBands, enabled: bool) -> Result<()> {
        self.run(Op::SetEqualizer { bands, enabled }).await
    }

    pub async fn set_crossfade(&self, seconds: f32) -> Result<()> {
        self.run(Op::SetCrossfade(seconds)).await
    }

    pub async fn set_gapless(&self, gapless: bool) -> Result<()> {
        self.run(Op::SetGapless(gapless)).await
    }

    pub async fn apply_settings(&self, settings: PlaybackSettings) -> Result<()> {
        self.run(Op::ApplySettings(Box::new(settings))).await
    }

    pub async fn arm_sleep_timer(&self, after: Duration) -> Result<()> {
        self.run(Op::ArmSleepTimer(after)).await
    }

    pub async fn disarm_sleep_timer(&self) -> Result<()> {
        self.run(Op::DisarmSleepTimer).await
    }

    /// Stop playback and end the worker. Later calls fail with
    /// `EngineUnavailable`.
    pub async fn shutdown(&self) -> Result<()> {
        self.run(Op::Shutdown).await
    }
}
