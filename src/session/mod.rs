// Media session bridge
// Mirrors engine state into the OS media session and turns media buttons,
// audio-focus changes and route changes back into engine calls

#[cfg(feature = "media-controls")]
pub mod platform;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{EngineState, PlaybackEngine, PlaybackStatus};
use crate::error::{EngineError, Result};
use crate::model::MediaItem;

/// Published position may drift this far from the extrapolated one before
/// the session is told about it again.
const POSITION_DRIFT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub artwork: Option<PathBuf>,
    pub duration: Duration,
}

impl From<&MediaItem> for SessionMetadata {
    fn from(item: &MediaItem) -> Self {
        Self {
            title: item.title.clone(),
            artist: item.artist.clone(),
            album: item.album.clone(),
            artwork: item.artwork.clone(),
            duration: item.duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionPlayback {
    pub playing: bool,
    /// Nothing loaded, or playback ran off the end.
    pub stopped: bool,
    pub position: Duration,
    pub speed: f32,
    pub buffering: bool,
}

impl From<&PlaybackStatus> for SessionPlayback {
    fn from(status: &PlaybackStatus) -> Self {
        Self {
            playing: status.playing,
            stopped: status.current_index.is_none()
                || matches!(status.state, EngineState::Stopped | EngineState::Idle),
            position: status.position,
            speed: status.speed,
            buffering: status.buffering,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Play,
    Pause,
    SkipNext,
    SkipPrevious,
    Stop,
    SeekTo,
    ToggleLike,
    SetSpeed,
}

pub const CAPABILITIES: &[Capability] = &[
    Capability::Play,
    Capability::Pause,
    Capability::SkipNext,
    Capability::SkipPrevious,
    Capability::Stop,
    Capability::SeekTo,
    Capability::ToggleLike,
    Capability::SetSpeed,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// Foreground, cannot be swiped away.
    Ongoing,
    Dismissible,
}

/// Platform media session. Lives on the bridge thread only.
pub trait MediaSession {
    fn set_capabilities(&mut self, capabilities: &[Capability]) -> anyhow::Result<()>;
    /// `None` clears what the OS shows.
    fn set_metadata(&mut self, metadata: Option<&SessionMetadata>) -> anyhow::Result<()>;
    fn set_playback(&mut self, playback: &SessionPlayback) -> anyhow::Result<()>;
    fn set_notification(&mut self, notification: Notification) -> anyhow::Result<()>;
}

/// Session with nowhere to publish. Used when OS controls are unavailable.
#[derive(Debug, Default)]
pub struct NullSession;

impl MediaSession for NullSession {
    fn set_capabilities(&mut self, _capabilities: &[Capability]) -> anyhow::Result<()> {
        Ok(())
    }
    fn set_metadata(&mut self, _metadata: Option<&SessionMetadata>) -> anyhow::Result<()> {
        Ok(())
    }
    fn set_playback(&mut self, _playback: &SessionPlayback) -> anyhow::Result<()> {
        Ok(())
    }
    fn set_notification(&mut self, _notification: Notification) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MediaButton {
    Play,
    Pause,
    Toggle,
    Next,
    Previous,
    Stop,
    SeekTo(Duration),
    SeekBy { forward: bool, delta: Duration },
    SetSpeed(f32),
    ToggleLike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusChange {
    Gained,
    /// Phone call, navigation prompt.
    LostTransient,
    LostTransientCanDuck,
    /// Another player took over for good.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionSignal {
    Button(MediaButton),
    Focus(FocusChange),
    HeadsetRemoved,
}

/// Requests the bridge cannot serve from the engine alone.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeRequest {
    ToggleLike { song_id: String },
    /// Settings change; the owner validates and persists it.
    SetSpeed { speed: f32 },
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Volume factor while another app speaks over us. `None` treats a
    /// can-duck loss like a transient one.
    pub duck_factor: Option<f32>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { duck_factor: Some(0.2) }
    }
}

pub struct MediaSessionBridge {
    signals: mpsc::UnboundedSender<SessionSignal>,
    cancel: CancellationToken,
}

impl MediaSessionBridge {
    /// Start the bridge thread. `make_session` runs on that thread and gets
    /// the signal sender so platform callbacks can feed buttons back in.
    pub fn start<F>(
        engine: PlaybackEngine,
        config: BridgeConfig,
        make_session: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<BridgeRequest>)>
    where
        F: FnOnce(mpsc::UnboundedSender<SessionSignal>) -> Box<dyn MediaSession> + Send + 'static,
    {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let session_signals = signals_tx.clone();
        let worker_cancel = cancel.clone();
        std::thread::Builder::new()
            .name("offtune-session".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        warn!("Media session bridge could not start: {}", e);
                        return;
                    }
                };
                let worker = BridgeWorker {
                    session: make_session(session_signals),
                    current: engine.current_item(),
                    status: engine.playback_state(),
                    engine,
                    config,
                    signals: signals_rx,
                    requests: requests_tx,
                    cancel: worker_cancel,
                    focus: FocusMemory::default(),
                    last_playback: None,
                    last_notification: None,
                };
                runtime.block_on(worker.run());
            })
            .map_err(EngineError::Io)?;

        Ok((
            Self {
                signals: signals_tx,
                cancel,
            },
            requests_rx,
        ))
    }

    /// Deliver a button press, focus change or route change.
    pub fn send(&self, signal: SessionSignal) {
        if self.signals.send(signal).is_err() {
            debug!("Media session bridge is gone; dropping {:?}", signal);
        }
    }

    pub fn signals(&self) -> mpsc::UnboundedSender<SessionSignal> {
        self.signals.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MediaSessionBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
struct FocusMemory {
    /// Playing right before a transient loss.
    resume_on_gain: bool,
    ducked: bool,
}

struct BridgeWorker {
    session: Box<dyn MediaSession>,
    engine: PlaybackEngine,
    current: watch::Receiver<Option<MediaItem>>,
    status: watch::Receiver<PlaybackStatus>,
    config: BridgeConfig,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    requests: mpsc::UnboundedSender<BridgeRequest>,
    cancel: CancellationToken,
    focus: FocusMemory,
    last_playback: Option<(SessionPlayback, Instant)>,
    last_notification: Option<Notification>,
}

impl BridgeWorker {
    async fn run(mut self) {
        info!("Media session bridge started");
        if let Err(e) = self.session.set_capabilities(CAPABILITIES) {
            warn!("Failed to advertise media session capabilities: {:#}", e);
        }
        self.publish_metadata();
        self.publish_playback();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = self.current.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.publish_metadata();
                }
                changed = self.status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.publish_playback();
                }
                signal = self.signals.recv() => match signal {
                    Some(signal) => self.handle(signal).await,
                    None => break,
                },
            }
        }

        if let Err(e) = self.session.set_metadata(None) {
            debug!("Failed to clear media session: {:#}", e);
        }
        info!("Media session bridge stopped");
    }

    fn publish_metadata(&mut self) {
        let current = self.current.borrow_and_update().clone();
        let metadata = current.as_ref().map(SessionMetadata::from);
        if let Err(e) = self.session.set_metadata(metadata.as_ref()) {
            warn!("Failed to publish media session metadata: {:#}", e);
        }
    }

    fn publish_playback(&mut self) {
        let playback = SessionPlayback::from(&*self.status.borrow_and_update());

        let changed = match &self.last_playback {
            None => true,
            Some((last, at)) => {
                last.playing != playback.playing
                    || last.stopped != playback.stopped
                    || last.buffering != playback.buffering
                    || last.speed != playback.speed
                    || drifted(last, *at, playback.position)
            }
        };
        if changed {
            match self.session.set_playback(&playback) {
                Ok(()) => self.last_playback = Some((playback, Instant::now())),
                Err(e) => warn!("Failed to publish media session playback: {:#}", e),
            }
        }

        let notification = if playback.playing {
            Notification::Ongoing
        } else {
            Notification::Dismissible
        };
        if self.last_notification != Some(notification) {
            match self.session.set_notification(notification) {
                Ok(()) => self.last_notification = Some(notification),
                Err(e) => warn!("Failed to update playback notification: {:#}", e),
            }
        }
    }

    async fn handle(&mut self, signal: SessionSignal) {
        debug!("Media session signal {:?}", signal);
        let result = match signal {
            SessionSignal::Button(button) => self.press(button).await,
            SessionSignal::Focus(change) => self.focus_changed(change).await,
            SessionSignal::HeadsetRemoved => {
                self.focus.resume_on_gain = false;
                self.engine.pause().await
            }
        };
        if let Err(e) = result {
            warn!("Media session request {:?} failed: {}", signal, e);
        }
    }

    async fn press(&mut self, button: MediaButton) -> Result<()> {
        match button {
            MediaButton::Play => self.engine.play().await,
            MediaButton::Pause => self.engine.pause().await,
            MediaButton::Toggle => self.engine.toggle().await,
            MediaButton::Next => self.engine.skip_to_next().await,
            MediaButton::Previous => self.engine.skip_to_previous().await,
            MediaButton::Stop => self.engine.stop().await,
            MediaButton::SeekTo(position) => self.engine.seek_to(position).await,
            MediaButton::SeekBy { forward, delta } => {
                let position = self.engine.status().position;
                let target = if forward {
                    position.saturating_add(delta)
                } else {
                    position.saturating_sub(delta)
                };
                self.engine.seek_to(target).await
            }
            MediaButton::SetSpeed(speed) => {
                let _ = self.requests.send(BridgeRequest::SetSpeed { speed });
                Ok(())
            }
            MediaButton::ToggleLike => {
                let current = self.current.borrow().clone();
                if let Some(item) = current {
                    let _ = self.requests.send(BridgeRequest::ToggleLike { song_id: item.song_id });
                }
                Ok(())
            }
        }
    }

    async fn focus_changed(&mut self, change: FocusChange) -> Result<()> {
        let playing = self.engine.status().playing;
        match change {
            FocusChange::LostTransient => {
                if playing {
                    self.focus.resume_on_gain = true;
                    self.engine.pause().await?;
                }
            }
            FocusChange::LostTransientCanDuck => match self.config.duck_factor {
                Some(factor) if playing => {
                    self.focus.ducked = true;
                    self.engine.set_duck(Some(factor)).await?;
                }
                None if playing => {
                    self.focus.resume_on_gain = true;
                    self.engine.pause().await?;
                }
                _ => {}
            },
            FocusChange::Gained => {
                if std::mem::take(&mut self.focus.ducked) {
                    self.engine.set_duck(None).await?;
                }
                if std::mem::take(&mut self.focus.resume_on_gain) {
                    self.engine.play().await?;
                }
            }
            FocusChange::Lost => {
                self.focus.resume_on_gain = false;
                if std::mem::take(&mut self.focus.ducked) {
                    self.engine.set_duck(None).await?;
                }
                self.engine.pause().await?;
            }
        }
        Ok(())
    }
}

fn drifted(last: &SessionPlayback, at: Instant, position: Duration) -> bool {
    let expected = if last.playing {
        last.position + at.elapsed().mul_f32(last.speed.max(0.0))
    } else {
        last.position
    };
    let delta = if position > expected {
        position - expected
    } else {
        expected - position
    };
    delta > POSITION_DRIFT
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::queue::tests::items;
    use crate::engine::tests::{spawn_mock, wait_for};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum SessionCall {
        Capabilities(Vec<Capability>),
        Metadata(Option<SessionMetadata>),
        Playback(SessionPlayback),
        Notification(Notification),
    }

    /// Captures every publish call for assertions.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSession {
        pub calls: Arc<Mutex<Vec<SessionCall>>>,
    }

    impl RecordingSession {
        pub fn calls(&self) -> Vec<SessionCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn last_title(&self) -> Option<String> {
            self.calls().into_iter().rev().find_map(|call| match call {
                SessionCall::Metadata(meta) => Some(meta.map(|m| m.title).unwrap_or_default()),
                _ => None,
            })
        }
    }

    impl MediaSession for RecordingSession {
        fn set_capabilities(&mut self, capabilities: &[Capability]) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(SessionCall::Capabilities(capabilities.to_vec()));
            Ok(())
        }
        fn set_metadata(&mut self, metadata: Option<&SessionMetadata>) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(SessionCall::Metadata(metadata.cloned()));
            Ok(())
        }
        fn set_playback(&mut self, playback: &SessionPlayback) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(SessionCall::Playback(*playback));
            Ok(())
        }
        fn set_notification(&mut self, notification: Notification) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(SessionCall::Notification(notification));
            Ok(())
        }
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn transient_loss_resumes_but_permanent_loss_does_not() {
        let (engine, _handle) = spawn_mock(None).await;
        engine.set_queue(items(&["a", "b"]), 0, true).await.unwrap();
        let (bridge, _requests) =
            MediaSessionBridge::start(engine.clone(), BridgeConfig::default(), |_| Box::new(NullSession)).unwrap();
        let mut status = engine.playback_state();

        bridge.send(SessionSignal::Focus(FocusChange::LostTransient));
        wait_for(&mut status, |s| !s.playing).await;
        bridge.send(SessionSignal::Focus(FocusChange::Gained));
        wait_for(&mut status, |s| s.playing).await;

        bridge.send(SessionSignal::Focus(FocusChange::Lost));
        wait_for(&mut status, |s| !s.playing).await;
        bridge.send(SessionSignal::Focus(FocusChange::Gained));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!engine.status().playing);
    }

    #[tokio::test]
    async fn ducking_lowers_and_restores_volume() {
        let (engine, handle) = spawn_mock(None).await;
        engine.set_volume(1.0).await.unwrap();
        engine.set_queue(items(&["a"]), 0, true).await.unwrap();
        let (bridge, _requests) =
            MediaSessionBridge::start(engine.clone(), BridgeConfig::default(), |_| Box::new(NullSession)).unwrap();

        bridge.send(SessionSignal::Focus(FocusChange::LostTransientCanDuck));
        eventually("duck", || (handle.state().volume - 0.2).abs() < 1e-6).await;
        assert!(engine.status().playing);

        bridge.send(SessionSignal::Focus(FocusChange::Gained));
        eventually("unduck", || (handle.state().volume - 1.0).abs() < 1e-6).await;
    }

    #[tokio::test]
    async fn headset_removal_pauses() {
        let (engine, _handle) = spawn_mock(None).await;
        engine.set_queue(items(&["a"]), 0, true).await.unwrap();
        let (bridge, _requests) =
            MediaSessionBridge::start(engine.clone(), BridgeConfig::default(), |_| Box::new(NullSession)).unwrap();
        let mut status = engine.playback_state();

        bridge.send(SessionSignal::HeadsetRemoved);
        wait_for(&mut status, |s| !s.playing).await;
    }

    #[tokio::test]
    async fn buttons_drive_the_engine() {
        let (engine, handle) = spawn_mock(None).await;
        engine.set_queue(items(&["a", "b", "c"]), 0, false).await.unwrap();
        let (bridge, mut requests) =
            MediaSessionBridge::start(engine.clone(), BridgeConfig::default(), |_| Box::new(NullSession)).unwrap();
        let mut status = engine.playback_state();

        bridge.send(SessionSignal::Button(MediaButton::Toggle));
        wait_for(&mut status, |s| s.playing).await;
        bridge.send(SessionSignal::Button(MediaButton::Next));
        wait_for(&mut status, |s| s.current_index == Some(1)).await;

        handle.set_position(Duration::from_secs(10));
        wait_for(&mut status, |s| s.position == Duration::from_secs(10)).await;
        bridge.send(SessionSignal::Button(MediaButton::SeekBy {
            forward: true,
            delta: Duration::from_secs(15),
        }));
        eventually("seek", || handle.state().position == Duration::from_secs(25)).await;

        bridge.send(SessionSignal::Button(MediaButton::ToggleLike));
        let request = tokio::time::timeout(Duration::from_secs(2), requests.recv()).await.unwrap();
        assert_eq!(request, Some(BridgeRequest::ToggleLike { song_id: "b".into() }));

        bridge.send(SessionSignal::Button(MediaButton::SetSpeed(1.25)));
        let request = tokio::time::timeout(Duration::from_secs(2), requests.recv()).await.unwrap();
        assert_eq!(request, Some(BridgeRequest::SetSpeed { speed: 1.25 }));
        assert_eq!(handle.state().speed, 1.0);
    }

    #[tokio::test]
    async fn publishes_metadata_and_notification_mode() {
        let (engine, _handle) = spawn_mock(None).await;
        let session = RecordingSession::default();
        let recorder = session.clone();
        let (_bridge, _requests) =
            MediaSessionBridge::start(engine.clone(), BridgeConfig::default(), move |_| Box::new(session)).unwrap();

        eventually("capabilities", || {
            recorder.calls().contains(&SessionCall::Capabilities(CAPABILITIES.to_vec()))
        })
        .await;

        engine.set_queue(items(&["a", "b"]), 1, true).await.unwrap();
        eventually("title", || recorder.last_title().as_deref() == Some("b")).await;
        eventually("ongoing", || {
            recorder.calls().contains(&SessionCall::Notification(Notification::Ongoing))
        })
        .await;

        engine.stop().await.unwrap();
        eventually("dismissible", || {
            let calls = recorder.calls();
            let last = calls.iter().rev().find(|c| matches!(c, SessionCall::Notification(_)));
            last == Some(&SessionCall::Notification(Notification::Dismissible))
        })
        .await;
    }
}
