// Playback coordinator - composition root and the one facade the UI talks to
// Builds queues from the library, reports listens, persists settings and the
// queue snapshot, and turns every internal error into a user-facing one

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{AudioBackend, EngineConfig, PlaybackEngine, TrackTransition, TransitionHook};
use crate::error::{EngineError, Result, UserFacingError};
use crate::library::LibraryService;
use crate::model::settings::validate_sleep_minutes;
use crate::model::{MediaItem, PlaybackSettings, QueueSnapshot, Song};
use crate::scanner::{scan_into_library, MetadataScanner, ScanOptions, ScanProgress, ScanReport};
use crate::session::{BridgeConfig, BridgeRequest, MediaSession, MediaSessionBridge, SessionSignal};
use crate::store::PersistentStore;

pub type UserResult<T> = std::result::Result<T, UserFacingError>;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub engine: EngineConfig,
    pub bridge: BridgeConfig,
    pub scan: ScanOptions,
    pub music_directories: Vec<PathBuf>,
    /// Scan `music_directories` right after startup.
    pub background_scan: bool,
    pub play_threshold: Duration,
    pub play_fraction: f64,
    pub snapshot_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            bridge: BridgeConfig::default(),
            scan: ScanOptions::default(),
            music_directories: Vec::new(),
            background_scan: false,
            play_threshold: Duration::from_secs(30),
            play_fraction: 0.5,
            snapshot_interval: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for CoordinatorOptions {
    fn from(config: &Config) -> Self {
        Self {
            engine: config.engine_config(),
            bridge: config.bridge_config(),
            scan: config.scan_options(),
            music_directories: config.music_directories.clone(),
            background_scan: true,
            play_threshold: Duration::from_secs(config.playback.play_threshold_secs),
            play_fraction: f64::from(config.playback.play_threshold_percent.min(100)) / 100.0,
            snapshot_interval: Duration::from_secs(config.playback.snapshot_interval_secs.max(1)),
        }
    }
}

/// Where "play song S" takes the rest of its queue from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayContext {
    Playlist(String),
    Songs(Vec<String>),
    /// The whole catalog in library order.
    Library,
}

pub struct PlaybackCoordinator {
    library: LibraryService,
    engine: PlaybackEngine,
    bridge: MediaSessionBridge,
    options: CoordinatorOptions,
    quick_start: Vec<Song>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Log the detailed error, hand back the short one.
fn surface<T>(action: &str, result: Result<T>) -> UserResult<T> {
    result.map_err(|e| {
        error!("{} failed: {}", action, e);
        e.user_facing()
    })
}

async fn on_blocking_pool<T, F>(library: &LibraryService, f: F) -> Result<T>
where
    F: FnOnce(&LibraryService) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let library = library.clone();
    tokio::task::spawn_blocking(move || f(&library))
        .await
        .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn playable(songs: Vec<Song>) -> Vec<MediaItem> {
    songs.iter().filter(|s| !s.missing).map(MediaItem::from).collect()
}

impl PlaybackCoordinator {
    /// Bring the core up in dependency order: store, library, engine,
    /// media session. The previous queue is restored before this returns;
    /// scanning continues in the background.
    pub async fn start<FB, B, FS>(
        store: PersistentStore,
        options: CoordinatorOptions,
        make_backend: FB,
        make_session: FS,
    ) -> Result<Self>
    where
        FB: FnOnce() -> Result<B> + Send + 'static,
        B: AudioBackend + 'static,
        FS: FnOnce(mpsc::UnboundedSender<SessionSignal>) -> Box<dyn MediaSession> + Send + 'static,
    {
        let library = tokio::task::spawn_blocking(move || LibraryService::open(store))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        let hook = Self::listen_reporter(&library, options.play_threshold, options.play_fraction);
        let engine = PlaybackEngine::spawn(options.engine.clone(), make_backend, Some(hook)).await?;

        let settings = on_blocking_pool(&library, |lib| lib.load_settings()).await?;
        if let Err(e) = engine.apply_settings(settings.clone()).await {
            // Stored settings predate a bounds change; fall back rather than refuse to start
            warn!("Stored settings rejected ({}); using defaults", e);
            engine.apply_settings(PlaybackSettings::default()).await?;
        }

        let (bridge, requests) = MediaSessionBridge::start(engine.clone(), options.bridge, make_session)?;

        let quick_start = on_blocking_pool(&library, |lib| lib.quick_start_songs()).await?;

        let coordinator = Self {
            library,
            engine,
            bridge,
            options,
            quick_start,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };

        if settings.resume_after_reboot {
            if let Err(e) = coordinator.restore_snapshot().await {
                warn!("Could not restore previous queue: {}", e);
            }
        }

        coordinator.spawn_background(requests);
        info!("Playback coordinator ready ({} quick-start songs)", coordinator.quick_start.len());
        Ok(coordinator)
    }

    /// Hook awaited by the engine on every transition; the listen is stored
    /// before the next item is announced.
    fn listen_reporter(library: &LibraryService, threshold: Duration, fraction: f64) -> TransitionHook {
        let library = library.clone();
        Arc::new(move |transition: TrackTransition| {
            let library = library.clone();
            async move {
                let finished = transition.finished;
                if !finished.reached(threshold, fraction) {
                    debug!(
                        "Not counting {} ({:?} of {:?})",
                        finished.item.song_id, finished.listened, finished.duration
                    );
                    return;
                }
                let id = finished.item.song_id.clone();
                if let Err(e) = on_blocking_pool(&library, move |lib| lib.record_play(&id)).await {
                    warn!("Failed to record play of {}: {}", finished.item.song_id, e);
                }
            }
            .boxed()
        })
    }

    async fn restore_snapshot(&self) -> Result<()> {
        let Some(snapshot) = on_blocking_pool(&self.library, |lib| lib.load_queue_snapshot()).await? else {
            return Ok(());
        };
        let ids = snapshot.song_ids();
        let songs = on_blocking_pool(&self.library, move |lib| lib.get_songs_by_ids(&ids)).await?;
        let items = playable(songs);
        if items.is_empty() {
            return Ok(());
        }

        // Songs deleted since the snapshot shift the index
        let wanted = snapshot
            .current_index
            .and_then(|i| snapshot.items.get(i))
            .map(|q| q.song_id.clone());
        let (index, position) = match wanted.and_then(|id| items.iter().position(|i| i.song_id == id)) {
            Some(index) => (index, snapshot.position()),
            None => (0, Duration::ZERO),
        };

        info!("Restoring queue of {} items at {} ({:?})", items.len(), index, position);
        self.engine.restore(items, index, position).await
    }

    fn spawn_background(&self, mut requests: mpsc::UnboundedReceiver<BridgeRequest>) {
        let mut tasks = Vec::new();

        tasks.push(self.library.spawn_most_played_worker(self.cancel.child_token()));

        let library = self.library.clone();
        let engine = self.engine.clone();
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                match request {
                    BridgeRequest::ToggleLike { song_id } => {
                        let id = song_id.clone();
                        if let Err(e) = on_blocking_pool(&library, move |lib| lib.toggle_like(&id)).await {
                            warn!("Like from media session failed for {}: {}", song_id, e);
                        }
                    }
                    BridgeRequest::SetSpeed { speed } => {
                        let result = async {
                            let mut settings = on_blocking_pool(&library, |lib| lib.load_settings()).await?;
                            settings.playback_speed = speed;
                            store_and_apply(&library, &engine, settings).await
                        }
                        .await;
                        if let Err(e) = result {
                            warn!("Speed {} from media session refused: {}", speed, e);
                        }
                    }
                }
            }
        }));

        tasks.push(tokio::spawn(persist_snapshots(
            self.engine.clone(),
            self.library.clone(),
            self.options.snapshot_interval,
            self.cancel.child_token(),
        )));

        if self.options.background_scan && !self.options.music_directories.is_empty() {
            let scanner = MetadataScanner::new(self.options.scan.clone());
            let library = self.library.clone();
            let roots = self.options.music_directories.clone();
            let cancel = self.cancel.child_token();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = scan_into_library(scanner, library, roots, cancel, None).await {
                    warn!("Background scan failed: {}", e);
                }
            }));
        }

        let mut guard = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        guard.extend(tasks);
    }

    // ---- accessors -------------------------------------------------------

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    pub fn library(&self) -> &LibraryService {
        &self.library
    }

    pub fn bridge(&self) -> &MediaSessionBridge {
        &self.bridge
    }

    /// Recently added songs, available before the full catalog loads.
    pub fn quick_start(&self) -> &[Song] {
        &self.quick_start
    }

    // ---- intents ---------------------------------------------------------

    pub async fn play_playlist(&self, playlist_id: &str) -> UserResult<()> {
        surface("play playlist", self.try_play_playlist(playlist_id).await)
    }

    async fn try_play_playlist(&self, playlist_id: &str) -> Result<()> {
        let items = self.context_items(&PlayContext::Playlist(playlist_id.to_string())).await?;
        if items.is_empty() {
            return Err(EngineError::invalid(format!("playlist {} has nothing playable", playlist_id)));
        }
        self.engine.set_queue(items, 0, true).await
    }

    /// The chosen song first, then the rest of the context after it, then
    /// what came before it. Clears shuffle.
    pub async fn play_song_in_context(&self, song_id: &str, context: PlayContext) -> UserResult<()> {
        surface("play song", self.try_play_song_in_context(song_id, context).await)
    }

    async fn try_play_song_in_context(&self, song_id: &str, context: PlayContext) -> Result<()> {
        let items = self.context_items(&context).await?;
        let index = items
            .iter()
            .position(|i| i.song_id == song_id)
            .ok_or_else(|| EngineError::not_found(format!("song {} in {:?}", song_id, context)))?;
        self.engine.play_from(items, index).await?;
        self.remember_shuffle(false).await
    }

    pub async fn shuffle_playlist(&self, playlist_id: &str) -> UserResult<()> {
        surface("shuffle playlist", self.try_shuffle_playlist(playlist_id).await)
    }

    async fn try_shuffle_playlist(&self, playlist_id: &str) -> Result<()> {
        let items = self.context_items(&PlayContext::Playlist(playlist_id.to_string())).await?;
        if items.is_empty() {
            return Err(EngineError::invalid(format!("playlist {} has nothing playable", playlist_id)));
        }
        self.engine.play_shuffled(items).await?;
        self.remember_shuffle(true).await
    }

    pub async fn enqueue(&self, song_id: &str) -> UserResult<()> {
        let result = async {
            let item = self.playable_item(song_id).await?;
            self.engine.enqueue(item).await
        }
        .await;
        surface("enqueue", result)
    }

    pub async fn play_next(&self, song_id: &str) -> UserResult<()> {
        let result = async {
            let item = self.playable_item(song_id).await?;
            self.engine.insert_next(item).await
        }
        .await;
        surface("play next", result)
    }

    /// Drop the song from the live queue first, then from the library.
    pub async fn delete_song(&self, song_id: &str) -> UserResult<bool> {
        let result = async {
            let dequeued = self.engine.remove_song(song_id).await?;
            if dequeued > 0 {
                debug!("Removed {} queue entries for deleted song {}", dequeued, song_id);
            }
            let id = song_id.to_string();
            on_blocking_pool(&self.library, move |lib| lib.delete_song(&id)).await
        }
        .await;
        surface("delete song", result)
    }

    pub async fn toggle_like(&self, song_id: &str) -> UserResult<bool> {
        let id = song_id.to_string();
        surface(
            "toggle like",
            on_blocking_pool(&self.library, move |lib| lib.toggle_like(&id)).await,
        )
    }

    /// Validate, persist, then push into the engine. Nothing changes when
    /// any value is out of range.
    pub async fn update_settings(&self, settings: PlaybackSettings) -> UserResult<()> {
        surface(
            "update settings",
            store_and_apply(&self.library, &self.engine, settings).await,
        )
    }

    pub async fn settings(&self) -> UserResult<PlaybackSettings> {
        surface(
            "load settings",
            on_blocking_pool(&self.library, |lib| lib.load_settings()).await,
        )
    }

    /// `None` disarms. The timer itself is never persisted.
    pub async fn set_sleep_timer(&self, minutes: Option<u32>) -> UserResult<()> {
        let result = async {
            match minutes {
                Some(minutes) => {
                    validate_sleep_minutes(minutes)?;
                    self.engine
                        .arm_sleep_timer(Duration::from_secs(u64::from(minutes) * 60))
                        .await?;
                    self.update_stored_settings(move |s| {
                        s.sleep_timer_enabled = true;
                        s.sleep_timer_duration = minutes;
                    })
                    .await
                }
                None => {
                    self.engine.disarm_sleep_timer().await?;
                    self.update_stored_settings(|s| s.sleep_timer_enabled = false).await
                }
            }
        }
        .await;
        surface("sleep timer", result)
    }

    /// Scan now, reporting progress on `progress`.
    pub async fn rescan(&self, progress: Option<mpsc::Sender<ScanProgress>>) -> UserResult<ScanReport> {
        let scanner = MetadataScanner::new(self.options.scan.clone());
        surface(
            "rescan",
            scan_into_library(
                scanner,
                self.library.clone(),
                self.options.music_directories.clone(),
                self.cancel.child_token(),
                progress,
            )
            .await,
        )
    }

    /// Persist the queue, stop every worker and close the store.
    pub async fn shutdown(&self) -> UserResult<()> {
        let result = async {
            save_snapshot(&self.engine, &self.library).await?;
            self.cancel.cancel();
            self.bridge.shutdown();
            let tasks: Vec<JoinHandle<()>> = {
                let mut guard = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
                guard.drain(..).collect()
            };
            for task in tasks {
                let _ = task.await;
            }
            self.engine.shutdown().await?;
            on_blocking_pool(&self.library, |lib| lib.store().close()).await?;
            info!("Playback coordinator shut down");
            Ok(())
        }
        .await;
        surface("shutdown", result)
    }

    // ---- helpers ---------------------------------------------------------

    async fn context_items(&self, context: &PlayContext) -> Result<Vec<MediaItem>> {
        let songs = match context.clone() {
            PlayContext::Playlist(id) => on_blocking_pool(&self.library, move |lib| lib.playlist_songs(&id)).await?,
            PlayContext::Songs(ids) => on_blocking_pool(&self.library, move |lib| lib.get_songs_by_ids(&ids)).await?,
            PlayContext::Library => on_blocking_pool(&self.library, |lib| lib.load_all_songs()).await?,
        };
        Ok(playable(songs))
    }

    async fn playable_item(&self, song_id: &str) -> Result<MediaItem> {
        let id = song_id.to_string();
        let song = on_blocking_pool(&self.library, move |lib| lib.get_song(&id))
            .await?
            .ok_or_else(|| EngineError::not_found(format!("song {}", song_id)))?;
        if song.missing {
            return Err(EngineError::LoadError {
                item_id: song.id,
                reason: "file is missing".into(),
            });
        }
        Ok(MediaItem::from(&song))
    }

    async fn remember_shuffle(&self, enabled: bool) -> Result<()> {
        self.update_stored_settings(move |s| s.shuffle_enabled = enabled).await
    }

    async fn update_stored_settings(&self, change: impl FnOnce(&mut PlaybackSettings) + Send + 'static) -> Result<()> {
        on_blocking_pool(&self.library, move |lib| {
            let mut settings = lib.load_settings()?;
            change(&mut settings);
            lib.save_settings(&settings)
        })
        .await
    }
}

impl Drop for PlaybackCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Validate, persist, then push into the engine.
async fn store_and_apply(library: &LibraryService, engine: &PlaybackEngine, settings: PlaybackSettings) -> Result<()> {
    settings.validate()?;
    let stored = settings.clone();
    on_blocking_pool(library, move |lib| lib.save_settings(&stored)).await?;
    engine.apply_settings(settings).await
}

async fn save_snapshot(engine: &PlaybackEngine, library: &LibraryService) -> Result<()> {
    let snapshot: QueueSnapshot = engine.snapshot().await?;
    on_blocking_pool(library, move |lib| {
        if snapshot.items.is_empty() {
            lib.clear_queue_snapshot()
        } else {
            lib.save_queue_snapshot(&snapshot)
        }
    })
    .await
}

/// Save on pause/stop and on queue changes, and periodically while playing.
async fn persist_snapshots(
    engine: PlaybackEngine,
    library: LibraryService,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut status = engine.playback_state();
    let mut queue = engine.queue_view();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut was_playing = status.borrow_and_update().playing;
    queue.borrow_and_update();

    loop {
        let save = tokio::select! {
            _ = cancel.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let playing = status.borrow_and_update().playing;
                let stopped_playing = was_playing && !playing;
                was_playing = playing;
                stopped_playing
            }
            changed = queue.changed() => {
                if changed.is_err() {
                    break;
                }
                queue.borrow_and_update();
                true
            }
            _ = ticker.tick() => was_playing,
        };
        if save {
            if let Err(e) = save_snapshot(&engine, &library).await {
                match e {
                    EngineError::EngineUnavailable => break,
                    other => warn!("Failed to persist queue snapshot: {}", other),
                }
            }
        }
    }
    debug!("Snapshot persister stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::mock::{MockBackend, MockHandle};
    use crate::engine::tests::{test_config, wait_for};
    use crate::engine::EngineState;
    use crate::model::{song_id_for_path, SystemKind};
    use crate::session::tests::RecordingSession;
    use crate::session::{FocusChange, MediaButton, NullSession};
    use std::path::Path;

    fn song(name: &str) -> Song {
        let mut song = Song::new(PathBuf::from(format!("/music/{}.mp3", name)), name.to_uppercase());
        song.duration = 60_000;
        song
    }

    fn id(name: &str) -> String {
        song_id_for_path(Path::new(&format!("/music/{}.mp3", name)))
    }

    fn options() -> CoordinatorOptions {
        CoordinatorOptions {
            engine: test_config(),
            snapshot_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    /// Songs a..e and a user playlist "P" holding them in order.
    fn seed(lib: &LibraryService) -> String {
        lib.upsert_songs(["a", "b", "c", "d", "e"].iter().map(|n| song(n)).collect())
            .unwrap();
        let playlist = lib.create_playlist("P", None).unwrap();
        for name in ["a", "b", "c", "d", "e"] {
            lib.add_song_to_playlist(&playlist.id, &id(name)).unwrap();
        }
        playlist.id
    }

    async fn start(store: PersistentStore) -> (PlaybackCoordinator, MockHandle, RecordingSession) {
        let (backend, handle) = MockBackend::new();
        let session = RecordingSession::default();
        let recorder = session.clone();
        let coordinator = PlaybackCoordinator::start(store, options(), move || Ok(backend), move |_| {
            Box::new(session)
        })
        .await
        .unwrap();
        (coordinator, handle, recorder)
    }

    fn current_id(coordinator: &PlaybackCoordinator) -> Option<String> {
        coordinator.engine().current_item().borrow().as_ref().map(|i| i.song_id.clone())
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn playing_a_song_in_context_rotates_the_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path().join("lib.db")).unwrap();
        let (coordinator, handle, session) = start(store).await;
        let playlist = seed(coordinator.library());

        coordinator
            .play_song_in_context(&id("c"), PlayContext::Playlist(playlist))
            .await
            .unwrap();

        let view = coordinator.engine().queue_view().borrow().clone();
        let order: Vec<String> = view.items.iter().map(|i| i.title.clone()).collect();
        assert_eq!(order, vec!["C", "D", "E", "A", "B"]);
        assert_eq!(view.current_index, Some(0));
        assert_eq!(coordinator.engine().status().state, EngineState::Playing);
        eventually("title", || session.last_title().as_deref() == Some("C")).await;

        handle.set_position(Duration::from_secs(45));
        handle.finish();
        let mut current = coordinator.engine().current_item();
        wait_for(&mut current, |c| c.as_ref().map(|i| i.title.as_str()) == Some("D")).await;

        // The listen was stored before D was announced
        let c = coordinator.library().get_song(&id("c")).unwrap().unwrap();
        assert_eq!(c.play_count, 1);
    }

    #[tokio::test]
    async fn shuffle_visits_each_song_once_then_stops() {
        let store = PersistentStore::open_in_memory().unwrap();
        let (coordinator, _handle, _session) = start(store).await;
        let playlist = seed(coordinator.library());

        coordinator.shuffle_playlist(&playlist).await.unwrap();
        let mut seen = vec![current_id(&coordinator).unwrap()];
        for _ in 0..4 {
            coordinator.engine().skip_to_next().await.unwrap();
            seen.push(current_id(&coordinator).unwrap());
        }
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 5);

        coordinator.engine().skip_to_next().await.unwrap();
        assert_eq!(coordinator.engine().status().state, EngineState::Stopped);
        assert!(coordinator.settings().await.unwrap().shuffle_enabled);
    }

    #[tokio::test]
    async fn deleting_a_played_song_removes_every_trace() {
        let store = PersistentStore::open_in_memory().unwrap();
        let (coordinator, handle, _session) = start(store).await;
        let playlist = seed(coordinator.library());
        let liked_before = coordinator.library().liked_songs().unwrap();

        coordinator
            .play_song_in_context(&id("a"), PlayContext::Playlist(playlist.clone()))
            .await
            .unwrap();
        handle.set_position(Duration::from_secs(40));
        let mut status = coordinator.engine().playback_state();
        wait_for(&mut status, |s| s.position == Duration::from_secs(40)).await;
        coordinator.engine().skip_to_next().await.unwrap();

        let recent = coordinator.library().system_playlist(SystemKind::RecentlyPlayed).unwrap();
        assert!(recent.contains(&id("a")));

        assert!(coordinator.delete_song(&id("a")).await.unwrap());
        let lib = coordinator.library();
        assert!(lib.get_song(&id("a")).unwrap().is_none());
        assert!(!lib.get_playlist(&playlist).unwrap().unwrap().contains(&id("a")));
        assert!(!lib.system_playlist(SystemKind::RecentlyPlayed).unwrap().contains(&id("a")));
        assert_eq!(lib.liked_songs().unwrap(), liked_before);
        let queue = coordinator.engine().queue_view().borrow().clone();
        assert!(queue.items.iter().all(|i| i.song_id != id("a")));
    }

    #[tokio::test]
    async fn short_listens_are_not_counted() {
        let store = PersistentStore::open_in_memory().unwrap();
        let (coordinator, handle, _session) = start(store).await;
        let playlist = seed(coordinator.library());

        coordinator.play_playlist(&playlist).await.unwrap();
        handle.set_position(Duration::from_secs(10));
        let mut status = coordinator.engine().playback_state();
        wait_for(&mut status, |s| s.position == Duration::from_secs(10)).await;
        coordinator.engine().skip_to_next().await.unwrap();

        assert_eq!(coordinator.library().get_song(&id("a")).unwrap().unwrap().play_count, 0);
    }

    #[tokio::test]
    async fn queue_survives_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("lib.db");
        {
            let (coordinator, _handle, _session) = start(PersistentStore::open(&db).unwrap()).await;
            seed(coordinator.library());
            let songs = coordinator
                .library()
                .get_songs_by_ids(&[id("a"), id("b"), id("c")])
                .unwrap();
            let items: Vec<MediaItem> = songs.iter().map(MediaItem::from).collect();
            coordinator.engine().set_queue(items, 1, true).await.unwrap();
            coordinator.engine().seek_to(Duration::from_secs(42)).await.unwrap();
            coordinator.engine().pause().await.unwrap();

            let library = coordinator.library().clone();
            eventually("snapshot", || {
                library
                    .load_queue_snapshot()
                    .unwrap()
                    .is_some_and(|s| s.current_index == Some(1) && s.position() == Duration::from_secs(42))
            })
            .await;
            // No shutdown: the process just dies here
        }

        let (coordinator, _handle, _session) = start(PersistentStore::open(&db).unwrap()).await;
        let status = coordinator.engine().status();
        assert_eq!(status.state, EngineState::Paused);
        assert_eq!(current_id(&coordinator), Some(id("b")));
        let drift = status.position.as_millis().abs_diff(42_000);
        assert!(drift <= 250, "position drifted {} ms", drift);
    }

    #[tokio::test]
    async fn invalid_settings_change_nothing() {
        let store = PersistentStore::open_in_memory().unwrap();
        let (coordinator, handle, _session) = start(store).await;

        let mut settings = coordinator.settings().await.unwrap();
        settings.playback_speed = 5.0;
        assert_eq!(
            coordinator.update_settings(settings).await,
            Err(UserFacingError::InvalidRequest)
        );
        assert_eq!(coordinator.settings().await.unwrap().playback_speed, 1.0);
        assert_eq!(handle.state().speed, 1.0);

        let mut settings = coordinator.settings().await.unwrap();
        settings.playback_speed = 1.5;
        coordinator.update_settings(settings).await.unwrap();
        assert_eq!(handle.state().speed, 1.5);
        assert_eq!(coordinator.settings().await.unwrap().playback_speed, 1.5);

        assert_eq!(coordinator.set_sleep_timer(Some(0)).await, Err(UserFacingError::InvalidRequest));
    }

    #[tokio::test]
    async fn speed_buttons_are_validated_and_persisted() {
        let store = PersistentStore::open_in_memory().unwrap();
        let (coordinator, handle, _session) = start(store).await;

        coordinator.bridge().send(SessionSignal::Button(MediaButton::SetSpeed(1.25)));
        let library = coordinator.library().clone();
        eventually("stored speed", || library.load_settings().unwrap().playback_speed == 1.25).await;
        eventually("engine speed", || handle.state().speed == 1.25).await;

        coordinator.bridge().send(SessionSignal::Button(MediaButton::SetSpeed(9.0)));
        coordinator.bridge().send(SessionSignal::Button(MediaButton::SetSpeed(0.75)));
        eventually("second speed", || library.load_settings().unwrap().playback_speed == 0.75).await;
        assert_eq!(handle.state().speed, 0.75);
    }

    #[tokio::test]
    async fn focus_loss_pauses_through_the_bridge() {
        let store = PersistentStore::open_in_memory().unwrap();
        let (coordinator, _handle, _session) = start(store).await;
        let playlist = seed(coordinator.library());
        coordinator.play_playlist(&playlist).await.unwrap();

        let mut status = coordinator.engine().playback_state();
        coordinator.bridge().send(SessionSignal::Focus(FocusChange::LostTransient));
        wait_for(&mut status, |s| !s.playing).await;
        coordinator.bridge().send(SessionSignal::Focus(FocusChange::Gained));
        wait_for(&mut status, |s| s.playing).await;
    }

    #[tokio::test]
    async fn unknown_songs_surface_as_invalid_requests() {
        let store = PersistentStore::open_in_memory().unwrap();
        let (backend, _handle) = MockBackend::new();
        let coordinator = PlaybackCoordinator::start(store, options(), move || Ok(backend), |_| {
            Box::new(NullSession)
        })
        .await
        .unwrap();

        assert_eq!(coordinator.enqueue("nope").await, Err(UserFacingError::InvalidRequest));
        assert_eq!(
            coordinator
                .play_song_in_context("nope", PlayContext::Library)
                .await,
            Err(UserFacingError::InvalidRequest)
        );
        coordinator.shutdown().await.unwrap();
    }
}
