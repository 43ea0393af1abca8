// Library service - typed facade over the store
// Owns the caches, playlist rules and the derived system playlists

mod cache;
pub mod system;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::{
    normalize_playlist_name, PlaybackSettings, Playlist, QueueSnapshot, Song, SystemKind,
};
use crate::store::{PersistentStore, Table};
use cache::LibraryCache;

pub const RECENTLY_PLAYED_CAP: usize = 100;
pub const MOST_PLAYED_CAP: usize = 50;
pub const QUICK_START_SIZE: usize = 20;

const QUICK_START_KEY: &str = "quickStart";

/// Partial update for [`LibraryService::update_playlist`]. Outer `None`
/// leaves a field alone; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct PlaylistUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub cover_art_path: Option<Option<String>>,
    pub color_theme: Option<Option<String>>,
}

struct Inner {
    store: PersistentStore,
    cache: Mutex<LibraryCache>,
    // serializes read-modify-write sequences spanning several records
    writer: Mutex<()>,
    most_played: Notify,
}

#[derive(Clone)]
pub struct LibraryService {
    inner: Arc<Inner>,
}

fn relock<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LibraryService {
    /// Wrap an opened store, bootstrap system playlists and repair any
    /// dangling references left by an interrupted write.
    pub fn open(store: PersistentStore) -> Result<Self> {
        let library = Self {
            inner: Arc::new(Inner {
                store,
                cache: Mutex::new(LibraryCache::default()),
                writer: Mutex::new(()),
                most_played: Notify::new(),
            }),
        };
        library.ensure_system_playlists()?;
        library.sweep_integrity()?;
        info!("Library ready");
        Ok(library)
    }

    pub fn store(&self) -> &PersistentStore {
        &self.inner.store
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        relock(self.inner.writer.lock())
    }

    fn cache(&self) -> MutexGuard<'_, LibraryCache> {
        relock(self.inner.cache.lock())
    }

    fn with_songs<T>(&self, f: impl FnOnce(&HashMap<String, Song>) -> T) -> Result<T> {
        loop {
            let seen = {
                let cache = self.cache();
                if let Some(songs) = cache.songs() {
                    return Ok(f(songs));
                }
                cache.generation()
            };
            // load outside the lock; a write landing meanwhile forces a reload
            let loaded = self.inner.store.iterate::<Song>()?;
            let mut cache = self.cache();
            if cache.fill_songs(loaded, seen) {
                return match cache.songs() {
                    Some(songs) => Ok(f(songs)),
                    None => Err(EngineError::StoreUnavailable("song cache unavailable".into())),
                };
            }
            debug!("Song table changed during cold load; reloading");
        }
    }

    fn with_playlists<T>(&self, f: impl FnOnce(&HashMap<String, Playlist>) -> T) -> Result<T> {
        loop {
            let seen = {
                let cache = self.cache();
                if let Some(playlists) = cache.playlists() {
                    return Ok(f(playlists));
                }
                cache.generation()
            };
            let loaded = self.inner.store.iterate::<Playlist>()?;
            let mut cache = self.cache();
            if cache.fill_playlists(loaded, seen) {
                return match cache.playlists() {
                    Some(playlists) => Ok(f(playlists)),
                    None => Err(EngineError::StoreUnavailable("playlist cache unavailable".into())),
                };
            }
            debug!("Playlist table changed during cold load; reloading");
        }
    }

    fn commit_songs(&self, songs: &[Song]) -> Result<()> {
        match songs {
            [] => return Ok(()),
            [one] => self.inner.store.put(one)?,
            many => self.inner.store.put_batch(many)?,
        }
        self.cache().apply_songs(songs);
        Ok(())
    }

    fn commit_playlists(&self, playlists: &[Playlist]) -> Result<()> {
        match playlists {
            [] => return Ok(()),
            [one] => self.inner.store.put(one)?,
            many => self.inner.store.put_batch(many)?,
        }
        self.cache().apply_playlists(playlists);
        Ok(())
    }

    // ---- songs ----------------------------------------------------------

    /// Every song, ordered by artist, album, track number, title.
    pub fn load_all_songs(&self) -> Result<Vec<Song>> {
        let mut songs = self.with_songs(|map| map.values().cloned().collect::<Vec<_>>())?;
        songs.sort_by(|a, b| {
            a.artist
                .to_lowercase()
                .cmp(&b.artist.to_lowercase())
                .then_with(|| a.album.to_lowercase().cmp(&b.album.to_lowercase()))
                .then_with(|| a.track_number.cmp(&b.track_number))
                .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(songs)
    }

    pub fn get_song(&self, id: &str) -> Result<Option<Song>> {
        self.with_songs(|map| map.get(id).cloned())
    }

    /// Input order preserved, unknown ids dropped.
    pub fn get_songs_by_ids(&self, ids: &[String]) -> Result<Vec<Song>> {
        self.with_songs(|map| ids.iter().filter_map(|id| map.get(id).cloned()).collect())
    }

    fn require_song(&self, id: &str) -> Result<Song> {
        self.get_song(id)?
            .ok_or_else(|| EngineError::not_found(format!("song {}", id)))
    }

    pub fn upsert_song(&self, song: Song) -> Result<()> {
        self.upsert_songs(vec![song])
    }

    pub fn upsert_songs(&self, songs: Vec<Song>) -> Result<()> {
        if songs.is_empty() {
            return Ok(());
        }
        let _writer = self.writer();
        self.commit_songs(&songs)?;
        self.refresh_quick_start(&songs)?;
        debug!("Upserted {} songs", songs.len());
        Ok(())
    }

    /// Removes the song and every playlist reference to it. Playlists are
    /// rewritten first so a crash in between never leaves a dangling id.
    pub fn delete_song(&self, id: &str) -> Result<bool> {
        let _writer = self.writer();
        let touched: Vec<Playlist> =
            self.with_playlists(|map| map.values().filter_map(|p| p.with_song_removed(id)).collect())?;
        self.commit_playlists(&touched)?;

        let removed = self.inner.store.delete::<Song>(id)?;
        self.cache().remove_song(id);
        if removed {
            self.drop_from_quick_start(id)?;
            self.schedule_most_played_rebuild();
            info!("Deleted song {} (removed from {} playlists)", id, touched.len());
        }
        Ok(removed)
    }

    /// Flip the like flag and mirror it into the Liked playlist.
    pub fn toggle_like(&self, id: &str) -> Result<bool> {
        let _writer = self.writer();
        let song = self.require_song(id)?;
        let updated = Song {
            is_liked: !song.is_liked,
            ..song
        };
        let liked = self.system_playlist(SystemKind::Liked)?;
        let liked = if updated.is_liked {
            Some(liked.with_song_at_front(id, usize::MAX))
        } else {
            liked.with_song_removed(id)
        };

        self.commit_songs(std::slice::from_ref(&updated))?;
        if let Some(liked) = liked {
            self.commit_playlists(&[liked])?;
        }
        self.patch_quick_start(std::slice::from_ref(&updated))?;
        Ok(updated.is_liked)
    }

    /// Count one listen: bump stats, move to the front of Recently Played
    /// and queue a Most Played rebuild.
    pub fn record_play(&self, id: &str) -> Result<Song> {
        let _writer = self.writer();
        let song = self.require_song(id)?.with_play_recorded(Utc::now());
        let recent = self
            .system_playlist(SystemKind::RecentlyPlayed)?
            .with_song_at_front(id, RECENTLY_PLAYED_CAP);

        self.commit_songs(std::slice::from_ref(&song))?;
        self.commit_playlists(&[recent])?;
        self.patch_quick_start(std::slice::from_ref(&song))?;
        self.schedule_most_played_rebuild();
        debug!("Recorded play of {} (count {})", song.title, song.play_count);
        Ok(song)
    }

    /// Flag songs under `roots` whose files are gone; clear the flag on
    /// songs seen again. Nothing is deleted.
    pub fn mark_missing(&self, roots: &[PathBuf], seen: &HashSet<String>) -> Result<usize> {
        let _writer = self.writer();
        let changed: Vec<Song> = self.with_songs(|map| {
            map.values()
                .filter(|s| roots.iter().any(|r| s.file_path.starts_with(r)))
                .filter_map(|s| {
                    let gone = !seen.contains(&s.id) && !s.file_path.exists();
                    (gone != s.missing).then(|| Song {
                        missing: gone,
                        ..s.clone()
                    })
                })
                .collect()
        })?;
        self.commit_songs(&changed)?;
        self.patch_quick_start(&changed)?;
        let newly_missing = changed.iter().filter(|s| s.missing).count();
        if newly_missing > 0 {
            info!("Marked {} songs as missing", newly_missing);
        }
        Ok(newly_missing)
    }

    // ---- quick start ----------------------------------------------------

    /// The newest songs, readable without loading the whole catalog.
    pub fn quick_start_songs(&self) -> Result<Vec<Song>> {
        match self.inner.store.get_flag(QUICK_START_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    fn refresh_quick_start(&self, fresh: &[Song]) -> Result<()> {
        let mut merged: HashMap<String, Song> = self
            .quick_start_songs()?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        for song in fresh {
            merged.insert(song.id.clone(), song.clone());
        }
        self.store_quick_start(merged.into_values().collect())
    }

    /// Rewrite entries already in the subset; other songs are left out.
    fn patch_quick_start(&self, updated: &[Song]) -> Result<()> {
        let mut current = self.quick_start_songs()?;
        let mut touched = false;
        for entry in current.iter_mut() {
            if let Some(song) = updated.iter().find(|s| s.id == entry.id) {
                *entry = song.clone();
                touched = true;
            }
        }
        if touched {
            self.store_quick_start(current)?;
        }
        Ok(())
    }

    fn drop_from_quick_start(&self, id: &str) -> Result<()> {
        let current = self.quick_start_songs()?;
        if current.iter().any(|s| s.id == id) {
            // refill from the catalog so the subset stays full
            let all = self.with_songs(|map| map.values().cloned().collect::<Vec<_>>())?;
            self.store_quick_start(all)?;
        }
        Ok(())
    }

    fn store_quick_start(&self, mut songs: Vec<Song>) -> Result<()> {
        songs.sort_by(|a, b| b.date_added.cmp(&a.date_added).then_with(|| a.id.cmp(&b.id)));
        songs.truncate(QUICK_START_SIZE);
        self.inner
            .store
            .set_flag(QUICK_START_KEY, &serde_json::to_string(&songs)?)
    }

    // ---- playlists ------------------------------------------------------

    pub fn load_all_playlists(&self) -> Result<Vec<Playlist>> {
        let mut playlists = self.with_playlists(|map| map.values().cloned().collect::<Vec<_>>())?;
        playlists.sort_by(|a, b| {
            b.is_system_playlist
                .cmp(&a.is_system_playlist)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(playlists)
    }

    pub fn get_playlist(&self, id: &str) -> Result<Option<Playlist>> {
        self.with_playlists(|map| map.get(id).cloned())
    }

    fn require_playlist(&self, id: &str) -> Result<Playlist> {
        self.get_playlist(id)?
            .ok_or_else(|| EngineError::not_found(format!("playlist {}", id)))
    }

    fn require_user_playlist(&self, id: &str) -> Result<Playlist> {
        let playlist = self.require_playlist(id)?;
        if playlist.is_system_playlist {
            return Err(EngineError::Forbidden(format!(
                "'{}' is managed by the player",
                playlist.name
            )));
        }
        Ok(playlist)
    }

    pub fn system_playlist(&self, kind: SystemKind) -> Result<Playlist> {
        self.get_playlist(kind.playlist_id())?
            .ok_or_else(|| EngineError::not_found(format!("system playlist {:?}", kind)))
    }

    /// Songs of a playlist in playlist order.
    pub fn playlist_songs(&self, id: &str) -> Result<Vec<Song>> {
        let playlist = self.require_playlist(id)?;
        self.get_songs_by_ids(&playlist.song_ids)
    }

    pub fn liked_songs(&self) -> Result<Vec<Song>> {
        self.playlist_songs(SystemKind::Liked.playlist_id())
    }

    pub fn recently_played(&self) -> Result<Vec<Song>> {
        self.playlist_songs(SystemKind::RecentlyPlayed.playlist_id())
    }

    pub fn most_played(&self) -> Result<Vec<Song>> {
        self.playlist_songs(SystemKind::MostPlayed.playlist_id())
    }

    fn ensure_unique_name(&self, name: &str, except_id: Option<&str>) -> Result<()> {
        let lowered = name.to_lowercase();
        let clash = self.with_playlists(|map| {
            map.values().any(|p| {
                !p.is_system_playlist
                    && Some(p.id.as_str()) != except_id
                    && p.name.to_lowercase() == lowered
            })
        })?;
        if clash {
            return Err(EngineError::Conflict(format!("playlist '{}' already exists", name)));
        }
        Ok(())
    }

    pub fn create_playlist(&self, name: &str, description: Option<String>) -> Result<Playlist> {
        let _writer = self.writer();
        let name = normalize_playlist_name(name)?;
        self.ensure_unique_name(&name, None)?;
        let playlist = Playlist::new_user(name, description);
        self.commit_playlists(std::slice::from_ref(&playlist))?;
        info!("Created playlist '{}'", playlist.name);
        Ok(playlist)
    }

    pub fn update_playlist(&self, id: &str, update: PlaylistUpdate) -> Result<Playlist> {
        let _writer = self.writer();
        let current = self.require_playlist(id)?;
        let mut next = current.clone();

        if let Some(raw) = update.name {
            if current.is_system_playlist {
                return Err(EngineError::Forbidden(format!(
                    "cannot rename system playlist '{}'",
                    current.name
                )));
            }
            let name = normalize_playlist_name(&raw)?;
            self.ensure_unique_name(&name, Some(id))?;
            next.name = name;
        }
        if let Some(description) = update.description {
            next.description = description;
        }
        if let Some(cover) = update.cover_art_path {
            next.cover_art_path = cover;
        }
        if let Some(color) = update.color_theme {
            next.color_theme = color;
        }

        if next == current {
            return Ok(current);
        }
        next.modified_at = Utc::now();
        self.commit_playlists(std::slice::from_ref(&next))?;
        Ok(next)
    }

    pub fn delete_playlist(&self, id: &str) -> Result<()> {
        let _writer = self.writer();
        let playlist = self.require_playlist(id)?;
        if playlist.is_system_playlist {
            return Err(EngineError::Forbidden(format!(
                "cannot delete system playlist '{}'",
                playlist.name
            )));
        }
        self.inner.store.delete::<Playlist>(id)?;
        self.cache().remove_playlist(id);
        info!("Deleted playlist '{}'", playlist.name);
        Ok(())
    }

    /// `Ok(false)` when the song is already in the playlist.
    pub fn add_song_to_playlist(&self, playlist_id: &str, song_id: &str) -> Result<bool> {
        let _writer = self.writer();
        let playlist = self.require_user_playlist(playlist_id)?;
        self.require_song(song_id)?;
        match playlist.with_song_appended(song_id) {
            Some(updated) => {
                self.commit_playlists(&[updated])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove_song_from_playlist(&self, playlist_id: &str, song_id: &str) -> Result<bool> {
        let _writer = self.writer();
        let playlist = self.require_user_playlist(playlist_id)?;
        match playlist.with_song_removed(song_id) {
            Some(updated) => {
                self.commit_playlists(&[updated])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn reorder_playlist(&self, playlist_id: &str, from: usize, to: usize) -> Result<Playlist> {
        let _writer = self.writer();
        let playlist = self.require_user_playlist(playlist_id)?;
        let updated = playlist.with_moved(from, to)?;
        self.commit_playlists(std::slice::from_ref(&updated))?;
        Ok(updated)
    }

    // ---- search ---------------------------------------------------------

    /// Case-insensitive substring over title, artist, album and genre.
    pub fn search_songs(&self, query: &str) -> Result<Vec<Song>> {
        let needle = query.trim().to_lowercase();
        let songs = self.load_all_songs()?;
        if needle.is_empty() {
            return Ok(songs);
        }
        Ok(songs.into_iter().filter(|s| s.matches_query(&needle)).collect())
    }

    pub fn search_playlists(&self, query: &str) -> Result<Vec<Playlist>> {
        let needle = query.trim().to_lowercase();
        let playlists = self.load_all_playlists()?;
        if needle.is_empty() {
            return Ok(playlists);
        }
        Ok(playlists.into_iter().filter(|p| p.matches_query(&needle)).collect())
    }

    // ---- settings & queue -----------------------------------------------

    pub fn load_settings(&self) -> Result<PlaybackSettings> {
        Ok(self
            .inner
            .store
            .get::<PlaybackSettings>(PlaybackSettings::KEY)?
            .unwrap_or_default())
    }

    /// Out-of-range values are rejected, never clamped.
    pub fn save_settings(&self, settings: &PlaybackSettings) -> Result<()> {
        settings.validate()?;
        self.inner.store.put(settings)
    }

    pub fn load_queue_snapshot(&self) -> Result<Option<QueueSnapshot>> {
        self.inner.store.get::<QueueSnapshot>(QueueSnapshot::KEY)
    }

    pub fn save_queue_snapshot(&self, snapshot: &QueueSnapshot) -> Result<()> {
        self.inner.store.put(snapshot)
    }

    pub fn clear_queue_snapshot(&self) -> Result<()> {
        self.inner.store.clear(Table::Queue)
    }

    /// Forget cached rows, e.g. after an import swapped tables underneath.
    pub fn invalidate_caches(&self) {
        self.cache().invalidate();
    }

    /// Re-run the integrity sweep after bulk table replacement.
    pub fn reconcile(&self) -> Result<()> {
        let _writer = self.writer();
        self.ensure_system_playlists()?;
        self.sweep_integrity()?;
        self.cache().invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn library() -> LibraryService {
        LibraryService::open(PersistentStore::open_in_memory().unwrap()).unwrap()
    }

    fn song(name: &str) -> Song {
        let mut song = Song::new(PathBuf::from(format!("/music/{}.mp3", name)), name);
        song.artist = format!("{} Artist", name);
        song.duration = 60_000;
        song
    }

    fn seeded(names: &[&str]) -> (LibraryService, Vec<Song>) {
        let lib = library();
        let songs: Vec<Song> = names.iter().map(|n| song(n)).collect();
        lib.upsert_songs(songs.clone()).unwrap();
        (lib, songs)
    }

    #[test]
    fn system_playlists_bootstrap_once() {
        let store = PersistentStore::open_in_memory().unwrap();
        let lib = LibraryService::open(store).unwrap();
        lib.ensure_system_playlists().unwrap();
        let system: Vec<_> = lib
            .load_all_playlists()
            .unwrap()
            .into_iter()
            .filter(|p| p.is_system_playlist)
            .collect();
        assert_eq!(system.len(), 3);
    }

    #[test]
    fn songs_by_ids_keeps_order_and_drops_unknown() {
        let (lib, songs) = seeded(&["a", "b", "c"]);
        let ids = vec![songs[2].id.clone(), "nope".to_string(), songs[0].id.clone()];
        let found: Vec<String> = lib.get_songs_by_ids(&ids).unwrap().into_iter().map(|s| s.title).collect();
        assert_eq!(found, vec!["c", "a"]);
    }

    #[test]
    fn delete_song_scrubs_every_playlist() {
        let (lib, songs) = seeded(&["a", "b"]);
        let a = &songs[0];
        let mix = lib.create_playlist("Mix", None).unwrap();
        lib.add_song_to_playlist(&mix.id, &a.id).unwrap();
        lib.add_song_to_playlist(&mix.id, &songs[1].id).unwrap();
        lib.record_play(&a.id).unwrap();

        assert!(lib.delete_song(&a.id).unwrap());
        assert!(lib.get_song(&a.id).unwrap().is_none());
        assert!(!lib.get_playlist(&mix.id).unwrap().unwrap().contains(&a.id));
        assert!(!lib.system_playlist(SystemKind::RecentlyPlayed).unwrap().contains(&a.id));
        // idempotent
        assert!(!lib.delete_song(&a.id).unwrap());
    }

    #[test]
    fn dangling_ids_are_swept_on_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("lib.db");
        let a = song("a");
        let mix_id;
        {
            let lib = LibraryService::open(PersistentStore::open(&db).unwrap()).unwrap();
            lib.upsert_song(a.clone()).unwrap();
            let mix = lib.create_playlist("Mix", None).unwrap();
            lib.add_song_to_playlist(&mix.id, &a.id).unwrap();
            mix_id = mix.id;
            // simulate a crash after the song row went away but before playlists were rewritten
            lib.store().delete::<Song>(&a.id).unwrap();
        }
        let lib = LibraryService::open(PersistentStore::open(&db).unwrap()).unwrap();
        assert!(!lib.get_playlist(&mix_id).unwrap().unwrap().contains(&a.id));
    }

    #[test]
    fn liked_tracks_like_flags() {
        let (lib, songs) = seeded(&["a", "b", "c"]);
        assert!(lib.toggle_like(&songs[0].id).unwrap());
        assert!(lib.toggle_like(&songs[1].id).unwrap());
        assert!(!lib.toggle_like(&songs[0].id).unwrap());

        let liked: HashSet<String> = lib
            .system_playlist(SystemKind::Liked)
            .unwrap()
            .song_ids
            .into_iter()
            .collect();
        let flagged: HashSet<String> = lib
            .load_all_songs()
            .unwrap()
            .into_iter()
            .filter(|s| s.is_liked)
            .map(|s| s.id)
            .collect();
        assert_eq!(liked, flagged);
        assert_eq!(liked.len(), 1);
    }

    #[test]
    fn record_play_counts_and_dedups_recents() {
        let (lib, songs) = seeded(&["a", "b"]);
        let first = lib.record_play(&songs[0].id).unwrap();
        lib.record_play(&songs[1].id).unwrap();
        let again = lib.record_play(&songs[0].id).unwrap();

        assert_eq!(first.play_count, 1);
        assert_eq!(again.play_count, 2);
        assert!(again.last_played > first.last_played);
        let recent = lib.system_playlist(SystemKind::RecentlyPlayed).unwrap();
        assert_eq!(recent.song_ids, vec![songs[0].id.clone(), songs[1].id.clone()]);
        assert!(matches!(lib.record_play("ghost"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn recents_are_capped() {
        let names: Vec<String> = (0..110).map(|i| format!("s{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (lib, songs) = seeded(&refs);
        for s in &songs {
            lib.record_play(&s.id).unwrap();
        }
        let recent = lib.system_playlist(SystemKind::RecentlyPlayed).unwrap();
        assert_eq!(recent.song_ids.len(), RECENTLY_PLAYED_CAP);
        assert_eq!(recent.song_ids[0], songs[109].id);
    }

    #[test]
    fn most_played_rebuild_reflects_counts() {
        let (lib, songs) = seeded(&["a", "b"]);
        lib.record_play(&songs[1].id).unwrap();
        lib.record_play(&songs[1].id).unwrap();
        lib.record_play(&songs[0].id).unwrap();
        let rebuilt = lib.rebuild_most_played().unwrap();
        assert_eq!(rebuilt.song_ids, vec![songs[1].id.clone(), songs[0].id.clone()]);
    }

    #[tokio::test]
    async fn most_played_worker_coalesces_requests() {
        let (lib, songs) = seeded(&["a"]);
        let cancel = tokio_util::sync::CancellationToken::new();
        for _ in 0..5 {
            lib.record_play(&songs[0].id).unwrap();
        }
        let handle = lib.spawn_most_played_worker(cancel.clone());
        for _ in 0..50 {
            if !lib.most_played().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(lib.most_played().unwrap().len(), 1);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn playlist_validation() {
        let lib = library();
        assert!(matches!(lib.create_playlist("  ", None), Err(EngineError::InvalidArgument(_))));
        lib.create_playlist("Road Trip", None).unwrap();
        assert!(matches!(lib.create_playlist(" road trip ", None), Err(EngineError::Conflict(_))));
        // system names do not collide with user playlists
        lib.create_playlist("Liked Songs", None).unwrap();
    }

    #[test]
    fn system_playlists_are_protected() {
        let (lib, songs) = seeded(&["a"]);
        for kind in SystemKind::ALL {
            let id = kind.playlist_id();
            assert!(matches!(lib.delete_playlist(id), Err(EngineError::Forbidden(_))));
            let rename = PlaylistUpdate {
                name: Some("Mine".into()),
                ..Default::default()
            };
            assert!(matches!(lib.update_playlist(id, rename), Err(EngineError::Forbidden(_))));
            assert!(matches!(
                lib.add_song_to_playlist(id, &songs[0].id),
                Err(EngineError::Forbidden(_))
            ));
        }
        let recolor = PlaylistUpdate {
            color_theme: Some(Some("teal".into())),
            ..Default::default()
        };
        let liked = lib.update_playlist(SystemKind::Liked.playlist_id(), recolor).unwrap();
        assert_eq!(liked.color_theme.as_deref(), Some("teal"));
    }

    #[test]
    fn rename_and_reorder() {
        let (lib, songs) = seeded(&["a", "b", "c"]);
        let p = lib.create_playlist("One", Some("first".into())).unwrap();
        for s in &songs {
            lib.add_song_to_playlist(&p.id, &s.id).unwrap();
        }
        assert!(!lib.add_song_to_playlist(&p.id, &songs[0].id).unwrap());
        let renamed = lib
            .update_playlist(&p.id, PlaylistUpdate { name: Some("Two".into()), ..Default::default() })
            .unwrap();
        assert_eq!(renamed.name, "Two");
        let reordered = lib.reorder_playlist(&p.id, 2, 0).unwrap();
        assert_eq!(reordered.song_ids[0], songs[2].id);
        assert!(matches!(lib.reorder_playlist(&p.id, 5, 0), Err(EngineError::InvalidArgument(_))));
        assert!(lib.remove_song_from_playlist(&p.id, &songs[1].id).unwrap());
        assert!(!lib.remove_song_from_playlist(&p.id, &songs[1].id).unwrap());
    }

    #[test]
    fn search_is_case_insensitive_and_empty_returns_all() {
        let (lib, _) = seeded(&["Alpha", "Beta", "Gamma"]);
        assert_eq!(lib.search_songs("").unwrap().len(), 3);
        let hits = lib.search_songs("BETA").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Beta");
        assert_eq!(lib.search_songs("artist").unwrap().len(), 3);

        lib.create_playlist("Evening", Some("slow tunes".into())).unwrap();
        assert_eq!(lib.search_playlists("TUNES").unwrap().len(), 1);
        assert_eq!(lib.search_playlists("").unwrap().len(), 4);
    }

    #[test]
    fn quick_start_holds_newest_twenty() {
        let lib = library();
        let base = Utc::now();
        let songs: Vec<Song> = (0..25)
            .map(|i| {
                let mut s = song(&format!("s{}", i));
                s.date_added = base + Duration::seconds(i);
                s
            })
            .collect();
        lib.upsert_songs(songs.clone()).unwrap();
        let quick = lib.quick_start_songs().unwrap();
        assert_eq!(quick.len(), QUICK_START_SIZE);
        assert_eq!(quick[0].id, songs[24].id);

        lib.delete_song(&songs[24].id).unwrap();
        let quick = lib.quick_start_songs().unwrap();
        assert_eq!(quick.len(), QUICK_START_SIZE);
        assert_eq!(quick[0].id, songs[23].id);
    }

    #[test]
    fn cold_loads_never_hide_committed_writes() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let lib = library();
        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let lib = lib.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    lib.invalidate_caches();
                    lib.load_all_songs().unwrap();
                    lib.load_all_playlists().unwrap();
                }
            })
        };

        for i in 0..100 {
            let written = song(&format!("w{}", i));
            lib.upsert_songs(vec![written.clone()]).unwrap();
            assert!(lib.get_song(&written.id).unwrap().is_some(), "write {} not visible", i);
        }
        done.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        assert_eq!(lib.load_all_songs().unwrap().len(), 100);
    }

    #[test]
    fn quick_start_follows_likes_and_plays() {
        let lib = library();
        let a = song("a");
        lib.upsert_songs(vec![a.clone()]).unwrap();

        lib.toggle_like(&a.id).unwrap();
        lib.record_play(&a.id).unwrap();
        let quick = lib.quick_start_songs().unwrap();
        assert_eq!(quick.len(), 1);
        assert!(quick[0].is_liked);
        assert_eq!(quick[0].play_count, 1);

        lib.toggle_like(&a.id).unwrap();
        assert!(!lib.quick_start_songs().unwrap()[0].is_liked);
    }

    #[test]
    fn settings_are_validated_before_persisting() {
        let lib = library();
        assert_eq!(lib.load_settings().unwrap(), PlaybackSettings::default());
        let bad = PlaybackSettings {
            playback_speed: 4.0,
            ..Default::default()
        };
        assert!(matches!(lib.save_settings(&bad), Err(EngineError::InvalidArgument(_))));
        assert_eq!(lib.load_settings().unwrap(), PlaybackSettings::default());
    }

    #[test]
    fn missing_files_are_flagged_not_deleted() {
        let dir = tempfile::TempDir::new().unwrap();
        let present = dir.path().join("here.mp3");
        std::fs::write(&present, b"x").unwrap();
        let gone = dir.path().join("gone.mp3");
        let lib = library();
        let a = Song::new(present, "here");
        let b = Song::new(gone, "gone");
        lib.upsert_songs(vec![a.clone(), b.clone()]).unwrap();

        let seen: HashSet<String> = [a.id.clone()].into_iter().collect();
        assert_eq!(lib.mark_missing(&[dir.path().to_path_buf()], &seen).unwrap(), 1);
        assert!(lib.get_song(&b.id).unwrap().unwrap().missing);
        assert!(!lib.get_song(&a.id).unwrap().unwrap().missing);
    }
}
