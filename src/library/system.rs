// System playlist upkeep: bootstrap, Most Played ranking, integrity sweep

use std::collections::HashSet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LibraryService, MOST_PLAYED_CAP};
use crate::error::Result;
use crate::model::{Playlist, Song, SystemKind};

/// Top `MOST_PLAYED_CAP` songs by play count, most recent play breaking ties.
pub fn rank_most_played(songs: &[Song]) -> Vec<String> {
    let mut played: Vec<&Song> = songs.iter().filter(|s| s.play_count > 0).collect();
    played.sort_by(|a, b| {
        b.play_count
            .cmp(&a.play_count)
            .then_with(|| b.last_played.cmp(&a.last_played))
            .then_with(|| a.id.cmp(&b.id))
    });
    played.into_iter().take(MOST_PLAYED_CAP).map(|s| s.id.clone()).collect()
}

/// Liked must hold exactly the liked songs. Keeps existing order, appends
/// stragglers, drops anything no longer liked.
pub fn reconcile_liked(liked: &Playlist, songs: &[Song]) -> Option<Playlist> {
    let liked_ids: HashSet<&str> = songs.iter().filter(|s| s.is_liked).map(|s| s.id.as_str()).collect();
    let mut ids: Vec<String> = liked
        .song_ids
        .iter()
        .filter(|id| liked_ids.contains(id.as_str()))
        .cloned()
        .collect();
    for song in songs.iter().filter(|s| s.is_liked) {
        if !ids.contains(&song.id) {
            ids.push(song.id.clone());
        }
    }
    if ids == liked.song_ids {
        None
    } else {
        Some(liked.with_song_ids(ids))
    }
}

impl LibraryService {
    /// Idempotent; runs on every open.
    pub(super) fn ensure_system_playlists(&self) -> Result<()> {
        let mut created = Vec::new();
        for kind in SystemKind::ALL {
            if self.inner.store.get::<Playlist>(kind.playlist_id())?.is_none() {
                created.push(Playlist::new_system(kind));
            }
        }
        if !created.is_empty() {
            self.inner.store.put_batch(&created)?;
            info!("Bootstrapped {} system playlists", created.len());
        }
        Ok(())
    }

    /// Drop dangling song ids from every playlist and re-derive Liked.
    /// Repairs a crash between the halves of a multi-record write.
    pub(super) fn sweep_integrity(&self) -> Result<()> {
        let songs = self.inner.store.iterate::<Song>()?;
        let known: HashSet<&str> = songs.iter().map(|s| s.id.as_str()).collect();
        let mut repaired = Vec::new();

        for playlist in self.inner.store.iterate::<Playlist>()? {
            let retained = playlist
                .with_songs_retained(|id| known.contains(id))
                .unwrap_or_else(|| playlist.clone());
            let fixed = if retained.system_kind == Some(SystemKind::Liked) {
                reconcile_liked(&retained, &songs).unwrap_or(retained)
            } else {
                retained
            };
            if fixed.song_ids != playlist.song_ids {
                repaired.push(fixed);
            }
        }

        if !repaired.is_empty() {
            warn!("Repaired {} playlists with stale entries", repaired.len());
            self.inner.store.put_batch(&repaired)?;
        }
        Ok(())
    }

    pub fn rebuild_most_played(&self) -> Result<Playlist> {
        let _writer = self.writer();
        let songs = self.load_all_songs()?;
        let current = self.system_playlist(SystemKind::MostPlayed)?;
        let ranked = rank_most_played(&songs);
        if ranked == current.song_ids {
            return Ok(current);
        }
        let rebuilt = current.with_song_ids(ranked);
        self.commit_playlists(&[rebuilt.clone()])?;
        debug!("Most Played rebuilt with {} entries", rebuilt.song_ids.len());
        Ok(rebuilt)
    }

    pub(super) fn schedule_most_played_rebuild(&self) {
        // Notify keeps at most one stored permit, so bursts coalesce
        self.inner.most_played.notify_one();
    }

    /// Background rebuild loop. Store work runs on the blocking pool so the
    /// runtime stays free.
    pub fn spawn_most_played_worker(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let library = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = library.inner.most_played.notified() => {}
                }
                let worker = library.clone();
                match tokio::task::spawn_blocking(move || worker.rebuild_most_played()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("Most Played rebuild failed: {}", e),
                    Err(e) => warn!("Most Played rebuild task panicked: {}", e),
                }
            }
            debug!("Most Played worker stopped");
        })
    }
}
