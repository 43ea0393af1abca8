use std::collections::HashMap;

use crate::model::{Playlist, Song};

/// In-memory mirror of the songs and playlists tables. Filled lazily on the
/// first read and patched only after the matching store write committed.
///
/// Every patch bumps `generation`, filled or not. A reader loads the table
/// without holding the lock, so it may only install what it loaded if no
/// write landed in between.
#[derive(Debug, Default)]
pub(crate) struct LibraryCache {
    songs: Option<HashMap<String, Song>>,
    playlists: Option<HashMap<String, Playlist>>,
    generation: u64,
}

impl LibraryCache {
    pub fn songs(&self) -> Option<&HashMap<String, Song>> {
        self.songs.as_ref()
    }

    pub fn playlists(&self) -> Option<&HashMap<String, Playlist>> {
        self.playlists.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Install a table read while the cache was at `seen`. Returns false
    /// when a write happened since; the caller reloads.
    pub fn fill_songs(&mut self, songs: Vec<Song>, seen: u64) -> bool {
        if self.songs.is_some() {
            return true;
        }
        if seen != self.generation {
            return false;
        }
        self.songs = Some(songs.into_iter().map(|s| (s.id.clone(), s)).collect());
        true
    }

    pub fn fill_playlists(&mut self, playlists: Vec<Playlist>, seen: u64) -> bool {
        if self.playlists.is_some() {
            return true;
        }
        if seen != self.generation {
            return false;
        }
        self.playlists = Some(playlists.into_iter().map(|p| (p.id.clone(), p)).collect());
        true
    }

    pub fn apply_songs<'a>(&mut self, songs: impl IntoIterator<Item = &'a Song>) {
        self.generation += 1;
        if let Some(map) = self.songs.as_mut() {
            for song in songs {
                map.insert(song.id.clone(), song.clone());
            }
        }
    }

    pub fn remove_song(&mut self, id: &str) {
        self.generation += 1;
        if let Some(map) = self.songs.as_mut() {
            map.remove(id);
        }
    }

    pub fn apply_playlists<'a>(&mut self, playlists: impl IntoIterator<Item = &'a Playlist>) {
        self.generation += 1;
        if let Some(map) = self.playlists.as_mut() {
            for playlist in playlists {
                map.insert(playlist.id.clone(), playlist.clone());
            }
        }
    }

    pub fn remove_playlist(&mut self, id: &str) {
        self.generation += 1;
        if let Some(map) = self.playlists.as_mut() {
            map.remove(id);
        }
    }

    pub fn invalidate(&mut self) {
        self.generation += 1;
        self.songs = None;
        self.playlists = None;
    }
}
