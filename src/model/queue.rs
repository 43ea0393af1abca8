use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::Song;

/// What the engine actually plays: a song resolved to everything the
/// renderer and the media session need, detached from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub song_id: String,
    pub file_path: PathBuf,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub artwork: Option<PathBuf>,
    pub duration: Duration,
}

impl From<&Song> for MediaItem {
    fn from(song: &Song) -> Self {
        Self {
            song_id: song.id.clone(),
            file_path: song.file_path.clone(),
            title: song.title.clone(),
            artist: song.artist.clone(),
            album: song.album.clone(),
            artwork: song.album_art_path.clone(),
            duration: song.duration(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub song_id: String,
    pub position: usize,
}

/// Persisted queue so playback can resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub items: Vec<QueueItem>,
    pub current_index: Option<usize>,
    pub position_ms: u64,
    pub saved_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub const KEY: &'static str = "current";

    pub fn from_items(items: &[MediaItem], current_index: Option<usize>, position: Duration) -> Self {
        Self {
            items: items
                .iter()
                .enumerate()
                .map(|(position, item)| QueueItem {
                    song_id: item.song_id.clone(),
                    position,
                })
                .collect(),
            current_index,
            position_ms: position.as_millis() as u64,
            saved_at: Utc::now(),
        }
    }

    pub fn song_ids(&self) -> Vec<String> {
        let mut items = self.items.clone();
        items.sort_by_key(|item| item.position);
        items.into_iter().map(|item| item.song_id).collect()
    }

    pub fn position(&self) -> Duration {
        Duration::from_millis(self.position_ms)
    }
}
