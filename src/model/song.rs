use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh64::xxh64;

/// Supported audio file extensions, matched case-insensitively.
pub const AUDIO_EXTENSIONS: [&str; 8] = ["mp3", "aac", "m4a", "wav", "flac", "ogg", "wma", "aiff"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub track_number: Option<u32>,
    pub file_path: PathBuf,
    pub duration: u64, // milliseconds
    pub album_art_path: Option<PathBuf>,
    #[serde(default)]
    pub lyrics_path: Option<PathBuf>,
    pub play_count: u64,
    pub last_played: Option<DateTime<Utc>>,
    pub is_liked: bool,
    pub date_added: DateTime<Utc>,
    #[serde(default)]
    pub missing: bool,
}

/// Stable song id: xxhash64 of the absolute path, hex encoded.
pub fn song_id_for_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("{:016x}", xxh64(raw.as_bytes(), 0))
}

/// Case-insensitive extension check against [`AUDIO_EXTENSIONS`].
pub fn is_audio_extension(ext: &str) -> bool {
    let normalized = ext.to_ascii_lowercase();
    AUDIO_EXTENSIONS.contains(&normalized.as_str())
}

impl Song {
    pub fn new(file_path: PathBuf, title: impl Into<String>) -> Self {
        Self {
            id: song_id_for_path(&file_path),
            title: title.into(),
            artist: "Unknown Artist".to_string(),
            album: "Unknown Album".to_string(),
            genre: None,
            year: None,
            track_number: None,
            file_path,
            duration: 0,
            album_art_path: None,
            lyrics_path: None,
            play_count: 0,
            last_played: None,
            is_liked: false,
            date_added: Utc::now(),
            missing: false,
        }
    }

    /// Merge a fresh scan result into the stored record. Identity and
    /// listening stats survive; tag-derived fields come from the scan.
    pub fn refreshed_from_scan(&self, scanned: Song) -> Song {
        Song {
            id: self.id.clone(),
            play_count: self.play_count,
            last_played: self.last_played,
            is_liked: self.is_liked,
            date_added: self.date_added,
            missing: false,
            ..scanned
        }
    }

    /// Copy-on-write play bump. `last_played` always moves forward even if
    /// the wall clock did not.
    pub fn with_play_recorded(&self, now: DateTime<Utc>) -> Song {
        let last_played = match self.last_played {
            Some(previous) if now <= previous => previous + ChronoDuration::milliseconds(1),
            _ => now,
        };
        Song {
            play_count: self.play_count + 1,
            last_played: Some(last_played),
            ..self.clone()
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.duration)
    }

    pub fn matches_query(&self, needle: &str) -> bool {
        let hit = |field: &str| field.to_lowercase().contains(needle);
        hit(&self.title)
            || hit(&self.artist)
            || hit(&self.album)
            || self.genre.as_deref().map_or(false, hit)
    }
}
