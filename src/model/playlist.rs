use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

pub const MAX_PLAYLIST_NAME_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemKind {
    RecentlyPlayed,
    Liked,
    MostPlayed,
}

impl SystemKind {
    pub const ALL: [SystemKind; 3] = [SystemKind::RecentlyPlayed, SystemKind::Liked, SystemKind::MostPlayed];

    /// Fixed ids so bootstrapping is idempotent across launches.
    pub fn playlist_id(self) -> &'static str {
        match self {
            SystemKind::RecentlyPlayed => "system:recently-played",
            SystemKind::Liked => "system:liked",
            SystemKind::MostPlayed => "system:most-played",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SystemKind::RecentlyPlayed => "Recently Played",
            SystemKind::Liked => "Liked Songs",
            SystemKind::MostPlayed => "Most Played",
        }
    }
}

/// A playlist is a value: every mutation hands back a new record that the
/// caller persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub cover_art_path: Option<String>,
    pub color_theme: Option<String>,
    pub song_ids: Vec<String>,
    pub is_system_playlist: bool,
    pub system_kind: Option<SystemKind>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Trim and bound-check a user supplied playlist name.
pub fn normalize_playlist_name(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::invalid("playlist name must not be empty"));
    }
    if trimmed.chars().count() > MAX_PLAYLIST_NAME_CHARS {
        return Err(EngineError::invalid(format!(
            "playlist name longer than {} characters",
            MAX_PLAYLIST_NAME_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

impl Playlist {
    pub fn new_user(name: String, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            cover_art_path: None,
            color_theme: None,
            song_ids: Vec::new(),
            is_system_playlist: false,
            system_kind: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn new_system(kind: SystemKind) -> Self {
        let now = Utc::now();
        Self {
            id: kind.playlist_id().to_string(),
            name: kind.display_name().to_string(),
            description: None,
            cover_art_path: None,
            color_theme: None,
            song_ids: Vec::new(),
            is_system_playlist: true,
            system_kind: Some(kind),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn contains(&self, song_id: &str) -> bool {
        self.song_ids.iter().any(|id| id == song_id)
    }

    fn touched(&self, song_ids: Vec<String>) -> Playlist {
        Playlist {
            song_ids,
            modified_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Append unless already present. `None` means nothing changed.
    pub fn with_song_appended(&self, song_id: &str) -> Option<Playlist> {
        if self.contains(song_id) {
            return None;
        }
        let mut ids = self.song_ids.clone();
        ids.push(song_id.to_string());
        Some(self.touched(ids))
    }

    /// Move (or insert) the song to the front, dropping older duplicates and
    /// anything past `cap`.
    pub fn with_song_at_front(&self, song_id: &str, cap: usize) -> Playlist {
        let mut ids: Vec<String> = Vec::with_capacity(self.song_ids.len() + 1);
        ids.push(song_id.to_string());
        ids.extend(self.song_ids.iter().filter(|id| *id != song_id).cloned());
        ids.truncate(cap);
        self.touched(ids)
    }

    pub fn with_song_removed(&self, song_id: &str) -> Option<Playlist> {
        if !self.contains(song_id) {
            return None;
        }
        let ids = self.song_ids.iter().filter(|id| *id != song_id).cloned().collect();
        Some(self.touched(ids))
    }

    pub fn with_songs_retained(&self, keep: impl Fn(&str) -> bool) -> Option<Playlist> {
        let ids: Vec<String> = self.song_ids.iter().filter(|id| keep(id)).cloned().collect();
        if ids.len() == self.song_ids.len() {
            return None;
        }
        Some(self.touched(ids))
    }

    pub fn with_song_ids(&self, song_ids: Vec<String>) -> Playlist {
        self.touched(song_ids)
    }

    pub fn with_moved(&self, from: usize, to: usize) -> Result<Playlist> {
        let len = self.song_ids.len();
        if from >= len || to >= len {
            return Err(EngineError::invalid(format!(
                "cannot move {} -> {} in playlist of {} songs",
                from, to, len
            )));
        }
        let mut ids = self.song_ids.clone();
        let id = ids.remove(from);
        ids.insert(to, id);
        Ok(self.touched(ids))
    }

    pub fn matches_query(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self
                .description
                .as_deref()
                .map_or(false, |d| d.to_lowercase().contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_bounded() {
        assert_eq!(normalize_playlist_name("  Road Trip ").unwrap(), "Road Trip");
        assert!(matches!(normalize_playlist_name("   "), Err(EngineError::InvalidArgument(_))));
        let long = "x".repeat(101);
        assert!(matches!(normalize_playlist_name(&long), Err(EngineError::InvalidArgument(_))));
        assert!(normalize_playlist_name(&"y".repeat(100)).is_ok());
    }

    #[test]
    fn append_skips_duplicates() {
        let p = Playlist::new_user("Mix".into(), None);
        let p = p.with_song_appended("a").unwrap();
        assert!(p.with_song_appended("a").is_none());
        assert_eq!(p.song_ids, vec!["a"]);
    }

    #[test]
    fn front_insert_dedups_and_caps() {
        let p = Playlist::new_system(SystemKind::RecentlyPlayed)
            .with_song_ids(vec!["a".into(), "b".into(), "c".into()]);
        let p = p.with_song_at_front("c", 2);
        assert_eq!(p.song_ids, vec!["c", "a"]);
    }

    #[test]
    fn move_rejects_out_of_range() {
        let p = Playlist::new_user("Mix".into(), None).with_song_ids(vec!["a".into(), "b".into()]);
        assert_eq!(p.with_moved(0, 1).unwrap().song_ids, vec!["b", "a"]);
        assert!(p.with_moved(0, 2).is_err());
    }
}
