// Library export/import as a single JSON document
// Import is all-or-nothing per table: one bad record keeps that table as it was

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::library::LibraryService;
use crate::model::{PlaybackSettings, Playlist, Song};
use crate::store::{Record, CURRENT_SCHEMA_VERSION};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub schema_version: u32,
    pub songs: Vec<Song>,
    pub playlists: Vec<Playlist>,
    pub settings: PlaybackSettings,
}

/// Same shape with records left unparsed, so each table can fail alone.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    schema_version: u32,
    #[serde(default)]
    songs: Option<Vec<Value>>,
    #[serde(default)]
    playlists: Option<Vec<Value>>,
    #[serde(default)]
    settings: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOutcome {
    Imported(usize),
    /// Table left untouched.
    Failed(String),
    /// Not present in the document.
    Skipped,
}

impl TableOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TableOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub songs: TableOutcome,
    pub playlists: TableOutcome,
    pub settings: TableOutcome,
}

impl ImportReport {
    pub fn any_failed(&self) -> bool {
        self.songs.is_failed() || self.playlists.is_failed() || self.settings.is_failed()
    }
}

impl ExportDocument {
    /// Snapshot the library. Records are ordered by id so equal libraries
    /// export to equal documents.
    pub fn from_library(library: &LibraryService) -> Result<Self> {
        let mut songs = library.load_all_songs()?;
        songs.sort_by(|a, b| a.id.cmp(&b.id));
        let mut playlists = library.load_all_playlists()?;
        playlists.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            songs,
            playlists,
            settings: library.load_settings()?,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        info!(
            "Exported {} songs and {} playlists to {}",
            self.songs.len(),
            self.playlists.len(),
            path.display()
        );
        Ok(())
    }
}

pub fn export_to_file(library: &LibraryService, path: &Path) -> Result<ExportDocument> {
    let document = ExportDocument::from_library(library)?;
    document.write_to(path)?;
    Ok(document)
}

pub fn import_from_file(library: &LibraryService, path: &Path) -> Result<ImportReport> {
    let json = fs::read_to_string(path)?;
    import_json(library, &json)
}

/// Replace library tables with the document's. A document that is not
/// JSON, or comes from a newer schema, changes nothing.
pub fn import_json(library: &LibraryService, json: &str) -> Result<ImportReport> {
    let raw: RawDocument = serde_json::from_str(json)
        .map_err(|e| EngineError::SerializationError(format!("import document: {}", e)))?;
    if raw.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(EngineError::SchemaIncompatible {
            found: raw.schema_version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    let store = library.store();
    let songs = match raw.songs {
        Some(values) => replace_table::<Song>(library, values, |_| Ok(())),
        None => TableOutcome::Skipped,
    };
    let playlists = match raw.playlists {
        Some(values) => replace_table::<Playlist>(library, values, |p| {
            if p.is_system_playlist != p.system_kind.is_some() {
                return Err(EngineError::invalid(format!("playlist {} has inconsistent system flags", p.id)));
            }
            Ok(())
        }),
        None => TableOutcome::Skipped,
    };
    let settings = match raw.settings {
        Some(value) => match serde_json::from_value::<PlaybackSettings>(value)
            .map_err(EngineError::from)
            .and_then(|s| s.validate().map(|_| s))
            .and_then(|s| store.put(&s))
        {
            Ok(()) => TableOutcome::Imported(1),
            Err(e) => {
                warn!("Import of settings aborted: {}", e);
                TableOutcome::Failed(e.to_string())
            }
        },
        None => TableOutcome::Skipped,
    };

    // Imported playlists may point at songs the imported catalog lacks
    library.invalidate_caches();
    library.reconcile()?;

    let report = ImportReport {
        songs,
        playlists,
        settings,
    };
    info!("Import finished: {:?}", report);
    Ok(report)
}

fn replace_table<T: Record>(
    library: &LibraryService,
    values: Vec<Value>,
    check: impl Fn(&T) -> Result<()>,
) -> TableOutcome {
    let table = T::TABLE.name();
    let parsed: Result<Vec<T>> = values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let record: T = serde_json::from_value(value)
                .map_err(|e| EngineError::SerializationError(format!("{} record {}: {}", table, index, e)))?;
            check(&record)?;
            Ok(record)
        })
        .collect();

    match parsed.and_then(|records| library.store().replace_all(&records).map(|_| records.len())) {
        Ok(count) => TableOutcome::Imported(count),
        Err(e) => {
            warn!("Import of {} aborted: {}", table, e);
            TableOutcome::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RepeatMode, SystemKind};
    use crate::store::PersistentStore;
    use std::path::PathBuf;

    fn library() -> LibraryService {
        LibraryService::open(PersistentStore::open_in_memory().unwrap()).unwrap()
    }

    fn song(name: &str) -> Song {
        let mut song = Song::new(PathBuf::from(format!("/music/{}.mp3", name)), name);
        song.duration = 180_000;
        song
    }

    fn populated() -> LibraryService {
        let lib = library();
        let songs = vec![song("a"), song("b"), song("c")];
        lib.upsert_songs(songs.clone()).unwrap();
        lib.toggle_like(&songs[1].id).unwrap();
        lib.record_play(&songs[0].id).unwrap();
        let mix = lib.create_playlist("Road trip", Some("long drives".into())).unwrap();
        lib.add_song_to_playlist(&mix.id, &songs[2].id).unwrap();
        lib.add_song_to_playlist(&mix.id, &songs[0].id).unwrap();
        let mut settings = PlaybackSettings::default();
        settings.repeat_mode = RepeatMode::All;
        settings.playback_speed = 1.25;
        lib.save_settings(&settings).unwrap();
        lib
    }

    #[test]
    fn export_then_import_reproduces_the_library() {
        let source = populated();
        let exported = ExportDocument::from_library(&source).unwrap();

        let target = library();
        let report = import_json(&target, &exported.to_json().unwrap()).unwrap();
        assert_eq!(report.songs, TableOutcome::Imported(3));
        assert!(!report.any_failed());

        let reimported = ExportDocument::from_library(&target).unwrap();
        assert_eq!(reimported, exported);
        assert_eq!(target.liked_songs().unwrap().len(), 1);
    }

    #[test]
    fn a_bad_record_keeps_only_its_table() {
        let lib = populated();
        let before = lib.load_all_songs().unwrap();

        let doc = serde_json::json!({
            "schemaVersion": CURRENT_SCHEMA_VERSION,
            "songs": [{ "id": "broken" }],
            "playlists": [],
            "settings": { "volume": 4.0 }
        });
        let report = import_json(&lib, &doc.to_string()).unwrap();

        assert!(report.songs.is_failed());
        assert_eq!(report.playlists, TableOutcome::Imported(0));
        assert!(report.settings.is_failed());
        assert_eq!(lib.load_all_songs().unwrap(), before);
        assert_eq!(lib.load_settings().unwrap().repeat_mode, RepeatMode::All);
        // System playlists come back even when the import dropped them
        assert!(lib.get_playlist(SystemKind::Liked.playlist_id()).unwrap().is_some());
    }

    #[test]
    fn newer_documents_are_refused() {
        let lib = library();
        let doc = serde_json::json!({ "schemaVersion": CURRENT_SCHEMA_VERSION + 1 });
        let err = import_json(&lib, &doc.to_string()).unwrap_err();
        assert!(matches!(err, EngineError::SchemaIncompatible { .. }));
        assert!(matches!(
            import_json(&lib, "not json").unwrap_err(),
            EngineError::SerializationError(_)
        ));
    }

    #[test]
    fn files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        let source = populated();
        let exported = export_to_file(&source, &path).unwrap();

        let target = library();
        import_from_file(&target, &path).unwrap();
        assert_eq!(ExportDocument::from_library(&target).unwrap(), exported);
    }
}
