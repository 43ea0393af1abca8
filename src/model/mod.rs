// Plain data records shared by the store, the library and the engine
// Records are values: mutations produce new copies that get persisted

pub mod playlist;
pub mod queue;
pub mod settings;
pub mod song;

pub use playlist::{normalize_playlist_name, Playlist, SystemKind};
pub use queue::{MediaItem, QueueItem, QueueSnapshot};
pub use settings::{EqualizerBands, PlaybackSettings, RepeatMode};
pub use song::{is_audio_extension, song_id_for_path, Song, AUDIO_EXTENSIONS};
