// offtune - offline music playback core
// Library, scanner, gapless engine and media session glue behind one coordinator

pub mod config;      // TOML settings file
pub mod coordinator; // composition root the UI talks to
pub mod engine;      // queue, state machine, audio renderer
pub mod error;       // error kinds + user-facing mapping
pub mod export;      // JSON export/import
pub mod library;     // typed facade over the store
pub mod logging;     // tracing setup
pub mod model;       // plain records
pub mod scanner;     // filesystem -> songs
pub mod session;     // OS media session bridge
pub mod store;       // SQLite persistence

// The handful of types most callers need
pub use config::Config;
pub use coordinator::{PlayContext, PlaybackCoordinator};
pub use engine::PlaybackEngine;
pub use error::{EngineError, Result, UserFacingError};
pub use library::LibraryService;
pub use scanner::MetadataScanner;
pub use store::PersistentStore;
