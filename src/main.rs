// offtune - command line front end for the playback core
// Scans, lists, plays and moves a library in and out of JSON

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use offtune::config::Config;
use offtune::coordinator::CoordinatorOptions;
use offtune::engine::{AudioBackend, EngineState, NullBackend};
use offtune::export;
use offtune::logging::init_logging;
use offtune::scanner::{scan_into_library, ScanProgress};
use offtune::session::{MediaSession, NullSession, SessionSignal};
use offtune::{LibraryService, MetadataScanner, PersistentStore, PlayContext, PlaybackCoordinator};

#[derive(Parser)]
#[command(name = "offtune")]
#[command(about = "Offline music player core with a small command line")]
struct Args {
    /// Enable developer logging (stderr + debug output)
    #[arg(long)]
    dev: bool,

    /// Use this config file instead of the default one
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan folders into the library (defaults to the configured ones)
    Scan { paths: Vec<PathBuf> },
    /// List songs
    Songs {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        liked: bool,
    },
    /// List playlists
    Playlists,
    /// Play a playlist, a song, or the whole library
    Play {
        #[arg(long)]
        playlist: Option<String>,
        #[arg(long)]
        song: Option<String>,
        #[arg(long)]
        shuffle: bool,
        /// Stop after this many minutes
        #[arg(long)]
        sleep: Option<u32>,
    },
    /// Write the library to a JSON file
    Export { path: PathBuf },
    /// Replace the library with a JSON file's contents
    Import { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let _guard = init_logging(&config.log_dir(), args.dev)?;
    info!("offtune starting, data dir {}", config.data_dir.display());

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let store = PersistentStore::open(&config.database_path())?;

    match args.command {
        Command::Scan { paths } => {
            let library = LibraryService::open(store)?;
            let roots = if paths.is_empty() { config.music_directories.clone() } else { paths };
            scan(&config, library, roots).await
        }
        Command::Songs { search, liked } => {
            let library = LibraryService::open(store)?;
            let songs = match (search, liked) {
                (Some(query), _) => library.search_songs(&query)?,
                (None, true) => library.liked_songs()?,
                (None, false) => library.load_all_songs()?,
            };
            for song in songs {
                let flag = if song.missing { " (missing)" } else { "" };
                println!("{}  {} - {}  [{} plays]{}", song.id, song.artist, song.title, song.play_count, flag);
            }
            Ok(())
        }
        Command::Playlists => {
            let library = LibraryService::open(store)?;
            for playlist in library.load_all_playlists()? {
                println!("{}  {}  ({} songs)", playlist.id, playlist.name, playlist.song_ids.len());
            }
            Ok(())
        }
        Command::Play { playlist, song, shuffle, sleep } => play(&config, store, playlist, song, shuffle, sleep).await,
        Command::Export { path } => {
            let library = LibraryService::open(store)?;
            let document = export::export_to_file(&library, &path)?;
            println!("Exported {} songs, {} playlists", document.songs.len(), document.playlists.len());
            Ok(())
        }
        Command::Import { path } => {
            let library = LibraryService::open(store)?;
            let report = export::import_from_file(&library, &path)?;
            println!("songs: {:?}\nplaylists: {:?}\nsettings: {:?}", report.songs, report.playlists, report.settings);
            if report.any_failed() {
                bail!("some tables were not imported");
            }
            Ok(())
        }
    }
}

async fn scan(config: &Config, library: LibraryService, roots: Vec<PathBuf>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(32);
    let printer = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            match progress {
                ScanProgress::BatchStored { stored, total } => println!("stored {}/{}", stored, total),
                ScanProgress::FileFailed { path, reason } => eprintln!("skipped {}: {}", path.display(), reason),
                ScanProgress::Completed { songs, failures, missing } => {
                    println!("done: {} songs, {} failures, {} missing", songs, failures, missing)
                }
                ScanProgress::Cancelled { songs } => println!("cancelled after {} songs", songs),
                ScanProgress::Started { .. } => {}
            }
        }
    });

    let scanner = MetadataScanner::new(config.scan_options());
    let result = scan_into_library(scanner, library, roots, CancellationToken::new(), Some(tx)).await;
    let _ = printer.await;
    result?;
    Ok(())
}

async fn play(
    config: &Config,
    store: PersistentStore,
    playlist: Option<String>,
    song: Option<String>,
    shuffle: bool,
    sleep: Option<u32>,
) -> Result<()> {
    let mut options = CoordinatorOptions::from(config);
    // The CLI plays what is already in the library
    options.background_scan = false;

    let os_controls = config.session.os_media_controls;
    let coordinator = PlaybackCoordinator::start(store, options, make_backend, move |signals| {
        make_session(os_controls, signals)
    })
    .await?;

    let started = match (playlist, song) {
        (Some(id), _) if shuffle => coordinator.shuffle_playlist(&id).await,
        (Some(id), Some(song)) => coordinator.play_song_in_context(&song, PlayContext::Playlist(id)).await,
        (Some(id), None) => coordinator.play_playlist(&id).await,
        (None, Some(song)) => coordinator.play_song_in_context(&song, PlayContext::Library).await,
        (None, None) => {
            let first = coordinator
                .library()
                .load_all_songs()?
                .into_iter()
                .find(|s| !s.missing)
                .context("the library is empty, run `offtune scan` first")?;
            coordinator.play_song_in_context(&first.id, PlayContext::Library).await
        }
    };
    if let Err(e) = started {
        coordinator.shutdown().await.ok();
        bail!("could not start playback: {}", e);
    }
    if sleep.is_some() {
        coordinator.set_sleep_timer(sleep).await?;
    }

    let mut current = coordinator.engine().current_item();
    let mut status = coordinator.engine().playback_state();
    loop {
        tokio::select! {
            changed = current.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(item) = current.borrow_and_update().clone() {
                    println!("> {} - {}", item.artist, item.title);
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = status.borrow_and_update().state;
                if matches!(state, EngineState::Stopped | EngineState::Idle) {
                    break;
                }
            }
        }
    }

    coordinator.shutdown().await?;
    Ok(())
}

fn make_backend() -> offtune::Result<Box<dyn AudioBackend>> {
    #[cfg(feature = "audio")]
    {
        match offtune::engine::rodio_backend::RodioBackend::try_default() {
            Ok(backend) => return Ok(Box::new(backend)),
            Err(e) => warn!("No audio output ({}), playing silently", e.reason()),
        }
    }
    Ok(Box::new(NullBackend::default()))
}

fn make_session(os_controls: bool, signals: mpsc::UnboundedSender<SessionSignal>) -> Box<dyn MediaSession> {
    #[cfg(feature = "media-controls")]
    if os_controls {
        if let Some(session) = offtune::session::platform::OsMediaSession::connect(signals) {
            return Box::new(session);
        }
    }
    #[cfg(not(feature = "media-controls"))]
    let _ = (os_controls, signals);
    Box::new(NullSession)
}
