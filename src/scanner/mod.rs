// Filesystem scan -> Song batches
// Walks roots lazily, probes each candidate with one long-lived probe and
// yields fixed-size batches so ingest can apply backpressure

pub mod artwork;
pub mod filename;
pub mod ingest;
pub mod probe;

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{EngineError, Result};
use crate::model::{Song, AUDIO_EXTENSIONS};
use artwork::ArtworkCache;
use filename::FilenameParser;
use probe::{FileTagProbe, ProbedTags, TagProbe};

pub use ingest::{scan_into_library, ScanProgress};

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub recursive: bool,
    /// Lowercase, without the dot.
    pub extensions: Vec<String>,
    pub max_file_size: u64,
    pub follow_symlinks: bool,
    pub batch_size: usize,
    pub artwork_dir: Option<PathBuf>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            extensions: AUDIO_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            follow_symlinks: false,
            batch_size: DEFAULT_BATCH_SIZE,
            artwork_dir: None,
        }
    }
}

impl ScanOptions {
    fn accepts_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let normalized = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| *e == normalized)
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// What one scan saw. `seen` feeds missing-file marking afterwards.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub roots: Vec<PathBuf>,
    pub candidates: usize,
    pub songs: usize,
    pub skipped_oversize: usize,
    pub failures: Vec<ScanFailure>,
    pub seen: HashSet<String>,
}

pub struct MetadataScanner<P = FileTagProbe> {
    probe: P,
    options: ScanOptions,
    names: FilenameParser,
    artwork: Option<ArtworkCache>,
    report: ScanReport,
}

impl MetadataScanner<FileTagProbe> {
    pub fn new(options: ScanOptions) -> Self {
        Self::with_probe(FileTagProbe::new(), options)
    }
}

impl<P: TagProbe> MetadataScanner<P> {
    pub fn with_probe(probe: P, options: ScanOptions) -> Self {
        let artwork = options.artwork_dir.clone().map(ArtworkCache::new);
        Self {
            probe,
            options,
            names: FilenameParser::new(),
            artwork,
            report: ScanReport::default(),
        }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn report(&self) -> &ScanReport {
        &self.report
    }

    pub fn take_report(&mut self) -> ScanReport {
        std::mem::take(&mut self.report)
    }

    /// Start a scan. Nothing touches the filesystem beyond the root checks
    /// until the returned iterator is pulled.
    pub fn scan(&mut self, roots: &[PathBuf]) -> ScanBatches<'_, P> {
        self.report = ScanReport::default();

        let mut readable = VecDeque::new();
        for root in roots {
            match fs::read_dir(root) {
                Ok(_) => {
                    let root = fs::canonicalize(root).unwrap_or_else(|_| root.clone());
                    self.report.roots.push(root.clone());
                    readable.push_back(root);
                }
                Err(e) => warn!("Cannot read music directory {}: {}", root.display(), e),
            }
        }

        let pending_error = if !roots.is_empty() && readable.is_empty() {
            Some(EngineError::PermissionDenied(format!(
                "none of {} music directories is readable",
                roots.len()
            )))
        } else {
            None
        };

        info!("Scanning {} of {} music directories", readable.len(), roots.len());
        ScanBatches {
            scanner: self,
            roots: readable,
            walker: None,
            pending_error,
            finished: false,
        }
    }

    /// Validate, probe and build one song. Every failure here is a
    /// `DecoderFailure` for the caller to absorb.
    pub fn scan_file(&mut self, path: &Path) -> Result<Song> {
        let failure = |reason: String| EngineError::DecoderFailure {
            path: path.display().to_string(),
            reason,
        };

        let meta = fs::metadata(path).map_err(|e| failure(e.to_string()))?;
        if meta.len() == 0 {
            return Err(failure("empty file".to_string()));
        }

        let tags = self.probe.probe(path)?;
        Ok(self.build_song(path, tags))
    }

    fn build_song(&self, path: &Path, tags: ProbedTags) -> Song {
        let file_path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let tagged_title = non_empty(tags.title);
        let tagged_artist = non_empty(tags.artist);
        let parsed = if tagged_title.is_none() || tagged_artist.is_none() {
            Some(self.names.parse(stem))
        } else {
            None
        };

        let title = tagged_title
            .or_else(|| parsed.as_ref().map(|p| p.title.clone()))
            .unwrap_or_else(|| stem.to_string());
        let mut song = Song::new(file_path.clone(), title);
        if let Some(artist) = tagged_artist.or_else(|| parsed.as_ref().and_then(|p| p.artist.clone())) {
            song.artist = artist;
        }
        if let Some(album) = non_empty(tags.album) {
            song.album = album;
        }
        song.genre = non_empty(tags.genre);
        song.year = tags.year;
        song.track_number = tags.track_number.or_else(|| parsed.as_ref().and_then(|p| p.track_number));
        song.duration = tags.duration.map(|d| d.as_millis() as u64).unwrap_or(0);

        if let (Some(cache), Some(art)) = (&self.artwork, &tags.artwork) {
            match cache.store(art) {
                Ok(art_path) => song.album_art_path = Some(art_path),
                Err(e) => warn!("Could not cache artwork for {}: {}", path.display(), e),
            }
        }

        let lyrics = file_path.with_extension("lrc");
        if lyrics.is_file() {
            song.lyrics_path = Some(lyrics);
        }

        song
    }

    fn record_failure(&mut self, path: &Path, err: &EngineError) {
        warn!(
            kind = "DecoderFailure",
            path = %path.display(),
            "Skipping file: {}",
            err
        );
        self.report.failures.push(ScanFailure {
            path: path.to_path_buf(),
            reason: err.to_string(),
        });
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map_or(false, |name| name.starts_with('.'))
}

type Walker = walkdir::FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>;

/// Lazy batched scan. Yields `Ok(batch)` until the roots are exhausted;
/// when no root was readable the only item is `Err(PermissionDenied)`.
pub struct ScanBatches<'a, P> {
    scanner: &'a mut MetadataScanner<P>,
    roots: VecDeque<PathBuf>,
    walker: Option<Walker>,
    pending_error: Option<EngineError>,
    finished: bool,
}

impl<P: TagProbe> ScanBatches<'_, P> {
    /// Running totals for the scan in progress.
    pub fn report(&self) -> &ScanReport {
        &self.scanner.report
    }

    fn next_candidate(&mut self) -> Option<PathBuf> {
        loop {
            if self.walker.is_none() {
                let root = self.roots.pop_front()?;
                let options = &self.scanner.options;
                let depth = if options.recursive { usize::MAX } else { 1 };
                let keep: fn(&DirEntry) -> bool = |e| !is_hidden(e);
                self.walker = Some(
                    WalkDir::new(root)
                        .follow_links(options.follow_symlinks)
                        .max_depth(depth)
                        .into_iter()
                        .filter_entry(keep),
                );
            }

            let entry = match self.walker.as_mut().and_then(|w| w.next()) {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    debug!("Walk error: {}", e);
                    continue;
                }
                None => {
                    self.walker = None;
                    continue;
                }
            };

            // Without follow_links symlinks report as neither file nor dir
            if !entry.file_type().is_file() || !self.scanner.options.accepts_extension(entry.path()) {
                continue;
            }

            self.scanner.report.candidates += 1;
            if let Ok(meta) = entry.metadata() {
                if meta.len() > self.scanner.options.max_file_size {
                    debug!("Skipping oversize file {} ({} bytes)", entry.path().display(), meta.len());
                    self.scanner.report.skipped_oversize += 1;
                    continue;
                }
            }
            return Some(entry.into_path());
        }
    }
}

impl<P: TagProbe> Iterator for ScanBatches<'_, P> {
    type Item = Result<Vec<Song>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(err) = self.pending_error.take() {
            self.finished = true;
            return Some(Err(err));
        }

        let batch_size = self.scanner.options.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            let Some(path) = self.next_candidate() else {
                break;
            };
            match self.scanner.scan_file(&path) {
                Ok(song) => {
                    self.scanner.report.songs += 1;
                    self.scanner.report.seen.insert(song.id.clone());
                    batch.push(song);
                }
                Err(e) => self.scanner.record_failure(&path, &e),
            }
        }

        if batch.is_empty() {
            self.finished = true;
            info!(
                songs = self.scanner.report.songs,
                failures = self.scanner.report.failures.len(),
                "Scan finished"
            );
            None
        } else {
            Some(Ok(batch))
        }
    }
}
