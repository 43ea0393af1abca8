// Background scan -> library ingest
// Runs the blocking walk on the blocking pool; every batch is written to the
// store before the next one is pulled

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::probe::TagProbe;
use super::{MetadataScanner, ScanReport};
use crate::error::{EngineError, Result};
use crate::library::LibraryService;
use crate::model::Song;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanProgress {
    Started { roots: usize },
    BatchStored { stored: usize, total: usize },
    FileFailed { path: PathBuf, reason: String },
    Completed { songs: usize, failures: usize, missing: usize },
    Cancelled { songs: usize },
}

/// Keep identity and listening stats of songs already in the library.
fn merge_with_existing(library: &LibraryService, batch: Vec<Song>) -> Result<Vec<Song>> {
    let ids: Vec<String> = batch.iter().map(|s| s.id.clone()).collect();
    let existing: HashMap<String, Song> = library
        .get_songs_by_ids(&ids)?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();

    Ok(batch
        .into_iter()
        .map(|scanned| match existing.get(&scanned.id) {
            Some(stored) => stored.refreshed_from_scan(scanned),
            None => scanned,
        })
        .collect())
}

fn ingest_blocking<P: TagProbe>(
    scanner: &mut MetadataScanner<P>,
    library: &LibraryService,
    roots: &[PathBuf],
    cancel: &CancellationToken,
    progress: Option<&mpsc::Sender<ScanProgress>>,
) -> Result<ScanReport> {
    let notify = |event: ScanProgress| {
        if let Some(tx) = progress {
            // Receiver may have gone away; the scan carries on regardless
            let _ = tx.blocking_send(event);
        }
    };

    notify(ScanProgress::Started { roots: roots.len() });

    let mut stored = 0usize;
    let mut reported_failures = 0usize;
    let mut cancelled = false;
    let mut batches = scanner.scan(roots);
    loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        let next = batches.next();

        let failures = &batches.report().failures;
        for failure in &failures[reported_failures..] {
            notify(ScanProgress::FileFailed {
                path: failure.path.clone(),
                reason: failure.reason.clone(),
            });
        }
        reported_failures = failures.len();

        let Some(batch) = next else {
            break;
        };
        let batch = merge_with_existing(library, batch?)?;
        let count = batch.len();
        library.upsert_songs(batch)?;
        stored += count;
        notify(ScanProgress::BatchStored { stored: count, total: stored });
    }
    drop(batches);
    let report = scanner.take_report();

    if cancelled {
        info!("Scan cancelled after {} songs", stored);
        notify(ScanProgress::Cancelled { songs: stored });
        return Ok(report);
    }

    let missing = library.mark_missing(&report.roots, &report.seen)?;
    info!(
        songs = stored,
        failures = reported_failures,
        missing,
        "Library scan complete"
    );
    notify(ScanProgress::Completed {
        songs: stored,
        failures: reported_failures,
        missing,
    });
    Ok(report)
}

/// Scan `roots` into the library. Cancellation is honored between batches;
/// whatever was stored before that stays stored.
pub async fn scan_into_library<P>(
    mut scanner: MetadataScanner<P>,
    library: LibraryService,
    roots: Vec<PathBuf>,
    cancel: CancellationToken,
    progress: Option<mpsc::Sender<ScanProgress>>,
) -> Result<ScanReport>
where
    P: TagProbe + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        ingest_blocking(&mut scanner, &library, &roots, &cancel, progress.as_ref())
    })
    .await;

    match joined {
        Ok(result) => {
            if let Err(e) = &result {
                warn!("Library scan failed: {}", e);
            }
            result
        }
        Err(e) => Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("scan task failed: {}", e),
        ))),
    }
}
