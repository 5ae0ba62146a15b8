use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future;
use indicatif::MultiProgress;
use log::debug;
use thiserror::Error;
use tokio::fs::File;
use tokio::sync::mpsc;

use crate::bitmap::{AtomicBitmap, BitmapError};
use crate::planner::{self, PlanError};
use crate::progress_reporter::ProgressReporter;
use crate::scanner::{ChunkScanner, ChunkStats, ScanError, ScanOptions};
use crate::shared_types::{ByteCount, ChunkRange};

#[derive(Error, Debug)]
#[error("chunk {range} failed: {source}")]
pub(crate) struct ChunkFailure {
    pub(crate) range: ChunkRange,
    #[source]
    pub(crate) source: ScanError,
}

#[derive(Error, Debug)]
pub(crate) enum CountError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to get file metadata: {0}")]
    Metadata(#[source] std::io::Error),
    #[error("failed to calculate file chunks: {0}")]
    Plan(#[from] PlanError),
    #[error("failed to allocate the address bitmap: {0}")]
    Bitmap(#[from] BitmapError),
    #[error(
        "{} of {chunk_count} chunks failed, count of {partial_count} may be incomplete: {}",
        .failures.len(),
        join_failures(.failures)
    )]
    Chunks {
        partial_count: u64,
        chunk_count: usize,
        failures: Vec<ChunkFailure>,
    },
}

fn join_failures(failures: &[ChunkFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub(crate) struct CountPreferences {
    pub(crate) path: PathBuf,
    pub(crate) worker_count: NonZeroUsize,
    pub(crate) scan: ScanOptions,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CountSummary {
    pub(crate) unique: u64,
    pub(crate) malformed_lines: u64,
    pub(crate) bytes_scanned: ByteCount,
    pub(crate) file_size: ByteCount,
}

/// Counts the distinct IPv4 addresses in the file named by `prefs`.
///
/// One scanner task runs per planned chunk and every task is awaited, failed
/// or not. Chunk failures are merged into [`CountError::Chunks`], which still
/// carries the count reached by the chunks that did run. Progress is drawn on
/// `multi` when one is given.
pub(crate) async fn count_unique(
    prefs: CountPreferences,
    multi: Option<MultiProgress>,
) -> Result<CountSummary, CountError> {
    let mut file = File::open(&prefs.path)
        .await
        .map_err(|source| CountError::Open {
            path: prefs.path.clone(),
            source,
        })?;
    let file_size = file.metadata().await.map_err(CountError::Metadata)?.len();
    debug!("file size: {file_size}");

    let chunks = planner::plan_chunks(&mut file, file_size, prefs.worker_count).await?;
    drop(file);
    debug!("scanning with {} workers: {:?}", chunks.len(), chunks);

    let bitmap = Arc::new(AtomicBitmap::ipv4()?);
    debug!("allocated bitmap for {} addresses", bitmap.capacity());
    let unique = Arc::new(AtomicU64::new(0));

    let (s_progress, reporter) = match multi {
        Some(multi) => {
            let (s_progress, r_progress) = mpsc::channel::<ByteCount>(prefs.worker_count.get());
            let reporter = ProgressReporter::new(r_progress, Some(file_size), multi).spawn();
            (Some(s_progress), Some(reporter))
        }
        None => (None, None),
    };

    let scanner = ChunkScanner::new(
        Arc::from(prefs.path.as_path()),
        bitmap,
        unique.clone(),
        prefs.scan,
        s_progress,
    );

    let handles = chunks
        .iter()
        .map(|&range| {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.scan(range).await })
        })
        .collect::<Vec<_>>();
    // the reporter stops once the last progress sender is gone
    drop(scanner);

    let results = future::join_all(handles).await;
    if let Some(reporter) = reporter {
        reporter.await.ok();
    }

    let mut summary = CountSummary {
        file_size,
        ..Default::default()
    };
    let mut failures = Vec::new();
    for (range, result) in chunks.iter().zip(results) {
        let outcome =
            result.unwrap_or_else(|join_err| Err(ScanError::Panicked(join_err.to_string())));
        match outcome {
            Ok(ChunkStats {
                unique,
                malformed_lines,
                bytes_scanned,
            }) => {
                debug!(
                    "chunk {range} done: {bytes_scanned}/{} bytes, {unique} new, {malformed_lines} malformed",
                    range.len()
                );
                summary.malformed_lines += malformed_lines;
                summary.bytes_scanned += bytes_scanned;
            }
            Err(source) => failures.push(ChunkFailure {
                range: *range,
                source,
            }),
        }
    }

    summary.unique = unique.load(Ordering::Acquire);
    if failures.is_empty() {
        Ok(summary)
    } else {
        Err(CountError::Chunks {
            partial_count: summary.unique,
            chunk_count: chunks.len(),
            failures,
        })
    }
}
