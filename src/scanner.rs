use std::io::SeekFrom;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;

use crate::bitmap::{AtomicBitmap, BitmapError};
use crate::planner::LINE_TERMINATOR;
use crate::shared_types::{ByteCount, ChunkRange};

const READ_BUFFER_SIZE: usize = 256 * 1024;
const PROGRESS_STEP: ByteCount = 1024 * 1024;

#[derive(Error, Debug)]
pub(crate) enum ScanError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to seek to offset {offset}: {source}")]
    Seek {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read line at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("line at offset {offset} has no terminator")]
    UnterminatedLine { offset: u64 },
    #[error("input ended at offset {offset}, before the chunk end {end}")]
    Truncated { offset: u64, end: u64 },
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
    #[error("scanner task panicked: {0}")]
    Panicked(String),
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ScanOptions {
    /// Count a final line that ends at end-of-file without a terminator
    /// instead of failing the chunk.
    pub(crate) accept_unterminated: bool,
}

/// What one scanner saw in its range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ChunkStats {
    pub(crate) unique: u64,
    pub(crate) malformed_lines: u64,
    pub(crate) bytes_scanned: ByteCount,
}

/// Reads the lines of one byte range and records their addresses in the
/// shared bitmap.
///
/// Cloning is cheap; every clone shares the bitmap, the unique counter and the
/// progress channel.
#[derive(Clone)]
pub(crate) struct ChunkScanner {
    path: Arc<Path>,
    bitmap: Arc<AtomicBitmap>,
    unique: Arc<AtomicU64>,
    options: ScanOptions,
    s_progress: Option<mpsc::Sender<ByteCount>>,
}

impl ChunkScanner {
    pub(crate) fn new(
        path: Arc<Path>,
        bitmap: Arc<AtomicBitmap>,
        unique: Arc<AtomicU64>,
        options: ScanOptions,
        s_progress: Option<mpsc::Sender<ByteCount>>,
    ) -> Self {
        Self {
            path,
            bitmap,
            unique,
            options,
            s_progress,
        }
    }

    /// Opens a private handle to the file and scans `range` through it.
    pub(crate) async fn scan(&self, range: ChunkRange) -> Result<ChunkStats, ScanError> {
        if range.is_empty() {
            return Ok(ChunkStats::default());
        }

        let mut file = File::open(&self.path)
            .await
            .map_err(|source| ScanError::Open {
                path: self.path.to_path_buf(),
                source,
            })?;
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(|source| ScanError::Seek {
                offset: range.start,
                source,
            })?;

        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        self.scan_lines(&mut reader, range).await
    }

    /// Consumes lines from `reader`, positioned at `range.start`, until
    /// `range.end` is reached.
    pub(crate) async fn scan_lines<R>(
        &self,
        reader: &mut R,
        range: ChunkRange,
    ) -> Result<ChunkStats, ScanError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut stats = ChunkStats::default();
        let mut position = range.start;
        let mut unreported: ByteCount = 0;
        let mut line = Vec::with_capacity(32);

        while position < range.end {
            line.clear();
            let read = reader
                .read_until(LINE_TERMINATOR, &mut line)
                .await
                .map_err(|source| ScanError::Read {
                    offset: position,
                    source,
                })?;
            if read == 0 {
                return Err(ScanError::Truncated {
                    offset: position,
                    end: range.end,
                });
            }
            if line.last() != Some(&LINE_TERMINATOR) && !self.options.accept_unterminated {
                return Err(ScanError::UnterminatedLine { offset: position });
            }

            let line_start = position;
            position += read as u64;
            stats.bytes_scanned += read as u64;

            let text = strip_terminator(&line);
            match parse_address(text) {
                Some(address) => {
                    if self.bitmap.set(address)? {
                        self.unique.fetch_add(1, Ordering::Relaxed);
                        stats.unique += 1;
                    }
                }
                None => {
                    stats.malformed_lines += 1;
                    warn!(
                        "invalid IP address at offset {line_start}: {:?}",
                        String::from_utf8_lossy(text)
                    );
                }
            }

            unreported += read as u64;
            if unreported >= PROGRESS_STEP {
                self.report_progress(unreported);
                unreported = 0;
            }
        }

        self.report_progress(unreported);
        Ok(stats)
    }

    fn report_progress(&self, bytes: ByteCount) {
        if bytes == 0 {
            return;
        }
        if let Some(s_progress) = &self.s_progress {
            s_progress.try_send(bytes).ok();
        }
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(&[LINE_TERMINATOR]).unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parses dotted-decimal text into its address index, most significant octet
/// first, so `1.0.0.0` is `1 << 24`.
pub(crate) fn parse_address(text: &[u8]) -> Option<u32> {
    std::str::from_utf8(text)
        .ok()?
        .parse::<Ipv4Addr>()
        .ok()
        .map(u32::from)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use super::*;

    fn scanner(options: ScanOptions) -> (ChunkScanner, Arc<AtomicBitmap>, Arc<AtomicU64>) {
        let bitmap = Arc::new(AtomicBitmap::ipv4().unwrap());
        let unique = Arc::new(AtomicU64::new(0));
        let scanner = ChunkScanner::new(
            Arc::from(Path::new("unused")),
            bitmap.clone(),
            unique.clone(),
            options,
            None,
        );
        (scanner, bitmap, unique)
    }

    fn whole(data: &[u8]) -> ChunkRange {
        ChunkRange {
            start: 0,
            end: data.len() as u64,
        }
    }

    #[test]
    fn address_is_most_significant_octet_first() {
        assert_eq!(parse_address(b"0.0.0.1"), Some(1));
        assert_eq!(parse_address(b"1.0.0.0"), Some(1 << 24));
        assert_eq!(parse_address(b"255.255.255.255"), Some(u32::MAX));
        assert_eq!(parse_address(b"97.71.174.4"), Some(0x6147_ae04));
    }

    #[test]
    fn malformed_text_does_not_parse() {
        let cases: [&[u8]; 7] = [
            b"",
            b"1.2.3",
            b"1.2.3.4.5",
            b"256.0.0.1",
            b"::1",
            b"1.2.3.4 ",
            b"\xff\xfe",
        ];
        for text in cases {
            assert_eq!(parse_address(text), None, "{:?}", text);
        }
    }

    #[tokio::test]
    async fn counts_distinct_addresses() {
        let data = b"97.71.174.4\n97.71.173.241\n97.71.173.235\n97.71.174.4\n";
        let (scanner, bitmap, unique) = scanner(ScanOptions::default());

        let stats = scanner
            .scan_lines(&mut Cursor::new(&data[..]), whole(data))
            .await
            .unwrap();

        assert_eq!(stats.unique, 3);
        assert_eq!(stats.malformed_lines, 0);
        assert_eq!(stats.bytes_scanned, data.len() as u64);
        assert_eq!(unique.load(Ordering::Relaxed), 3);
        assert!(bitmap.is_set(parse_address(b"97.71.173.241").unwrap()).unwrap());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let data = b"10.0.0.1\nnot an address\n\n10.0.0.2\r\n10.0.0.1\n";
        let (scanner, _, unique) = scanner(ScanOptions::default());

        let stats = scanner
            .scan_lines(&mut Cursor::new(&data[..]), whole(data))
            .await
            .unwrap();

        assert_eq!(stats.unique, 2);
        assert_eq!(stats.malformed_lines, 2);
        assert_eq!(unique.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn stops_at_range_end() {
        let data = b"10.0.0.1\n10.0.0.2\n10.0.0.3\n";
        let (scanner, bitmap, _) = scanner(ScanOptions::default());

        let stats = scanner
            .scan_lines(&mut Cursor::new(&data[..]), ChunkRange { start: 0, end: 18 })
            .await
            .unwrap();

        assert_eq!(stats.unique, 2);
        assert_eq!(stats.bytes_scanned, 18);
        assert!(!bitmap.is_set(parse_address(b"10.0.0.3").unwrap()).unwrap());
    }

    #[tokio::test]
    async fn unterminated_final_line_fails_by_default() {
        let data = b"10.0.0.1\n10.0.0.2";
        let (scanner, _, unique) = scanner(ScanOptions::default());

        let err = scanner
            .scan_lines(&mut Cursor::new(&data[..]), whole(data))
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::UnterminatedLine { offset: 9 }));
        // the terminated line before it was still counted
        assert_eq!(unique.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unterminated_final_line_accepted_when_asked() {
        let data = b"10.0.0.1\n10.0.0.2";
        let (scanner, _, _) = scanner(ScanOptions {
            accept_unterminated: true,
        });

        let stats = scanner
            .scan_lines(&mut Cursor::new(&data[..]), whole(data))
            .await
            .unwrap();

        assert_eq!(stats.unique, 2);
    }

    #[tokio::test]
    async fn short_input_is_truncation() {
        let data = b"10.0.0.1\n";
        let (scanner, _, _) = scanner(ScanOptions::default());

        let err = scanner
            .scan_lines(&mut Cursor::new(&data[..]), ChunkRange { start: 0, end: 20 })
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::Truncated { offset: 9, end: 20 }));
    }

    #[tokio::test]
    async fn scan_reads_its_own_range_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"1.1.1.1\n2.2.2.2\n3.3.3.3\n").unwrap();
        file.flush().unwrap();

        let bitmap = Arc::new(AtomicBitmap::ipv4().unwrap());
        let unique = Arc::new(AtomicU64::new(0));
        let (s_progress, mut r_progress) = mpsc::channel(4);
        let scanner = ChunkScanner::new(
            Arc::from(file.path()),
            bitmap.clone(),
            unique.clone(),
            ScanOptions::default(),
            Some(s_progress),
        );

        let stats = scanner
            .scan(ChunkRange { start: 8, end: 24 })
            .await
            .unwrap();

        assert_eq!(stats.unique, 2);
        assert!(!bitmap.is_set(parse_address(b"1.1.1.1").unwrap()).unwrap());
        assert!(bitmap.is_set(parse_address(b"3.3.3.3").unwrap()).unwrap());
        assert_eq!(r_progress.recv().await, Some(16));
    }

    #[tokio::test]
    async fn missing_file_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, bitmap, unique) = scanner(ScanOptions::default());
        let scanner = ChunkScanner::new(
            Arc::from(dir.path().join("absent.txt")),
            bitmap,
            unique,
            ScanOptions::default(),
            None,
        );

        let err = scanner
            .scan(ChunkRange { start: 0, end: 1 })
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::Open { .. }));
    }
}
