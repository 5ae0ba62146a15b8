use std::io::SeekFrom;
use std::num::NonZeroUsize;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::shared_types::ChunkRange;

pub(crate) const LINE_TERMINATOR: u8 = b'\n';

#[derive(Error, Debug)]
pub(crate) enum PlanError {
    #[error("failed to look for a line boundary before offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
}

/// Splits `[0, file_size)` into `worker_count` contiguous ranges whose inner
/// boundaries sit right after a line terminator.
///
/// Raw boundaries are evenly spaced; each inner one is moved back to the start
/// of the line it falls in. Ranges may be empty when lines are longer than a
/// raw chunk or when there are more workers than lines.
pub(crate) async fn plan_chunks<R>(
    source: &mut R,
    file_size: u64,
    worker_count: NonZeroUsize,
) -> Result<Vec<ChunkRange>, PlanError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let workers = worker_count.get() as u64;

    let mut boundaries = Vec::with_capacity(worker_count.get() + 1);
    boundaries.push(0);
    for i in 1..workers {
        let raw = (u128::from(file_size) * u128::from(i) / u128::from(workers)) as u64;
        let aligned = line_start_at_or_before(source, raw).await?;
        boundaries.push(aligned);
    }
    boundaries.push(file_size);

    Ok(boundaries
        .windows(2)
        .map(|pair| ChunkRange {
            start: pair[0],
            end: pair[1],
        })
        .collect())
}

/// Walks back one byte at a time from `offset` until the previous byte is a
/// line terminator, or the start of the source is reached.
async fn line_start_at_or_before<R>(source: &mut R, offset: u64) -> Result<u64, PlanError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let io_err = |source| PlanError::Io { offset, source };

    let mut position = offset;
    let mut byte = [0u8; 1];
    while position > 0 {
        source
            .seek(SeekFrom::Start(position - 1))
            .await
            .map_err(io_err)?;
        source.read_exact(&mut byte).await.map_err(io_err)?;
        if byte[0] == LINE_TERMINATOR {
            break;
        }
        position -= 1;
    }
    Ok(position)
}
