use std::sync::Arc;
use std::time::Duration;

use circular_buffer::CircularBuffer;

use indicatif::{MultiProgress, ProgressBar, ProgressState, ProgressStyle};

use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::shared_types::ByteCount;

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta}) ({msg})";
const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

type ProgressPoint = (ByteCount, Instant);

/// Renders scanned bytes as a progress bar with a rolling throughput estimate.
///
/// The reporter finishes once every sender of `rx_progress` has been dropped.
pub(crate) struct ProgressReporter {
    rx_progress: mpsc::Receiver<ByteCount>,
    total_size: Option<ByteCount>,
    multi_progress: MultiProgress,
}

impl ProgressReporter {
    pub(crate) fn new(
        rx_progress: mpsc::Receiver<ByteCount>,
        total_size: Option<ByteCount>,
        multi_progress: MultiProgress,
    ) -> Self {
        Self {
            rx_progress,
            total_size,
            multi_progress,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<ByteCount> {
        spawn_progress_reporter(self.total_size, self.rx_progress, self.multi_progress)
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template(TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            write!(w, "{:.1}s", state.eta().as_secs_f64()).ok();
        })
        .progress_chars("#>-")
}

fn format_rate(bytes_per_sec: f64) -> String {
    let (unit, speed) = if bytes_per_sec > 1024.0 * 1024.0 {
        ("MB/s", bytes_per_sec / (1024.0 * 1024.0))
    } else {
        ("kB/s", bytes_per_sec / 1024.0)
    };
    format!("{:.1} {}", speed, unit)
}

/// Returns the total number of bytes reported once the channel closes.
pub(crate) fn spawn_progress_reporter(
    total_size: Option<ByteCount>,
    mut rx_progress: mpsc::Receiver<ByteCount>,
    multi: MultiProgress,
) -> JoinHandle<ByteCount> {
    tokio::spawn(async move {
        let mut progress = 0;
        let progress_q = Arc::new(RwLock::new(CircularBuffer::<50, ProgressPoint>::new()));
        let pb = total_size.map_or_else(ProgressBar::new_spinner, ProgressBar::new);
        let pb = multi.add(pb);
        pb.set_style(progress_style());

        // Refresh the rolling rate every UPDATE_INTERVAL until the bar is done
        {
            let progress_q = progress_q.clone();
            let pb = pb.clone();
            tokio::spawn(async move {
                while !pb.is_finished() {
                    tokio::time::sleep(UPDATE_INTERVAL).await;
                    let q = progress_q.read().await;
                    if let (Some((latest_byte, latest_instant)), Some((oldest_byte, oldest_instant))) =
                        (q.back(), q.front())
                    {
                        if latest_byte == oldest_byte {
                            continue;
                        }
                        let speed = (latest_byte - oldest_byte) as f64
                            / latest_instant.duration_since(*oldest_instant).as_secs_f64();
                        pb.set_message(format_rate(speed));
                    }
                }
            });
        }

        while let Some(scanned) = rx_progress.recv().await {
            progress += scanned;
            pb.set_position(progress);
            let mut q = progress_q.write().await;
            q.push_back((progress, Instant::now()));
        }

        let elapsed = pb.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            progress as f64 / elapsed
        } else {
            0.0
        };
        pb.finish_with_message(format_rate(speed));
        progress
    })
}
