mod bitmap;
mod counter;
mod planner;
mod progress_reporter;
mod scanner;
mod shared_types;

use std::error::Error;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::{debug, error, info, LevelFilter};

use counter::{count_unique, CountPreferences};
use scanner::ScanOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// File with one dotted-decimal IPv4 address per line
    filepath: PathBuf,

    /// Number of chunks scanned in parallel
    worker_count: NonZeroUsize,

    /// Count a final line that has no trailing newline
    #[arg(long)]
    accept_unterminated: bool,

    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors, and hide the progress bar
    #[arg(short, long)]
    quiet: bool,
}

impl CliArgs {
    fn log_level(&self) -> LevelFilter {
        match (self.verbose, self.quiet) {
            (true, _) => LevelFilter::Debug,
            (_, true) => LevelFilter::Warn,
            _ => LevelFilter::Info,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    let level = args.log_level();
    let multi = MultiProgress::new();
    let logger = simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    LogWrapper::new(multi.clone(), *logger).try_init()?;
    log::set_max_level(level);

    let prefs = CountPreferences {
        path: args.filepath,
        worker_count: args.worker_count,
        scan: ScanOptions {
            accept_unterminated: args.accept_unterminated,
        },
    };
    let progress = (!args.quiet).then_some(multi);

    let started = Instant::now();
    let summary = count_unique(prefs, progress).await.map_err(|e| {
        error!("cannot count unique IPs: {e}");
        e
    })?;

    debug!(
        "scanned {} of {} bytes",
        summary.bytes_scanned, summary.file_size
    );
    info!("count of unique IP addresses: {}", summary.unique);
    if summary.malformed_lines > 0 {
        info!("skipped {} malformed lines", summary.malformed_lines);
    }
    info!("execution time: {:?}", started.elapsed());

    Ok(())
}
