use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info};

use torrent_fetch::{DownloadConfig, HttpTracker, Torrent, download_to_file, parse_torrent_file};

/// Download a single-file torrent from its first peer
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The .torrent file to download.
    #[arg(short, long)]
    file: PathBuf,

    /// Where to write the data. Defaults to the name in the torrent.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Port reported to the tracker.
    #[arg(short, long, default_value_t = torrent_fetch::download::DEFAULT_PORT)]
    port: u16,

    /// Seconds to wait for the peer before giving up on a read.
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    /// Check each piece against its SHA-1 from the torrent.
    #[arg(long)]
    verify: bool,

    /// Trust the position of Piece replies instead of checking their header.
    #[arg(long)]
    no_echo_check: bool,

    /// Log debug output.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn log_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else if self.quiet {
            Level::ERROR
        } else {
            Level::INFO
        }
    }

    fn config(&self) -> DownloadConfig {
        DownloadConfig {
            port: self.port,
            read_timeout: Duration::from_secs(self.timeout),
            verify_block_echo: !self.no_echo_check,
            verify_pieces: self.verify,
            ..DownloadConfig::default()
        }
    }
}

/// The torrent's name reduced to its last path component.
fn default_output(torrent: &Torrent) -> PathBuf {
    Path::new(&torrent.name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(torrent.infohash_hex()))
}

async fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let torrent = parse_torrent_file(&args.file)?;
    info!(
        name = %torrent.name,
        length = torrent.length,
        pieces = torrent.pieces.len(),
        infohash = %torrent.infohash_hex(),
        "loaded torrent"
    );

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&torrent));

    let tracker = HttpTracker::new()?;
    download_to_file(&torrent, &tracker, &args.config(), &output).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .compact()
        .init();

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
