use std::path::PathBuf;

use clap::Parser;
use hlsvault_engine::Priority;
use hlsvault_engine::VariantSelectionPolicy;
use hlsvault_engine::proxy::ProxyType;

use crate::utils::parse_variant;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Resilient HLS downloader",
    long_about = "Downloads an HLS stream (master or media playlist) into a single file.\n\
                  \n\
                  Segments are fetched concurrently with per-host circuit breakers,\n\
                  adaptive timeouts and centrally coordinated retries. AES-128 streams\n\
                  are decrypted on the fly. An interrupted download resumes from the\n\
                  segments already on disk when started again with the same --task-id."
)]
pub struct CliArgs {
    /// Playlist URL to download
    #[arg(required = true, help = "URL of a master or media playlist")]
    pub url: String,

    /// Output file
    #[arg(
        short,
        long,
        help = "Output file (default: derived from the playlist URL, relative to --output-dir)"
    )]
    pub output: Option<PathBuf>,

    #[arg(long, help = "Directory relative outputs are resolved against")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, help = "Directory for in-progress segment files")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long, help = "Directory for resume state")]
    pub state_dir: Option<PathBuf>,

    /// Stable task id, reuse it to resume an interrupted download
    #[arg(long, help = "Task id; run again with the same id to resume")]
    pub task_id: Option<String>,

    #[arg(long, value_enum, default_value = "normal", help = "Scheduling priority")]
    pub priority: Priority,

    /// Variant selection for master playlists
    #[arg(
        long,
        default_value = "highest",
        value_parser = parse_variant,
        help = "Variant to pick from a master playlist: highest, lowest, bandwidth:<bps> or resolution:<W>x<H>"
    )]
    pub variant: VariantSelectionPolicy,

    /// Extra request headers
    #[arg(
        short = 'H',
        long = "header",
        help = "Request header as key=value (repeatable)"
    )]
    pub headers: Vec<String>,

    #[arg(long, help = "User-Agent sent with every request")]
    pub user_agent: Option<String>,

    #[arg(short = 'w', long, help = "Concurrent segment downloads for the task (default: 4)")]
    pub workers: Option<usize>,

    #[arg(long, help = "Attempts per segment before giving up (default: 5)")]
    pub max_attempts: Option<u32>,

    /// Segments that may be skipped before the task fails
    #[arg(
        long,
        help = "Number of permanently failed segments tolerated; skipped segments leave gaps in the output (default: 0)"
    )]
    pub tolerate_failures: Option<u64>,

    #[arg(
        long,
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: Option<u64>,

    #[arg(long, help = "Overall time budget for the task in seconds")]
    pub budget: Option<u64>,

    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    #[arg(
        long,
        help = "Proxy server URL for downloads (e.g., \"http://proxy.example.com:8080\")"
    )]
    pub proxy: Option<String>,

    #[arg(long, value_enum, default_value = "http", help = "Proxy type")]
    pub proxy_type: ProxyType,

    #[arg(long, help = "Username for proxy authentication")]
    pub proxy_user: Option<String>,

    #[arg(long, help = "Password for proxy authentication")]
    pub proxy_pass: Option<String>,

    #[arg(long, help = "Do not use the system proxy settings")]
    pub no_system_proxy: bool,

    #[arg(long, help = "Accept invalid TLS certificates")]
    pub insecure: bool,

    /// JSON engine configuration; flags override its values
    #[arg(short, long, help = "Path to a JSON engine configuration file")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    #[arg(long, help = "Emit log lines as JSON")]
    pub log_json: bool,

    #[arg(long, help = "Disable the progress bar")]
    pub no_progress: bool,
}
