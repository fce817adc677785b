#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use browser::{BrowserOptions, BrowserPage, DEFAULT_PAGE_URL};
use chrono::{DateTime, Local};
use clap::{Args, Parser, Subcommand};
use discovery::{DEFAULT_STREAM_PATTERN, DiscoveryConfig, discover_stream_url};
use record::{
    FixedSource, RecordLimit, RecordOptions, StreamSource, record_session, resolve_end, wait_until,
};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{
    Layer as _,
    filter::{LevelFilter, Targets},
    layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};
use util::{init_http_client, parse_local_datetime, spawn_ct_watcher};

pub mod browser;
pub mod delay;
pub mod discovery;
pub mod record;
pub mod util;

/// Finds the raw audio stream behind a web radio player page
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    discovery: DiscoveryArgs,

    /// Turn on more verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also append all logs, debug included, to this file
    #[arg(long, global = true, env = "STREAM_SNIFF_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stream URL the player page fetches
    Discover,

    /// Record the stream into an .aac file
    Record(RecordArgs),
}

#[derive(Args, Debug)]
struct DiscoveryArgs {
    /// Player page to load
    #[arg(long, global = true, env = "STREAM_SNIFF_PAGE_URL", default_value = DEFAULT_PAGE_URL)]
    page_url: String,

    /// Element ID of the control that starts playback
    #[arg(long, global = true, env = "STREAM_SNIFF_PLAY_CONTROL", default_value = discovery::DEFAULT_PLAY_CONTROL)]
    play_control: String,

    /// Element ID of the control that stops playback
    #[arg(long, global = true, env = "STREAM_SNIFF_STOP_CONTROL", default_value = discovery::DEFAULT_STOP_CONTROL)]
    stop_control: String,

    /// Regular expression the stream URL must match
    #[arg(short, long, global = true, env = "STREAM_SNIFF_PATTERN", default_value = DEFAULT_STREAM_PATTERN)]
    pattern: Regex,

    /// How long to let the player run before stopping it
    #[arg(long, global = true, default_value_t = 3000)]
    play_wait_ms: u64,

    /// How long to wait after stopping before reading network entries
    #[arg(long, global = true, default_value_t = 1000)]
    stop_wait_ms: u64,

    /// Keep looking for a matching entry for this long before giving up
    #[arg(long, global = true, default_value_t = 0)]
    match_timeout_ms: u64,

    /// How long to wait for each control to appear on the page. 0 fails at once when a control is missing
    #[arg(long, global = true, default_value_t = 10)]
    element_timeout_secs: u64,

    /// Show the browser window instead of running headless
    #[arg(long, global = true)]
    show_browser: bool,
}

impl DiscoveryArgs {
    fn browser_options(&self) -> BrowserOptions {
        BrowserOptions {
            page_url: self.page_url.clone(),
            headless: !self.show_browser,
            element_timeout: Duration::from_secs(self.element_timeout_secs),
        }
    }

    fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            play_control: self.play_control.clone(),
            stop_control: self.stop_control.clone(),
            pattern: self.pattern.clone(),
            play_settle: Duration::from_millis(self.play_wait_ms),
            stop_settle: Duration::from_millis(self.stop_wait_ms),
            match_timeout: Duration::from_millis(self.match_timeout_ms),
            ..DiscoveryConfig::default()
        }
    }
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Stream URL to record. Discovered from the player page when omitted
    #[arg(short, long)]
    url: Option<String>,

    /// Directory where recorded files should be placed
    #[arg(short, long, default_value = "./output")]
    output_dir: PathBuf,

    /// Date on which to start the recording. Format: YYYY-MM-DD HH:MM:SS
    #[arg(short, long)]
    start_date: Option<String>,

    /// Stop recording after this many seconds, counted once the stream is found
    #[arg(short, long, conflicts_with = "end_date")]
    duration_secs: Option<u64>,

    /// Date on which to end the recording. Format: YYYY-MM-DD HH:MM:SS
    #[arg(short, long)]
    end_date: Option<String>,

    /// Replace an existing recording with the same name
    #[arg(long)]
    overwrite: bool,

    /// Keep a single file instead of starting a new one every hour
    #[arg(long)]
    no_rotate: bool,

    /// How long to wait before reconnecting after the stream drops
    #[arg(long, default_value_t = 2000)]
    reconnect_delay_ms: u64,

    /// Consecutive failed connection attempts before giving up
    #[arg(long, default_value_t = 5)]
    max_reconnects: u32,
}

impl RecordArgs {
    /// Validates the dates against `now` and returns the options with the start date
    fn record_options(&self, now: DateTime<Local>) -> Result<(RecordOptions, Option<DateTime<Local>>)> {
        let start = self
            .start_date
            .as_deref()
            .map(parse_local_datetime)
            .transpose()
            .context("Failed to parse start date")?;

        let limit = match (self.duration_secs, self.end_date.as_deref()) {
            (Some(secs), _) => RecordLimit::For(Duration::from_secs(secs)),
            (None, Some(end)) => {
                let end = parse_local_datetime(end).context("Failed to parse end date")?;
                // Checked again once the stream is found
                resolve_end(RecordLimit::Until(end), now)?;
                if let Some(start) = start {
                    ensure!(start < end, "Start date must come before the end date");
                }
                RecordLimit::Until(end)
            }
            (None, None) => RecordLimit::Unbounded,
        };

        let options = RecordOptions {
            output_dir: self.output_dir.clone(),
            overwrite: self.overwrite,
            limit,
            hourly: !self.no_rotate,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnects: self.max_reconnects,
        };
        Ok((options, start))
    }
}

/// Discovers the stream from the player page, again after every drop
struct PageSource<'a> {
    args: &'a DiscoveryArgs,
    url: Option<String>,
}

impl StreamSource for PageSource<'_> {
    async fn stream_url(&mut self, refresh: bool) -> Result<String> {
        if let (Some(url), false) = (&self.url, refresh) {
            return Ok(url.clone());
        }

        match discover(self.args).await {
            Ok(url) => {
                self.url = Some(url.clone());
                Ok(url)
            }
            Err(e) => match &self.url {
                Some(stale) => {
                    warn!("Rediscovering the stream failed, reusing the previous URL: {e:#}");
                    Ok(stale.clone())
                }
                None => Err(e),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_file.as_deref())?;
    debug!("Verbose logging enabled");

    match cli.command {
        Command::Discover => {
            let url = discover(&cli.discovery).await?;
            println!("{url}");
        }
        Command::Record(args) => record(&cli.discovery, &args).await?,
    }

    Ok(())
}

/// Our own events at `level`, everything else at INFO
fn crate_filter(level: LevelFilter) -> Targets {
    Targets::new()
        .with_target(env!("CARGO_CRATE_NAME"), level)
        .with_default(LevelFilter::INFO)
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(format!("Opening log file {path:?}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(crate_filter(LevelFilter::DEBUG)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(crate_filter(level)),
        )
        .with(file_layer)
        .init();

    Ok(())
}

async fn discover(args: &DiscoveryArgs) -> Result<String> {
    let mut page = BrowserPage::launch(&args.browser_options())?;
    let url = discover_stream_url(&mut page, &args.discovery_config())
        .await
        .context("Discovering stream URL")?;
    Ok(url)
}

async fn record(discovery: &DiscoveryArgs, args: &RecordArgs) -> Result<()> {
    let (options, start) = args.record_options(Local::now())?;

    tokio::fs::create_dir_all(&options.output_dir)
        .await
        .context(format!(
            "Creating output directory {:?}",
            options.output_dir
        ))?;
    debug!("Output directory: {:?}", options.output_dir);

    let ct = CancellationToken::new();
    spawn_ct_watcher(ct.clone());

    if let Some(start) = start {
        if !wait_until(start, &ct).await {
            info!("Stopped before the start date");
            return Ok(());
        }
    }

    info!("Recording started");
    let client = init_http_client();
    let files = match &args.url {
        Some(url) => record_session(client, &mut FixedSource(url.clone()), &options, ct).await?,
        None => {
            let mut source = PageSource {
                args: discovery,
                url: None,
            };
            record_session(client, &mut source, &options, ct).await?
        }
    };
    info!("Recording finished, {} file(s) written", files.len());

    Ok(())
}
