use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use reqwest::header::{HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const DATETIME_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATETIME_CONSOLE_FORMAT: &str = "%A, %B %d at %I:%M:%S %p";

/// # Panics
/// Should never panic, the User-Agent is built from package metadata only
#[must_use]
pub fn init_http_client() -> reqwest::Client {
    let mut headers = HeaderMap::new();
    headers.insert(
        "User-Agent",
        HeaderValue::from_str(&format!(
            "{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        ))
        .unwrap(),
    );

    // No overall timeout, audio streams never finish on their own
    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("Unable to build HTTP client")
}

/// Spawn a task that watches for CTRL + C signal and cancels a [`CancellationToken`] when caught
pub fn spawn_ct_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Caught CTRL+C signal!");
        ct.cancel();
    });
}

/// Parses a `YYYY-MM-DD HH:MM:SS` date in the local timezone
///
/// # Errors
/// When the input is malformed or names a time that does not exist locally
pub fn parse_local_datetime(input: &str) -> Result<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(input, DATETIME_PARSE_FORMAT).context(format!(
        "Dates must be provided in this format: YYYY-MM-DD HH:MM:SS (got `{input}`)"
    ))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .context(format!("`{input}` does not exist in the local timezone"))
}
