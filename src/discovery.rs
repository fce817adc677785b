use std::{sync::LazyLock, time::Duration};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::delay::wait;

pub const DEFAULT_PLAY_CONTROL: &str = "playButton";
pub const DEFAULT_STOP_CONTROL: &str = "stopButton";
pub const DEFAULT_STREAM_PATTERN: &str = r"KMGLFMAAC\.aac";

pub static DEFAULT_STREAM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_STREAM_PATTERN).unwrap());

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("control `#{0}` is not present on the page")]
    MissingControl(String),

    #[error("no resource entry matched `{pattern}`")]
    NotFound { pattern: String },

    #[error("browser error: {0}")]
    Browser(String),
}

/// A single resource-timing record, as exposed by `performance.getEntries()`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEntry {
    pub name: String,
    pub entry_type: Option<String>,
    pub initiator_type: Option<String>,
    pub duration: Option<f64>,
}

/// The page hosting the player controls
pub trait PlayerPage {
    /// Clicks the control with the given element ID
    ///
    /// # Errors
    /// [`DiscoveryError::MissingControl`] when the element does not exist
    fn click(&mut self, control_id: &str) -> Result<(), DiscoveryError>;

    /// Returns every resource-timing entry the page currently knows about, in order
    ///
    /// # Errors
    /// [`DiscoveryError::Browser`] when the entries cannot be read
    fn resource_entries(&mut self) -> Result<Vec<ResourceEntry>, DiscoveryError>;
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub play_control: String,
    pub stop_control: String,
    pub pattern: Regex,
    /// How long playback runs before stopping it
    pub play_settle: Duration,
    /// How long to wait after stopping before reading the entries
    pub stop_settle: Duration,
    /// Keep re-reading the entries for this long when nothing matched. Zero means a single scan
    pub match_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            play_control: DEFAULT_PLAY_CONTROL.to_string(),
            stop_control: DEFAULT_STOP_CONTROL.to_string(),
            pattern: DEFAULT_STREAM_REGEX.clone(),
            play_settle: Duration::from_millis(3000),
            stop_settle: Duration::from_millis(1000),
            match_timeout: Duration::ZERO,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Returns the name of the first entry, in list order, matching `pattern`
pub fn first_match<'a>(entries: &'a [ResourceEntry], pattern: &Regex) -> Option<&'a str> {
    entries
        .iter()
        .find(|e| pattern.is_match(&e.name))
        .map(|e| e.name.as_str())
}

/// Plays then stops the player, and picks the stream URL out of the requests it made
///
/// # Errors
/// * [`DiscoveryError::MissingControl`] if either control is absent
/// * [`DiscoveryError::NotFound`] if no entry matched before the match timeout
/// * [`DiscoveryError::Browser`] if the page could not be queried
#[instrument(skip(page, config), fields(pattern = %config.pattern))]
pub async fn discover_stream_url(
    page: &mut impl PlayerPage,
    config: &DiscoveryConfig,
) -> Result<String, DiscoveryError> {
    debug!("Clicking #{}", config.play_control);
    page.click(&config.play_control)?;

    wait(config.play_settle).await;

    debug!("Clicking #{}", config.stop_control);
    page.click(&config.stop_control)?;

    wait(config.stop_settle).await;

    let scan_started = Instant::now();
    loop {
        let entries = page.resource_entries()?;
        debug!("Scanning {} resource entries", entries.len());
        for e in &entries {
            debug!(
                "  {} ({}, {:?}ms)",
                e.name,
                e.initiator_type.as_deref().unwrap_or("unknown"),
                e.duration
            );
        }

        if let Some(name) = first_match(&entries, &config.pattern) {
            info!("Found stream URL: {name}");
            return Ok(name.to_string());
        }

        if scan_started.elapsed() + config.poll_interval > config.match_timeout {
            return Err(DiscoveryError::NotFound {
                pattern: config.pattern.to_string(),
            });
        }

        wait(config.poll_interval).await;
    }
}
