use std::{ffi::OsStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use indoc::indoc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::discovery::{DiscoveryError, PlayerPage, ResourceEntry};

pub const DEFAULT_PAGE_URL: &str = "https://player.listenlive.co/34461";

/// Projects `performance.getEntries()` onto the fields of [`ResourceEntry`]
const RESOURCE_ENTRIES_JS: &str = indoc! {"
    JSON.stringify(performance.getEntries().map(e => ({
        name: e.name,
        entryType: e.entryType,
        initiatorType: e.initiatorType ?? null,
        duration: e.duration,
    })))
"};

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub page_url: String,
    pub headless: bool,
    /// How long to wait for a control to appear before giving up on it
    pub element_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            page_url: DEFAULT_PAGE_URL.to_string(),
            headless: true,
            element_timeout: Duration::from_secs(10),
        }
    }
}

/// A player page opened in a Chromium instance driven over the DevTools protocol
pub struct BrowserPage {
    // Dropping the browser kills the Chromium process
    _browser: Browser,
    tab: Arc<Tab>,
    element_timeout: Duration,
}

impl BrowserPage {
    /// Launches Chromium and navigates to the player page
    ///
    /// # Errors
    /// * If Chromium cannot be found or launched
    /// * If navigation fails
    #[instrument(skip(options), fields(url = %options.page_url))]
    pub fn launch(options: &BrowserOptions) -> Result<Self> {
        debug!("Launching Chromium (headless: {})", options.headless);
        let launch_options = LaunchOptions::default_builder()
            .headless(options.headless)
            .window_size(Some((1280, 800)))
            .args(vec![
                OsStr::new("--mute-audio"),
                OsStr::new("--autoplay-policy=no-user-gesture-required"),
            ])
            .build()
            .context("Building Chromium launch options")?;

        let browser = Browser::new(launch_options).context("Launching Chromium")?;
        let tab = browser.new_tab().context("Opening browser tab")?;

        info!("Loading player page {}", options.page_url);
        tab.navigate_to(&options.page_url)
            .context("Navigating to player page")?
            .wait_until_navigated()
            .context("Waiting for player page to load")?;
        debug!("Page loaded");

        Ok(Self {
            _browser: browser,
            tab,
            element_timeout: options.element_timeout,
        })
    }
}

impl PlayerPage for BrowserPage {
    fn click(&mut self, control_id: &str) -> Result<(), DiscoveryError> {
        let element = self
            .tab
            .wait_for_element_with_custom_timeout(&format!("#{control_id}"), self.element_timeout)
            .map_err(|e| {
                warn!("Control #{control_id} did not show up: {e:#}");
                DiscoveryError::MissingControl(control_id.to_string())
            })?;

        element
            .click()
            .map_err(|e| DiscoveryError::Browser(format!("clicking #{control_id}: {e:#}")))?;

        Ok(())
    }

    fn resource_entries(&mut self) -> Result<Vec<ResourceEntry>, DiscoveryError> {
        let result = self
            .tab
            .evaluate(RESOURCE_ENTRIES_JS, false)
            .map_err(|e| DiscoveryError::Browser(format!("reading performance entries: {e:#}")))?;

        let Some(Value::String(json)) = result.value else {
            return Err(DiscoveryError::Browser(
                "performance entries script returned no string".to_string(),
            ));
        };

        parse_resource_entries(&json)
    }
}

fn parse_resource_entries(json: &str) -> Result<Vec<ResourceEntry>, DiscoveryError> {
    serde_json::from_str(json)
        .map_err(|e| DiscoveryError::Browser(format!("decoding performance entries: {e}")))
}
