use std::{
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, TimeZone, Timelike};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    select,
    time::{Instant, sleep_until},
};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{delay::wait, util::DATETIME_CONSOLE_FORMAT};

pub const RECORDING_FILE_FORMAT: &str = "%Y-%m-%d_%H%M";

/// Where the stream URL comes from
pub trait StreamSource {
    /// Returns the URL to connect to. `refresh` is set when reconnecting after the stream dropped
    fn stream_url(&mut self, refresh: bool) -> impl Future<Output = Result<String>>;
}

/// A stream URL given up front. Reconnects go back to the same URL
pub struct FixedSource(pub String);

impl StreamSource for FixedSource {
    async fn stream_url(&mut self, _refresh: bool) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// When a recording session stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLimit {
    /// Until the stream ends for good or CTRL+C
    Unbounded,
    /// For this long once the stream URL is known
    For(Duration),
    Until(DateTime<Local>),
}

#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub output_dir: PathBuf,
    pub overwrite: bool,
    pub limit: RecordLimit,
    /// Start a new file at every hour boundary
    pub hourly: bool,
    pub reconnect_delay: Duration,
    /// Consecutive connection attempts without any audio before giving up
    pub max_reconnects: u32,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            overwrite: false,
            limit: RecordLimit::Unbounded,
            hourly: true,
            reconnect_delay: Duration::from_secs(2),
            max_reconnects: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Deadline,
    Cancelled,
    /// The stream ended or broke
    Dropped,
}

/// Builds `<dir>/<timestamp>.aac`
///
/// # Errors
/// When the file already exists and `overwrite` is not set
pub fn recording_path(dir: &Path, started_at: NaiveDateTime, overwrite: bool) -> Result<PathBuf> {
    let path = dir.join(format!("{}.aac", started_at.format(RECORDING_FILE_FORMAT)));
    if path.exists() {
        if !overwrite {
            bail!("{path:?} already exists. Pass --overwrite to replace it");
        }
        warn!("Will overwrite existing recording {path:?}");
    }
    Ok(path)
}

/// Turns a [`RecordLimit`] into a wall-clock end, counted from `now`
///
/// # Errors
/// When an end date is not in the future
pub fn resolve_end(limit: RecordLimit, now: DateTime<Local>) -> Result<Option<DateTime<Local>>> {
    match limit {
        RecordLimit::Unbounded => Ok(None),
        RecordLimit::For(duration) => {
            let duration = TimeDelta::from_std(duration).context("Recording duration is too long")?;
            Ok(Some(now + duration))
        }
        RecordLimit::Until(end) => {
            ensure!(end > now, "End date has already passed");
            Ok(Some(end))
        }
    }
}

/// The next top of the hour after `now`, skipping one that is less than a second away
pub fn next_hour(now: DateTime<Local>) -> DateTime<Local> {
    let hour = TimeDelta::hours(1);
    let boundary = now
        .naive_local()
        .date()
        .and_hms_opt(now.hour(), 0, 0)
        .and_then(|top| Local.from_local_datetime(&(top + hour)).earliest())
        .unwrap_or_else(|| now + hour);

    if boundary - now < TimeDelta::seconds(1) {
        boundary + hour
    } else {
        boundary
    }
}

/// When the file started at `now` should be closed
pub fn segment_end(
    now: DateTime<Local>,
    hourly: bool,
    end: Option<DateTime<Local>>,
) -> Option<DateTime<Local>> {
    match (hourly.then(|| next_hour(now)), end) {
        (Some(boundary), Some(end)) => Some(boundary.min(end)),
        (boundary, end) => boundary.or(end),
    }
}

/// Converts a wall-clock time into a timer deadline
fn instant_at(target: DateTime<Local>) -> Instant {
    Instant::now() + (target - Local::now()).to_std().unwrap_or_default()
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

/// Sleeps until `start`. Returns `false` when cancelled first
pub async fn wait_until(start: DateTime<Local>, ct: &CancellationToken) -> bool {
    info!(
        "Waiting for start date: {}",
        start.format(DATETIME_CONSOLE_FORMAT)
    );
    select! {
        () = ct.cancelled() => false,
        () = sleep_until(instant_at(start)) => true,
    }
}

/// Records the stream into one file per segment until the limit is hit, CTRL+C, or the stream is gone
///
/// Returns the files that received audio
///
/// # Errors
/// * If the stream URL cannot be resolved
/// * If an end date passed while resolving the stream URL
/// * If the stream stays unavailable for more than `max_reconnects` attempts
/// * If a recording file cannot be written
#[instrument(skip_all, fields(dir = ?options.output_dir))]
pub async fn record_session(
    client: reqwest::Client,
    source: &mut impl StreamSource,
    options: &RecordOptions,
    ct: CancellationToken,
) -> Result<Vec<PathBuf>> {
    // The clock starts once the stream is known, discovery can take a while
    let url = select! {
        () = ct.cancelled() => {
            info!("Recording cancelled");
            return Ok(Vec::new());
        }
        url = source.stream_url(false) => url.context("Resolving stream URL")?,
    };
    debug!("Stream URL: {url}");

    let end = resolve_end(options.limit, Local::now())?;
    if let Some(end) = end {
        info!(
            "Recording will end at {}",
            end.format(DATETIME_CONSOLE_FORMAT)
        );
    }

    let mut files = Vec::new();
    loop {
        let now = Local::now();
        if end.is_some_and(|end| end <= now) {
            break;
        }

        let path = recording_path(&options.output_dir, now.naive_local(), options.overwrite)?;
        let deadline = segment_end(now, options.hourly, end).map_or_else(far_future, instant_at);
        debug!("Starting new segment {path:?}");

        let (written, stop) = record_segment(&client, source, &path, deadline, &ct, options).await?;
        if written > 0 {
            info!("Wrote {written} bytes to {path:?}");
            files.push(path);
        }

        // A sliver left over from timer rounding is not worth another file
        if stop != Stop::Deadline
            || end.is_some_and(|end| end - Local::now() < TimeDelta::seconds(1))
        {
            break;
        }
    }

    Ok(files)
}

async fn record_segment(
    client: &reqwest::Client,
    source: &mut impl StreamSource,
    path: &Path,
    deadline: Instant,
    ct: &CancellationToken,
    options: &RecordOptions,
) -> Result<(u64, Stop)> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec})")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(200));

    let result = reconnect_loop(client, source, path, deadline, ct, options, &pb).await;
    pb.finish_and_clear();
    result
}

async fn reconnect_loop(
    client: &reqwest::Client,
    source: &mut impl StreamSource,
    path: &Path,
    deadline: Instant,
    ct: &CancellationToken,
    options: &RecordOptions,
    pb: &ProgressBar,
) -> Result<(u64, Stop)> {
    let mut file: Option<File> = None;
    let mut written: u64 = 0;
    let mut failures: u32 = 0;
    let mut refresh = false;
    let mut last_error = None;

    loop {
        let res = select! {
            () = ct.cancelled() => return Ok((written, Stop::Cancelled)),
            () = sleep_until(deadline) => return Ok((written, Stop::Deadline)),
            res = connect(client, source, refresh) => res,
        };

        match res {
            Ok(res) => {
                // Only touch the file once the stream answered
                if file.is_none() {
                    debug!("Creating {path:?}");
                    file = Some(
                        File::create(path)
                            .await
                            .context(format!("Creating recording file {path:?}"))?,
                    );
                }
                let out = file.as_mut().context("Recording file is not open")?;

                let (n, stop) = pump(res.bytes_stream(), out, deadline, ct, pb).await?;
                written += n;
                if stop != Stop::Dropped {
                    return Ok((written, stop));
                }
                if n > 0 {
                    failures = 0;
                }
                warn!("Stream dropped after {n} bytes");
                last_error = None;
            }
            Err(e) => {
                warn!("Stream unavailable: {e:#}");
                last_error = Some(e);
            }
        }

        failures += 1;
        if failures > options.max_reconnects {
            if written > 0 {
                info!("Stream ended");
                return Ok((written, Stop::Dropped));
            }
            match last_error {
                Some(e) => return Err(e.context(format!("Giving up after {failures} attempts"))),
                None => bail!("Stream ended without any audio after {failures} attempts"),
            }
        }

        info!(
            "Reconnecting in {}ms ({failures}/{})",
            options.reconnect_delay.as_millis(),
            options.max_reconnects
        );
        refresh = true;
        select! {
            () = ct.cancelled() => return Ok((written, Stop::Cancelled)),
            () = sleep_until(deadline) => return Ok((written, Stop::Deadline)),
            () = wait(options.reconnect_delay) => {}
        }
    }
}

async fn connect(
    client: &reqwest::Client,
    source: &mut impl StreamSource,
    refresh: bool,
) -> Result<reqwest::Response> {
    let url = source.stream_url(refresh).await?;
    let res = client
        .get(&url)
        .send()
        .await
        .context("Connecting to audio stream")?;
    ensure!(
        res.status().is_success(),
        "Audio stream responded with {}",
        res.status()
    );
    debug!(
        "Stream content type: {:?}",
        res.headers().get(reqwest::header::CONTENT_TYPE)
    );
    Ok(res)
}

/// Copies chunks into `file` until the stream ends or breaks, the deadline passes or `ct` fires
async fn pump<S, B, E>(
    mut stream: S,
    file: &mut File,
    deadline: Instant,
    ct: &CancellationToken,
    pb: &ProgressBar,
) -> Result<(u64, Stop)>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut written: u64 = 0;
    let stop = loop {
        let chunk = select! {
            () = ct.cancelled() => break Stop::Cancelled,
            () = sleep_until(deadline) => break Stop::Deadline,
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(data)) => {
                let data = data.as_ref();
                file.write_all(data)
                    .await
                    .context("Writing to recording file")?;
                written += data.len() as u64;
                pb.inc(data.len() as u64);
            }
            Some(Err(e)) => {
                warn!("Reading audio stream failed: {e}");
                break Stop::Dropped;
            }
            None => break Stop::Dropped,
        }
    };

    file.flush().await.context("Flushing recording file")?;
    Ok((written, stop))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use httpmock::prelude::*;

    use crate::util::init_http_client;

    const STREAM_PATH: &str = "/KMGLFMAAC.aac";

    fn sample_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16)
            .unwrap()
            .and_hms_opt(14, 5, 33)
            .unwrap()
    }

    fn local(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 16, h, m, s).unwrap()
    }

    fn quick_options(dir: &Path) -> RecordOptions {
        RecordOptions {
            output_dir: dir.to_path_buf(),
            hourly: false,
            reconnect_delay: Duration::from_millis(20),
            max_reconnects: 0,
            ..RecordOptions::default()
        }
    }

    /// Remembers the `refresh` flag of every call
    struct CountingSource {
        url: String,
        calls: Vec<bool>,
    }

    impl StreamSource for CountingSource {
        async fn stream_url(&mut self, refresh: bool) -> Result<String> {
            self.calls.push(refresh);
            Ok(self.url.clone())
        }
    }

    async fn temp_file(dir: &Path) -> File {
        File::create(dir.join("pump.aac")).await.unwrap()
    }

    #[test]
    fn path_is_named_after_start_minute() {
        let dir = tempfile::tempdir().unwrap();

        let path = recording_path(dir.path(), sample_time(), false).unwrap();

        assert_eq!(path, dir.path().join("2026-10-16_1405.aac"));
    }

    #[test]
    fn existing_file_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2026-10-16_1405.aac"), b"old").unwrap();

        assert!(recording_path(dir.path(), sample_time(), false).is_err());
        assert!(recording_path(dir.path(), sample_time(), true).is_ok());
    }

    #[test]
    fn past_end_date_is_rejected() {
        let err = resolve_end(RecordLimit::Until(local(14, 0, 0)), local(14, 0, 1)).unwrap_err();
        assert!(err.to_string().contains("End date has already passed"));

        let err = resolve_end(RecordLimit::Until(local(14, 0, 0)), local(14, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("End date has already passed"));
    }

    #[test]
    fn end_is_counted_from_resolution_time() {
        let now = local(14, 5, 33);

        assert_eq!(resolve_end(RecordLimit::Unbounded, now).unwrap(), None);
        assert_eq!(
            resolve_end(RecordLimit::For(Duration::from_secs(10)), now).unwrap(),
            Some(local(14, 5, 43))
        );
        assert_eq!(
            resolve_end(RecordLimit::Until(local(18, 0, 0)), now).unwrap(),
            Some(local(18, 0, 0))
        );
    }

    #[test]
    fn segments_close_at_the_top_of_the_hour() {
        assert_eq!(next_hour(local(14, 5, 33)), local(15, 0, 0));
        assert_eq!(next_hour(local(14, 0, 0)), local(15, 0, 0));
        // Too close to the boundary to be worth a file
        assert_eq!(
            next_hour(local(14, 59, 59) + TimeDelta::milliseconds(500)),
            local(16, 0, 0)
        );
    }

    #[test]
    fn segment_end_is_capped_by_session_end() {
        let now = local(14, 5, 33);

        assert_eq!(segment_end(now, true, None), Some(local(15, 0, 0)));
        assert_eq!(
            segment_end(now, true, Some(local(14, 30, 0))),
            Some(local(14, 30, 0))
        );
        assert_eq!(
            segment_end(now, true, Some(local(17, 0, 0))),
            Some(local(15, 0, 0))
        );
        assert_eq!(
            segment_end(now, false, Some(local(17, 0, 0))),
            Some(local(17, 0, 0))
        );
        assert_eq!(segment_end(now, false, None), None);
    }

    #[tokio::test]
    async fn start_date_in_the_past_does_not_wait() {
        let ct = CancellationToken::new();
        assert!(wait_until(Local::now() - TimeDelta::seconds(5), &ct).await);
    }

    #[tokio::test]
    async fn cancelled_start_wait_returns_false() {
        let ct = CancellationToken::new();
        ct.cancel();
        assert!(!wait_until(Local::now() + TimeDelta::hours(2), &ct).await);
    }

    #[tokio::test]
    async fn pump_stops_at_the_deadline_mid_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = temp_file(dir.path()).await;
        let stream = tokio_stream::iter(vec![
            Ok::<_, std::io::Error>(b"abc".to_vec()),
            Ok(b"def".to_vec()),
        ])
        .chain(tokio_stream::pending());

        let (written, stop) = pump(
            stream,
            &mut file,
            Instant::now() + Duration::from_millis(200),
            &CancellationToken::new(),
            &ProgressBar::hidden(),
        )
        .await
        .unwrap();

        assert_eq!((written, stop), (6, Stop::Deadline));
        assert_eq!(std::fs::read(dir.path().join("pump.aac")).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn pump_stops_when_cancelled_mid_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = temp_file(dir.path()).await;
        let stream = tokio_stream::iter(vec![Ok::<_, std::io::Error>(b"abc".to_vec())])
            .chain(tokio_stream::pending());
        let ct = CancellationToken::new();
        {
            let ct = ct.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ct.cancel();
            });
        }

        let (written, stop) = pump(stream, &mut file, far_future(), &ct, &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!((written, stop), (3, Stop::Cancelled));
        assert_eq!(std::fs::read(dir.path().join("pump.aac")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn pump_reports_broken_streams_as_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = temp_file(dir.path()).await;
        let stream = tokio_stream::iter(vec![
            Ok(b"abc".to_vec()),
            Err(std::io::Error::other("connection reset")),
            Ok(b"never".to_vec()),
        ]);

        let (written, stop) = pump(
            stream,
            &mut file,
            far_future(),
            &CancellationToken::new(),
            &ProgressBar::hidden(),
        )
        .await
        .unwrap();

        assert_eq!((written, stop), (3, Stop::Dropped));
    }

    #[tokio::test]
    async fn deadline_while_waiting_for_headers_leaves_no_file() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(STREAM_PATH);
                then.status(200).delay(Duration::from_secs(30)).body("late");
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.aac");

        let (written, stop) = record_segment(
            &init_http_client(),
            &mut FixedSource(server.url(STREAM_PATH)),
            &path,
            Instant::now() + Duration::from_millis(200),
            &CancellationToken::new(),
            &quick_options(dir.path()),
        )
        .await
        .unwrap();

        assert_eq!((written, stop), (0, Stop::Deadline));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_headers_leaves_no_file() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(STREAM_PATH);
                then.status(200).delay(Duration::from_secs(30)).body("late");
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.aac");
        let ct = CancellationToken::new();
        {
            let ct = ct.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ct.cancel();
            });
        }

        let (written, stop) = record_segment(
            &init_http_client(),
            &mut FixedSource(server.url(STREAM_PATH)),
            &path,
            far_future(),
            &ct,
            &quick_options(dir.path()),
        )
        .await
        .unwrap();

        assert_eq!((written, stop), (0, Stop::Cancelled));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn error_status_keeps_the_previous_recording() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path(STREAM_PATH);
                then.status(404);
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.aac");
        std::fs::write(&path, b"old recording").unwrap();
        let options = RecordOptions {
            overwrite: true,
            max_reconnects: 1,
            ..quick_options(dir.path())
        };

        let err = record_segment(
            &init_http_client(),
            &mut FixedSource(server.url(STREAM_PATH)),
            &path,
            far_future(),
            &CancellationToken::new(),
            &options,
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("404"));
        assert_eq!(mock.hits_async().await, 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"old recording");
    }

    #[tokio::test]
    async fn reconnects_into_the_same_file_after_a_drop() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path(STREAM_PATH);
                then.status(200).body("abc");
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let mut source = CountingSource {
            url: server.url(STREAM_PATH),
            calls: Vec::new(),
        };
        let options = RecordOptions {
            limit: RecordLimit::For(Duration::from_millis(500)),
            max_reconnects: 3,
            ..quick_options(dir.path())
        };

        let files = record_session(init_http_client(), &mut source, &options, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(files.len(), 1);
        let audio = std::fs::read(&files[0]).unwrap();
        assert!(audio.len() >= 6);
        assert_eq!(audio.len() % 3, 0);
        assert!(mock.hits_async().await >= 2);
        assert_eq!(&source.calls[..2], &[false, false]);
        assert!(source.calls[2..].iter().all(|refresh| *refresh));
    }

    #[tokio::test]
    async fn finished_stream_ends_the_session() {
        let server = MockServer::start_async().await;
        let body: Vec<u8> = (0..32_768u32).map(|i| (i % 251) as u8).collect();
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path(STREAM_PATH);
                then.status(200)
                    .header("content-type", "audio/aac")
                    .body(body.clone());
            })
            .await;
        let dir = tempfile::tempdir().unwrap();

        let files = record_session(
            init_http_client(),
            &mut FixedSource(server.url(STREAM_PATH)),
            &quick_options(dir.path()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), body);
    }

    #[tokio::test]
    async fn cancelled_session_writes_nothing() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path(STREAM_PATH);
                then.status(200).body("audio");
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let ct = CancellationToken::new();
        ct.cancel();

        let files = record_session(
            init_http_client(),
            &mut FixedSource(server.url(STREAM_PATH)),
            &quick_options(dir.path()),
            ct,
        )
        .await
        .unwrap();

        assert!(files.is_empty());
        assert_eq!(mock.hits_async().await, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn end_date_passing_during_resolution_is_rejected() {
        struct SlowSource;

        impl StreamSource for SlowSource {
            async fn stream_url(&mut self, _refresh: bool) -> Result<String> {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                Ok("http://127.0.0.1:9/KMGLFMAAC.aac".to_string())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let options = RecordOptions {
            limit: RecordLimit::Until(Local::now() + TimeDelta::seconds(1)),
            ..quick_options(dir.path())
        };

        let err = record_session(init_http_client(), &mut SlowSource, &options, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("End date has already passed"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
