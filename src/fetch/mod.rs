//! Parallel byte-range HTTP downloader
//!
//! A HEAD probe decides between a single streamed GET and a segmented
//! download. Segmented downloads pre-allocate the destination, split it into
//! fixed-size ranges and fetch up to `max_parallel_segments` of them at once,
//! writing each chunk at its own offset under a shared file lock.

use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::error::{DownloadError, ErrorKind};
use crate::platform::Platform;
use crate::ratelimit::{status_error, RateLimitPolicy, SignaturePolicy};

/// Smallest segment the fetcher will schedule
pub const MIN_SEGMENT_SIZE: u64 = 1024 * 1024;

/// Called after every chunk write with (bytes so far, total if known)
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// One contiguous byte range, `end` inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Split `[0, total)` into consecutive segments of `segment_size` bytes, the
/// last one possibly shorter.
pub fn plan_segments(total: u64, segment_size: u64) -> Vec<Segment> {
    let size = segment_size.max(1);
    let mut segments = Vec::new();
    let mut start = 0;

    while start < total {
        let end = (start + size).min(total) - 1;
        segments.push(Segment {
            index: segments.len(),
            start,
            end,
        });
        start = end + 1;
    }

    segments
}

/// Run `worker` over `segments` with at most `limit` in flight. The first
/// failure aborts the remaining workers and is returned.
pub async fn dispatch_segments<F, Fut>(segments: Vec<Segment>, limit: usize, worker: F) -> Result<(), DownloadError>
where
    F: Fn(Segment) -> Fut,
    Fut: Future<Output = Result<(), DownloadError>>,
{
    let mut pending = futures_util::stream::iter(segments.into_iter().map(worker)).buffer_unordered(limit.max(1));

    while let Some(result) = pending.next().await {
        result?;
    }
    Ok(())
}

/// Per-call knobs for `RangeFetcher::fetch`
#[derive(Clone)]
pub struct FetchOptions {
    pub headers: HeaderMap,
    pub max_parallel_segments: usize,
    pub segment_size: u64,
    /// Attempts per segment, including the first
    pub segment_retries: u32,
    /// Applied to the probe and to each range request, and as the idle
    /// limit while waiting for response headers or the next body chunk
    pub request_timeout: Duration,
    /// Platform named in errors
    pub platform: Platform,
    pub progress: Option<ProgressCallback>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            max_parallel_segments: 4,
            segment_size: MIN_SEGMENT_SIZE,
            segment_retries: 3,
            request_timeout: Duration::from_secs(30),
            platform: Platform::Unknown,
            progress: None,
        }
    }
}

impl FetchOptions {
    pub fn effective_segment_size(&self) -> u64 {
        self.segment_size.max(MIN_SEGMENT_SIZE)
    }
}

/// What a finished fetch did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub segmented: bool,
    /// Retries per segment; a single-stream download has one entry
    pub retries: Vec<u32>,
}

impl FetchReport {
    pub fn total_retries(&self) -> u32 {
        self.retries.iter().sum()
    }
}

/// State of one fetch, summarised into a `FetchReport` when it succeeds
#[derive(Debug)]
pub struct DownloadSession {
    pub url: String,
    pub destination: PathBuf,
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
    pub parallel_segments: usize,
    transferred: AtomicU64,
    retries: Vec<AtomicU32>,
}

impl DownloadSession {
    fn new(url: &str, destination: &Path, total_size: Option<u64>, supports_ranges: bool, parallel_segments: usize, segment_count: usize) -> Self {
        Self {
            url: url.to_string(),
            destination: destination.to_path_buf(),
            total_size,
            supports_ranges,
            parallel_segments,
            transferred: AtomicU64::new(0),
            retries: (0..segment_count).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    fn report(&self) -> FetchReport {
        FetchReport {
            path: self.destination.clone(),
            bytes: self.transferred.load(Ordering::SeqCst),
            segmented: self.supports_ranges && self.retries.len() > 1,
            retries: self.retries.iter().map(|r| r.load(Ordering::SeqCst)).collect(),
        }
    }

    fn count_retry(&self, segment: usize) {
        if let Some(counter) = self.retries.get(segment) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn advance(&self, bytes: u64, progress: Option<&ProgressCallback>) {
        let so_far = self.transferred.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if let Some(callback) = progress {
            callback(so_far, self.total_size);
        }
    }

    fn rewind(&self, bytes: u64) {
        self.transferred.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Result of the metadata probe
#[derive(Debug, Clone, Copy, Default)]
struct Probe {
    total_size: Option<u64>,
    supports_ranges: bool,
}

/// HTTP downloader shared by every direct-link acquisition
#[derive(Clone)]
pub struct RangeFetcher {
    client: Client,
    policy: Arc<dyn RateLimitPolicy>,
}

impl RangeFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            policy: Arc::new(SignaturePolicy::default()),
        }
    }

    /// Decide which HTTP statuses count as throttling with `policy`
    pub fn with_policy(mut self, policy: Arc<dyn RateLimitPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Download `url` into `destination`.
    ///
    /// On failure a partially written file is left in place for the caller
    /// to clean up.
    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        options: &FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<FetchReport, DownloadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::cancelled(options.platform)),
            result = self.run(url, destination, options) => result,
        }
    }

    async fn run(&self, url: &str, destination: &Path, options: &FetchOptions) -> Result<FetchReport, DownloadError> {
        let probe = self.probe(url, options).await;
        let segment_size = options.effective_segment_size();

        match probe.total_size {
            Some(total) if probe.supports_ranges && total > segment_size => {
                let segments = plan_segments(total, segment_size);
                tracing::debug!(
                    "Segmented download: {} bytes in {} segments, {} parallel",
                    total,
                    segments.len(),
                    options.max_parallel_segments
                );
                let session = DownloadSession::new(
                    url,
                    destination,
                    Some(total),
                    true,
                    options.max_parallel_segments.max(1),
                    segments.len(),
                );
                self.fetch_segmented(&session, segments, options).await?;
                Ok(session.report())
            }
            _ => {
                tracing::debug!(
                    "Single-stream download (size {:?}, ranges {})",
                    probe.total_size,
                    probe.supports_ranges
                );
                let session = DownloadSession::new(url, destination, probe.total_size, probe.supports_ranges, 1, 1);
                self.fetch_single(&session, options).await?;
                Ok(session.report())
            }
        }
    }

    /// HEAD the resource. Any failure degrades to "size unknown".
    async fn probe(&self, url: &str, options: &FetchOptions) -> Probe {
        let response = self
            .client
            .head(url)
            .headers(options.headers.clone())
            .timeout(options.request_timeout)
            .send()
            .await;

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!("Probe returned HTTP {}, falling back to single stream", response.status());
                return Probe::default();
            }
            Err(e) => {
                tracing::debug!("Probe failed ({}), falling back to single stream", e);
                return Probe::default();
            }
        };

        let headers = response.headers();
        // content_length() on a HEAD response reflects the empty body
        let total_size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|size| *size > 0);
        let supports_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Probe {
            total_size,
            supports_ranges,
        }
    }

    async fn fetch_single(&self, session: &DownloadSession, options: &FetchOptions) -> Result<(), DownloadError> {
        let platform = options.platform;
        let attempts = options.segment_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut written = 0;
            match self.stream_whole(session, options, &mut written).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    session.rewind(written);
                    if e.kind != ErrorKind::NetworkError || attempt >= attempts {
                        return Err(e);
                    }
                    session.count_retry(0);
                    tracing::warn!("[{}] Download interrupted (attempt {}/{}): {}", platform, attempt, attempts, e.message);
                }
            }
        }
    }

    async fn stream_whole(&self, session: &DownloadSession, options: &FetchOptions, written: &mut u64) -> Result<(), DownloadError> {
        let platform = options.platform;
        let request = self.client.get(&session.url).headers(options.headers.clone());
        let response = send_within(request, options.request_timeout, platform, "Download request failed").await?;

        if !response.status().is_success() {
            return Err(status_error(self.policy.as_ref(), platform, response.status(), "Download request failed"));
        }

        let mut file = File::create(&session.destination)
            .await
            .map_err(|e| DownloadError::io(platform, "Cannot create destination file", e))?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = next_chunk(&mut stream, options.request_timeout, platform, "Download interrupted").await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(platform, "Cannot write destination file", e))?;
            *written += chunk.len() as u64;
            session.advance(chunk.len() as u64, options.progress.as_ref());
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::io(platform, "Cannot flush destination file", e))
    }

    async fn fetch_segmented(
        &self,
        session: &DownloadSession,
        segments: Vec<Segment>,
        options: &FetchOptions,
    ) -> Result<(), DownloadError> {
        let platform = options.platform;
        let total = session.total_size.unwrap_or_default();

        let file = File::create(&session.destination)
            .await
            .map_err(|e| DownloadError::io(platform, "Cannot create destination file", e))?;
        file.set_len(total)
            .await
            .map_err(|e| DownloadError::io(platform, "Cannot pre-allocate destination file", e))?;
        let file = Mutex::new(file);

        dispatch_segments(segments, session.parallel_segments, |segment| {
            self.fetch_segment(session, segment, options, &file)
        })
        .await?;

        let mut file = file.lock().await;
        file.flush()
            .await
            .map_err(|e| DownloadError::io(platform, "Cannot flush destination file", e))?;
        Ok(())
    }

    /// Fetch one segment, retrying transient failures without backoff
    async fn fetch_segment(
        &self,
        session: &DownloadSession,
        segment: Segment,
        options: &FetchOptions,
        file: &Mutex<File>,
    ) -> Result<(), DownloadError> {
        let attempts = options.segment_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut written = 0;
            match self.stream_segment(session, segment, options, file, &mut written).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    session.rewind(written);
                    if e.kind != ErrorKind::NetworkError || attempt >= attempts {
                        return Err(e.with_detail(format!(
                            "segment {} ({}) failed after {} attempt(s)",
                            segment.index,
                            segment.range_header(),
                            attempt
                        )));
                    }
                    session.count_retry(segment.index);
                    tracing::warn!(
                        "Segment {} failed (attempt {}/{}), retrying: {}",
                        segment.index,
                        attempt,
                        attempts,
                        e.message
                    );
                }
            }
        }
    }

    async fn stream_segment(
        &self,
        session: &DownloadSession,
        segment: Segment,
        options: &FetchOptions,
        file: &Mutex<File>,
        written: &mut u64,
    ) -> Result<(), DownloadError> {
        let platform = options.platform;
        let response = self
            .client
            .get(&session.url)
            .headers(options.headers.clone())
            .header(RANGE, segment.range_header())
            .timeout(options.request_timeout)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(platform, "Segment request failed", &e))?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            if status.is_success() {
                return Err(DownloadError::new(
                    ErrorKind::DownloadFailed,
                    platform,
                    format!("Server ignored the range request (HTTP {})", status),
                ));
            }
            return Err(status_error(self.policy.as_ref(), platform, status, "Segment request failed"));
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = next_chunk(&mut stream, options.request_timeout, platform, "Segment interrupted").await? {
            if *written + chunk.len() as u64 > segment.len() {
                return Err(DownloadError::new(
                    ErrorKind::DownloadFailed,
                    platform,
                    format!("Server sent more than the requested {} bytes", segment.len()),
                ));
            }

            {
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(segment.start + *written))
                    .await
                    .map_err(|e| DownloadError::io(platform, "Cannot seek destination file", e))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| DownloadError::io(platform, "Cannot write destination file", e))?;
                // The next seek fails while a write is still in flight
                file.flush()
                    .await
                    .map_err(|e| DownloadError::io(platform, "Cannot flush destination file", e))?;
            }

            *written += chunk.len() as u64;
            session.advance(chunk.len() as u64, options.progress.as_ref());
        }

        if *written != segment.len() {
            return Err(DownloadError::new(
                ErrorKind::NetworkError,
                platform,
                format!("Segment {} ended early: {}/{} bytes", segment.index, written, segment.len()),
            ));
        }
        Ok(())
    }
}

fn stalled(platform: Platform, context: &str, idle: Duration) -> DownloadError {
    DownloadError::new(
        ErrorKind::NetworkError,
        platform,
        format!("{}: no data from server for {:.1}s", context, idle.as_secs_f64()),
    )
}

/// Send `request`, giving up when no response headers arrive within `idle`
async fn send_within(request: RequestBuilder, idle: Duration, platform: Platform, context: &str) -> Result<Response, DownloadError> {
    match tokio::time::timeout(idle, request.send()).await {
        Ok(result) => result.map_err(|e| DownloadError::from_reqwest(platform, context, &e)),
        Err(_) => Err(stalled(platform, context, idle)),
    }
}

/// Next body chunk, or `NetworkError` once the server has been silent for `idle`
async fn next_chunk<S, T>(stream: &mut S, idle: Duration, platform: Platform, context: &str) -> Result<Option<T>, DownloadError>
where
    S: Stream<Item = Result<T, reqwest::Error>> + Unpin,
{
    match tokio::time::timeout(idle, stream.next()).await {
        Ok(Some(chunk)) => chunk.map(Some).map_err(|e| DownloadError::from_reqwest(platform, context, &e)),
        Ok(None) => Ok(None),
        Err(_) => Err(stalled(platform, context, idle)),
    }
}

/// Client builder with connect timeout and proxy settings applied
pub fn client_builder(proxy: &ProxyConfig, connect_timeout: Duration) -> Result<ClientBuilder, DownloadError> {
    let mut builder = Client::builder().connect_timeout(connect_timeout);
    if let Some(http) = proxy.http.as_deref() {
        builder = builder.proxy(reqwest::Proxy::http(http).map_err(proxy_error)?);
    }
    if let Some(https) = proxy.https.as_deref() {
        builder = builder.proxy(reqwest::Proxy::https(https).map_err(proxy_error)?);
    }
    Ok(builder)
}

fn proxy_error(e: reqwest::Error) -> DownloadError {
    DownloadError::new(ErrorKind::NetworkError, Platform::Unknown, format!("Invalid proxy configuration: {}", e))
}

/// Shared reqwest client honouring proxy settings
pub fn build_client(proxy: &ProxyConfig, connect_timeout: Duration, user_agent: Option<&str>) -> Result<Client, DownloadError> {
    let mut builder = client_builder(proxy, connect_timeout)?;
    if let Some(agent) = user_agent {
        builder = builder.user_agent(agent.to_string());
    }
    builder.build().map_err(proxy_error)
}
