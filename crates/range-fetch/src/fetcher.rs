//! HTTP range fetcher.
//!
//! Issues the planned byte-range requests with a bounded, order-preserving fan-out and
//! yields [`DownloadFragment`]s in sequence order. A failed fragment is yielded as an
//! error and ends the stream; fragments already yielded stay with the consumer.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use audio_stream_types::{ConnectionClass, DownloadFragment};
use bytes::Bytes;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::RANGE;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::plan::{AdaptivePlan, ChunkDescriptor, build_plan};
use crate::probe::RangeProbe;
use crate::throughput::ThroughputEstimator;

/// Ordered stream of fragments; ends after the first error.
pub type FragmentStream = BoxStream<'static, Result<DownloadFragment, FetchError>>;

/// Range-capable HTTP client with a shared throughput estimate.
#[derive(Clone)]
pub struct RangeFetcher {
    client: reqwest::Client,
    config: Arc<FetchConfig>,
    throughput: Arc<Mutex<ThroughputEstimator>>,
}

impl RangeFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| FetchError::transport("<client>", e))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: FetchConfig) -> Self {
        let throughput = ThroughputEstimator::new(config.throughput_window);
        Self {
            client,
            config: Arc::new(config),
            throughput: Arc::new(Mutex::new(throughput)),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Smoothed throughput in bytes per second.
    pub fn throughput_estimate(&self) -> Option<f64> {
        self.throughput.lock().ok().and_then(|g| g.estimate())
    }

    pub fn connection_class(&self) -> ConnectionClass {
        ConnectionClass::from_throughput(self.throughput_estimate())
    }

    fn record_throughput(&self, bytes: u64, elapsed: Duration) {
        if let Ok(mut g) = self.throughput.lock() {
            g.record(bytes, elapsed);
        }
    }

    /// `true` if the endpoint advertises or honours byte ranges.
    pub async fn probe_range_support(&self, url: &str) -> Result<bool, FetchError> {
        Ok(self.probe(url).await?.supports_ranges)
    }

    /// Probe with HEAD; fall back to a one-byte ranged GET when HEAD is rejected or
    /// leaves the size unknown.
    pub async fn probe(&self, url: &str) -> Result<RangeProbe, FetchError> {
        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let probe = RangeProbe::from_response(url, resp.status(), resp.headers());
                if probe.supports_ranges && probe.total_size.is_none() {
                    return self.probe_with_get(url).await;
                }
                tracing::debug!(
                    url,
                    ranges = probe.supports_ranges,
                    size = ?probe.total_size,
                    "range probe"
                );
                Ok(probe)
            }
            Ok(resp) => {
                tracing::debug!(url, status = resp.status().as_u16(), "HEAD rejected; probing with GET");
                self.probe_with_get(url).await
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "HEAD failed; probing with GET");
                self.probe_with_get(url).await
            }
        }
    }

    async fn probe_with_get(&self, url: &str) -> Result<RangeProbe, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| FetchError::transport(url, e))?;
        let status = resp.status();
        if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
            return Err(FetchError::NetworkFetch {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        // The body is dropped unread; a 200 here would otherwise pull the whole file.
        let mut probe = RangeProbe::from_response(url, status, resp.headers());
        if status == StatusCode::OK {
            probe.supports_ranges = false;
        }
        Ok(probe)
    }

    /// Snapshot plan using the current throughput estimate.
    pub fn fetch_plan(&self, total_size: u64) -> Vec<ChunkDescriptor> {
        build_plan(&self.config, self.throughput_estimate(), total_size)
    }

    /// Plan whose later chunk sizes follow the estimate as the download progresses.
    pub fn adaptive_plan(&self, total_size: u64) -> AdaptivePlan {
        AdaptivePlan::new(
            (*self.config).clone(),
            Some(self.throughput.clone()),
            total_size,
        )
    }

    /// Fetch every planned chunk and yield fragments in plan order.
    ///
    /// With `priority_first_chunk` the first descriptor is fetched on its own before the
    /// concurrent batch starts. Cancelling `cancel` drops all in-flight requests.
    pub fn download<P>(&self, url: &str, plan: P, cancel: CancellationToken) -> FragmentStream
    where
        P: IntoIterator<Item = ChunkDescriptor>,
        P::IntoIter: Send + 'static,
    {
        self.download_with_priority(url, plan, self.config.priority_first_chunk, cancel)
    }

    /// [`download`](Self::download) with the priority-first-chunk mode chosen per call.
    pub fn download_with_priority<P>(
        &self,
        url: &str,
        plan: P,
        priority_first_chunk: bool,
        cancel: CancellationToken,
    ) -> FragmentStream
    where
        P: IntoIterator<Item = ChunkDescriptor>,
        P::IntoIter: Send + 'static,
    {
        let url: Arc<str> = Arc::from(url);
        let mut descriptors = plan.into_iter();
        let head = if priority_first_chunk {
            descriptors.next()
        } else {
            None
        };
        let concurrency = self.config.concurrency();

        let fetch = {
            let this = self.clone();
            move |desc: ChunkDescriptor| {
                let this = this.clone();
                let url = url.clone();
                async move { this.fetch_chunk(&url, desc).await }
            }
        };

        let head_stream = stream::iter(head).then(fetch.clone());
        let tail_stream = stream::iter(descriptors).map(fetch).buffered(concurrency);

        head_stream
            .chain(tail_stream)
            .take_until(cancel.cancelled_owned())
            .scan(false, stop_after_error)
            .boxed()
    }

    /// Whole-file GET streamed as sequential fragments (used when ranges are unsupported).
    ///
    /// Returns the advertised length, if any, alongside the stream.
    pub async fn stream_whole(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> Result<(Option<u64>, FragmentStream), FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::transport(url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::NetworkFetch {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let total = resp.content_length().filter(|len| *len > 0);
        tracing::info!(url, size = ?total, "single-stream download");

        let url_owned = url.to_string();
        let this = self.clone();
        let fragments = resp
            .bytes_stream()
            .scan(
                (0u64, 0u64, Instant::now()),
                move |(offset, seq, last), chunk: Result<Bytes, reqwest::Error>| {
                    let item = match chunk {
                        Ok(payload) => {
                            let elapsed = last.elapsed();
                            *last = Instant::now();
                            this.record_throughput(payload.len() as u64, elapsed);
                            let start = *offset;
                            *offset += payload.len() as u64;
                            let fragment = DownloadFragment {
                                sequence_index: *seq,
                                byte_range: start..*offset,
                                payload,
                                fetch_duration_ms: elapsed.as_millis() as u64,
                            };
                            *seq += 1;
                            Ok(fragment)
                        }
                        Err(e) => Err(FetchError::transport(&url_owned, e)),
                    };
                    future::ready(Some(item))
                },
            )
            .take_until(cancel.cancelled_owned())
            .scan(false, stop_after_error)
            .boxed();
        Ok((total, fragments))
    }

    async fn fetch_chunk(
        &self,
        url: &str,
        desc: ChunkDescriptor,
    ) -> Result<DownloadFragment, FetchError> {
        let mut delay = self.config.retry_base_delay;
        let mut attempt = 0u32;
        loop {
            match self.fetch_chunk_once(url, &desc).await {
                Ok(fragment) => {
                    if attempt > 0 {
                        tracing::debug!(
                            url,
                            index = desc.index,
                            attempts = attempt + 1,
                            "fragment succeeded after retry"
                        );
                    }
                    return Ok(fragment);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(url, index = desc.index, attempt, error = %e, "fragment fetch failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2).min(self.config.max_retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_chunk_once(
        &self,
        url: &str,
        desc: &ChunkDescriptor,
    ) -> Result<DownloadFragment, FetchError> {
        let range = desc.header_value();
        let started = Instant::now();
        let resp = self
            .client
            .get(url)
            .header(RANGE, &range)
            .send()
            .await
            .map_err(|e| FetchError::transport(url, e))?;

        let status = resp.status();
        if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
            return Err(FetchError::NetworkFetch {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::transport(url, e))?;
        let elapsed = started.elapsed();

        let payload = if status == StatusCode::OK {
            slice_ignored_range(body, desc)
        } else {
            body
        };
        self.record_throughput(payload.len() as u64, elapsed);

        if elapsed > self.config.slow_fetch_warning {
            let kbps = if elapsed.as_millis() > 0 {
                (payload.len() as u128 * 1000 / elapsed.as_millis()) / 1024
            } else {
                0
            };
            tracing::warn!(
                took_ms = elapsed.as_millis() as u64,
                bytes = payload.len(),
                kbps = kbps as u64,
                range = range.as_str(),
                "http range fetch slow"
            );
        }

        Ok(DownloadFragment {
            sequence_index: desc.index,
            byte_range: desc.range.clone(),
            payload,
            fetch_duration_ms: elapsed.as_millis() as u64,
        })
    }
}

/// A server that ignores `Range` answers 200 with the whole file; cut out our window.
fn slice_ignored_range(body: Bytes, desc: &ChunkDescriptor) -> Bytes {
    let len = body.len() as u64;
    if len != desc.len() && len >= desc.range.end {
        body.slice(desc.range.start as usize..desc.range.end as usize)
    } else {
        body
    }
}

fn stop_after_error<T>(
    failed: &mut bool,
    item: Result<T, FetchError>,
) -> future::Ready<Option<Result<T, FetchError>>> {
    if *failed {
        return future::ready(None);
    }
    if item.is_err() {
        *failed = true;
    }
    future::ready(Some(item))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;

    #[derive(Clone)]
    struct Fixture {
        data: Bytes,
        ranges: bool,
        failures_left: Arc<AtomicUsize>,
    }

    fn test_bytes(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>())
    }

    fn parse_range(value: &str) -> Option<(u64, u64)> {
        let spec = value.strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }

    async fn serve_file(State(fx): State<Fixture>, headers: HeaderMap) -> Response {
        if fx
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return AxumStatus::SERVICE_UNAVAILABLE.into_response();
        }
        let len = fx.data.len() as u64;
        if !fx.ranges {
            return (AxumStatus::OK, fx.data.clone()).into_response();
        }
        let requested = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        match requested {
            Some((start, end)) => {
                let end = end.min(len - 1);
                let body = fx.data.slice(start as usize..=end as usize);
                (
                    AxumStatus::PARTIAL_CONTENT,
                    [
                        (header::ACCEPT_RANGES, "bytes".to_string()),
                        (header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}")),
                    ],
                    body,
                )
                    .into_response()
            }
            None => (
                AxumStatus::OK,
                [(header::ACCEPT_RANGES, "bytes".to_string())],
                fx.data.clone(),
            )
                .into_response(),
        }
    }

    async fn spawn_server(data: Bytes, ranges: bool, failures: usize) -> String {
        let fixture = Fixture {
            data,
            ranges,
            failures_left: Arc::new(AtomicUsize::new(failures)),
        };
        let app = Router::new()
            .route("/track.bin", get(serve_file))
            .route("/missing.bin", get(|| async { AxumStatus::NOT_FOUND }))
            .with_state(fixture);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn small_chunks() -> FetchConfig {
        FetchConfig {
            initial_chunk_bytes: 10_000,
            standard_chunk_bytes: 16_000,
            min_chunk_bytes: 4_000,
            max_chunk_bytes: 64_000,
            retry_base_delay: Duration::from_millis(1),
            ..FetchConfig::default()
        }
    }

    #[tokio::test]
    async fn head_request_detects_range_support_and_size() {
        let base = spawn_server(test_bytes(50_000), true, 0).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let probe = fetcher.probe(&format!("{base}/track.bin")).await.expect("probe");
        assert!(probe.supports_ranges);
        assert_eq!(probe.require_ranges().ok(), Some(50_000));
    }

    #[tokio::test]
    async fn missing_accept_ranges_reports_unsupported() {
        let base = spawn_server(test_bytes(50_000), false, 0).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let url = format!("{base}/track.bin");
        assert!(!fetcher.probe_range_support(&url).await.expect("probe"));
        let probe = fetcher.probe(&url).await.expect("probe");
        assert!(matches!(
            probe.require_ranges(),
            Err(FetchError::RangeUnsupported { .. })
        ));
    }

    #[tokio::test]
    async fn download_yields_fragments_in_plan_order() {
        let data = test_bytes(300_000);
        let base = spawn_server(data.clone(), true, 0).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let url = format!("{base}/track.bin");
        let plan = fetcher.fetch_plan(data.len() as u64);
        assert!(plan.len() > 4);

        let fragments: Vec<_> = fetcher
            .download(&url, plan.clone(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(fragments.len(), plan.len());

        let mut joined = Vec::new();
        for (i, frag) in fragments.into_iter().enumerate() {
            let frag = frag.expect("fragment");
            assert_eq!(frag.sequence_index, i as u64);
            assert_eq!(frag.byte_range, plan[i].range);
            joined.extend_from_slice(&frag.payload);
        }
        assert_eq!(joined, data.as_ref());
        assert!(fetcher.throughput_estimate().is_some());
    }

    #[tokio::test]
    async fn adaptive_plan_download_covers_file() {
        let data = test_bytes(200_000);
        let base = spawn_server(data.clone(), true, 0).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let plan = fetcher.adaptive_plan(data.len() as u64);
        let joined: Vec<u8> = fetcher
            .download(&format!("{base}/track.bin"), plan, CancellationToken::new())
            .map(|f| f.expect("fragment").payload)
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(joined, data.as_ref());
    }

    #[tokio::test]
    async fn download_without_priority_keeps_plan_order() {
        let data = test_bytes(90_000);
        let base = spawn_server(data.clone(), true, 0).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let plan = fetcher.fetch_plan(data.len() as u64);
        let fragments: Vec<_> = fetcher
            .download_with_priority(
                &format!("{base}/track.bin"),
                plan.clone(),
                false,
                CancellationToken::new(),
            )
            .map(|f| f.expect("fragment"))
            .collect()
            .await;
        let indices: Vec<u64> = fragments.iter().map(|f| f.sequence_index).collect();
        let expected: Vec<u64> = (0..plan.len() as u64).collect();
        assert_eq!(indices, expected);
        let joined: Vec<u8> = fragments.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, data.as_ref());
    }

    #[tokio::test]
    async fn failed_status_ends_stream_with_error() {
        let base = spawn_server(test_bytes(10), true, 0).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let items: Vec<_> = fetcher
            .download(
                &format!("{base}/missing.bin"),
                fetcher.fetch_plan(50_000),
                CancellationToken::new(),
            )
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(FetchError::NetworkFetch { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let data = test_bytes(5_000);
        let base = spawn_server(data.clone(), true, 2).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let items: Vec<_> = fetcher
            .download(
                &format!("{base}/track.bin"),
                fetcher.fetch_plan(5_000),
                CancellationToken::new(),
            )
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().expect("fragment").payload, data);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let base = spawn_server(test_bytes(5_000), true, 10).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let items: Vec<_> = fetcher
            .download(
                &format!("{base}/track.bin"),
                fetcher.fetch_plan(5_000),
                CancellationToken::new(),
            )
            .collect()
            .await;
        assert!(matches!(
            items[0],
            Err(FetchError::NetworkFetch { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_download_yields_nothing() {
        let base = spawn_server(test_bytes(100_000), true, 0).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items: Vec<_> = fetcher
            .download(&format!("{base}/track.bin"), fetcher.fetch_plan(100_000), cancel)
            .collect()
            .await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn stream_whole_yields_contiguous_fragments() {
        let data = test_bytes(120_000);
        let base = spawn_server(data.clone(), false, 0).await;
        let fetcher = RangeFetcher::new(small_chunks()).expect("fetcher");
        let (total, stream) = fetcher
            .stream_whole(&format!("{base}/track.bin"), CancellationToken::new())
            .await
            .expect("stream");
        assert_eq!(total, Some(120_000));

        let mut expected_start = 0u64;
        let mut joined = Vec::new();
        for (i, frag) in stream.collect::<Vec<_>>().await.into_iter().enumerate() {
            let frag = frag.expect("fragment");
            assert_eq!(frag.sequence_index, i as u64);
            assert_eq!(frag.byte_range.start, expected_start);
            expected_start = frag.byte_range.end;
            joined.extend_from_slice(&frag.payload);
        }
        assert_eq!(joined, data.as_ref());
    }

    #[test]
    fn ignored_range_body_is_sliced() {
        let body = test_bytes(100);
        let desc = ChunkDescriptor {
            index: 1,
            range: 10..20,
        };
        assert_eq!(slice_ignored_range(body.clone(), &desc), body.slice(10..20));

        let exact = body.slice(0..10);
        assert_eq!(slice_ignored_range(exact.clone(), &desc), exact);
    }
}
