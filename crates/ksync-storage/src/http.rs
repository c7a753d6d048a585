use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, DownloadMethod, DownloadOptions,
    FetchError, FetchedResponse, Fetcher, RetryDisposition,
};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            per_host_concurrency: 1,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Request budget: `capacity` downloads at once, one more every `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Rate limiter shared by every download of one fetcher. A zero refill
/// interval disables it.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    available: u32,
    next_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(BucketState {
                available: capacity.max(1),
                next_refill: Instant::now() + refill_every,
            }),
        }
    }

    /// Waits until a token is available and consumes it.
    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now >= state.next_refill {
                    let overdue = now.duration_since(state.next_refill).as_nanos()
                        / self.refill_every.as_nanos();
                    let periods = u32::try_from(overdue).unwrap_or(u32::MAX).saturating_add(1);
                    state.available = state.available.saturating_add(periods).min(self.capacity);
                    state.next_refill += self.refill_every.saturating_mul(periods);
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                state.next_refill
            };
            tokio::time::sleep_until(wake_at).await;
        }
    }
}

impl From<TokenBucketConfig> for SimpleTokenBucket {
    fn from(config: TokenBucketConfig) -> Self {
        Self::new(config.capacity, config.refill_every)
    }
}

/// `Fetcher` over reqwest with retries, a global and per-host concurrency
/// limit, and an optional token bucket.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::from(c)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    fn build_request(&self, url: &Url, options: &DownloadOptions) -> reqwest::RequestBuilder {
        let mut request = match options.method {
            DownloadMethod::Get => self.client.get(url.clone()),
            DownloadMethod::Post => self.client.post(url.clone()),
        };
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !options.form.is_empty() {
            request = request.form(&options.form);
        }
        request
    }

    async fn fetch_with_retries(
        &self,
        url: &Url,
        options: &DownloadOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.build_request(url, options).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status: status.as_u16(),
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) != RetryDisposition::Retryable || !can_retry {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(status = status.as_u16(), attempt, "retrying download");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) != RetryDisposition::Retryable || !can_retry {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retrying download");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire().await.map_err(|_| FetchError::Shutdown)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_download", %host, url);
        self.fetch_with_retries(&parsed, options)
            .instrument(span)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn invalid_urls_are_rejected_before_any_request() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher
            .download("not a url", &DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn token_bucket_hands_out_capacity_without_waiting() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_secs(60));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn empty_token_bucket_waits_for_a_refill() {
        let bucket = SimpleTokenBucket::new(1, Duration::from_millis(80));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    /// Answers each connection with the next status of `statuses`, repeating
    /// the last one. Returns the URL and the number of requests served.
    async fn serve_statuses(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let status = statuses.get(n).or(statuses.last()).copied().unwrap_or(200);
                let mut request = vec![0u8; 4096];
                let _ = socket.read(&mut request).await;
                let body = if status == 200 { "%PDF-1.4" } else { "" };
                let response = format!(
                    "HTTP/1.1 {status} Status\r\ncontent-type: application/pdf\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/bill.pdf"), served)
    }

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_the_download_succeeds() {
        let (url, served) = serve_statuses(vec![503, 503, 200]).await;
        let response = fast_fetcher(3)
            .download(&url, &DownloadOptions::default())
            .await
            .expect("third attempt succeeds");
        assert_eq!(response.body, b"%PDF-1.4");
        assert_eq!(response.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(served.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, served) = serve_statuses(vec![404]).await;
        let err = fast_fetcher(3)
            .download(&url, &DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_stop_once_the_budget_is_spent() {
        let (url, served) = serve_statuses(vec![500]).await;
        let err = fast_fetcher(2)
            .download(&url, &DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
        assert_eq!(served.load(Ordering::SeqCst), 3);
    }
}
