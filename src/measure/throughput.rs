use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::{Client, Proxy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use url::Url;

pub const PROGRESS_TICK: Duration = Duration::from_millis(100);
const RETRY_BACKOFF: Duration = Duration::from_millis(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MIB: f64 = 1024.0 * 1024.0;

/// Large downloads tried in order until one yields data
pub const DOWNLOAD_TARGETS: &[&str] = &[
    "https://dl.google.com/chrome/install/GoogleChromeStandaloneEnterprise64.msi",
    "http://speedtest.tele2.net/100MB.zip",
    "https://speed.cloudflare.com/__down?bytes=50000000",
];

/// How download connections leave the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    /// Through the measurement engine's SOCKS inbound on 127.0.0.1
    Socks5 { port: u16 },
}

impl Route {
    /// HTTP client for this route. Certificates are not verified and
    /// environment proxies are ignored.
    pub fn client(self) -> Result<Client> {
        let mut builder = Client::builder()
            .no_proxy()
            .danger_accept_invalid_certs(true)
            .connect_timeout(CONNECT_TIMEOUT);
        if let Route::Socks5 { port } = self {
            let proxy = Proxy::all(format!("socks5h://127.0.0.1:{}", port))
                .context("Invalid socks5 proxy")?;
            builder = builder.proxy(proxy);
        }
        builder.build().context("Failed to build http client")
    }
}

/// Running Mbps callback; called every [`PROGRESS_TICK`] and once at the end.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Try each target in turn and return the first window that collected data.
pub async fn measure_download(
    route: Route,
    targets: &[&str],
    window: Duration,
    workers: usize,
    progress: Option<ProgressFn>,
) -> Result<f64> {
    let client = route.client()?;
    let mut last_err = None;
    for target in targets {
        match measure_window(&client, target, window, workers, progress.clone()).await {
            Ok(mbps) => return Ok(mbps),
            Err(e) => {
                tracing::debug!(target = %target, "speed target failed: {:#}", e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("speed test targets are empty")))
}

/// Download `target` with `workers` connections for exactly `window`.
///
/// Errors inside the window (EOF, reset, timeout) only end one attempt; the
/// worker reconnects until the window closes. An empty window returns the
/// last error seen.
pub async fn measure_window(
    client: &Client,
    target: &str,
    window: Duration,
    workers: usize,
    progress: Option<ProgressFn>,
) -> Result<f64> {
    if window.is_zero() {
        anyhow::bail!("invalid speed test duration: {:?}", window);
    }
    let workers = workers.max(1);

    let total = Arc::new(AtomicU64::new(0));
    let last_err: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let start = Instant::now();
    let deadline = start + window;

    let mut handles = Vec::with_capacity(workers);
    for i in 0..workers {
        let url = cache_busted(target, i)?;
        let client = client.clone();
        let total = total.clone();
        let last_err = last_err.clone();
        handles.push(tokio::spawn(async move {
            while Instant::now() < deadline {
                let before = total.load(Ordering::Relaxed);
                let err = match timeout_at(deadline, download_once(&client, &url, &total)).await {
                    Err(_) => return,
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                };
                if let Ok(mut slot) = last_err.lock() {
                    *slot = Some(format!("{:#}", err));
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if total.load(Ordering::Relaxed) == before && remaining >= RETRY_BACKOFF * 2 {
                    sleep(RETRY_BACKOFF).await;
                }
            }
        }));
    }

    let ticker = progress.clone().map(|progress| {
        let total = total.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start + PROGRESS_TICK, PROGRESS_TICK);
            loop {
                interval.tick().await;
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    progress(to_mbps(total.load(Ordering::Relaxed), elapsed));
                }
            }
        })
    });

    futures_util::future::join_all(handles).await;
    if let Some(ticker) = ticker {
        ticker.abort();
    }

    let bytes = total.load(Ordering::Relaxed);
    let mbps = to_mbps(bytes, window.as_secs_f64());
    if let Some(progress) = &progress {
        progress(mbps);
    }
    if bytes == 0 {
        let cause = last_err.lock().ok().and_then(|e| e.clone());
        match cause {
            Some(cause) => anyhow::bail!("no throughput data collected: {}", cause),
            None => anyhow::bail!("no throughput data collected"),
        }
    }
    Ok(mbps)
}

pub fn to_mbps(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 / secs) / MIB
}

/// `target` with a per-worker `vea=<n>` query so caches do not serve it.
fn cache_busted(target: &str, worker: usize) -> Result<Url> {
    let mut url =
        Url::parse(target).with_context(|| format!("Invalid speed test url: {}", target))?;
    url.query_pairs_mut().append_pair("vea", &worker.to_string());
    Ok(url)
}

/// GET `url` and add body bytes to `total` as they arrive.
async fn download_once(client: &Client, url: &Url, total: &AtomicU64) -> Result<()> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("GET {}", url.host_str().unwrap_or_default()))?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("http status {}", status.as_u16());
    }

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("read body")?;
        total.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    Ok(())
}
