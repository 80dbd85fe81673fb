//! Shared request layer for the site clients: rotating user agents, site
//! referers, optional reader access token, and a bounded retry loop with
//! jitter. Retries live here and only here; the orchestrator above never
//! retries a chapter.

use std::time::Duration;

use anyhow::Context as _;
use rand::Rng as _;
use url::Url;

use super::SiteKind;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: (u64, u64) = (1_000, 2_000);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A small rotation of common desktop/mobile agents; both sites throttle
/// clients that keep a single unusual agent.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
];

pub struct HttpClient {
    client: reqwest::Client,
    /// metruyencv reader access token; sent as a cookie on page requests and
    /// as a bearer token on API requests.
    access_token: Option<String>,
}

impl HttpClient {
    pub fn new(access_token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            access_token: access_token.filter(|token| !token.trim().is_empty()),
        })
    }

    pub async fn get_text(&self, url: &Url, site: SiteKind) -> anyhow::Result<String> {
        let response = self.get_with_retries(url, site, false).await?;
        response
            .text()
            .await
            .with_context(|| format!("read body: {url}"))
    }

    pub async fn get_json(&self, url: &Url, site: SiteKind) -> anyhow::Result<serde_json::Value> {
        let response = self.get_with_retries(url, site, true).await?;
        response
            .json()
            .await
            .with_context(|| format!("parse json: {url}"))
    }

    pub async fn get_bytes(&self, url: &Url, site: SiteKind) -> anyhow::Result<Vec<u8>> {
        let response = self.get_with_retries(url, site, false).await?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("read bytes: {url}"))?;
        Ok(bytes.to_vec())
    }

    async fn get_with_retries(
        &self,
        url: &Url,
        site: SiteKind,
        is_api: bool,
    ) -> anyhow::Result<reqwest::Response> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.get_once(url, site, is_api).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    tracing::warn!(%url, attempt, max = MAX_ATTEMPTS, ?err, "request failed");
                    last_err = Some(err);
                    if attempt < MAX_ATTEMPTS {
                        let delay = {
                            let mut rng = rand::thread_rng();
                            rng.gen_range(RETRY_DELAY_MS.0..=RETRY_DELAY_MS.1)
                        };
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request failed: {url}")))
            .with_context(|| format!("failed after {MAX_ATTEMPTS} attempts: {url}"))
    }

    async fn get_once(
        &self,
        url: &Url,
        site: SiteKind,
        is_api: bool,
    ) -> anyhow::Result<reqwest::Response> {
        let user_agent = {
            let mut rng = rand::thread_rng();
            USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
        };

        let mut request = self
            .client
            .get(url.clone())
            .header(reqwest::header::USER_AGENT, user_agent)
            .header(reqwest::header::REFERER, site.referer());

        if site == SiteKind::Metruyenchu
            && let Some(token) = &self.access_token
        {
            if is_api {
                request = request
                    .bearer_auth(token)
                    .header(reqwest::header::ACCEPT, "application/json, text/plain, */*");
            } else {
                request = request.header(
                    reqwest::header::COOKIE,
                    format!("accessToken={token}"),
                );
            }
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        Ok(response)
    }
}
