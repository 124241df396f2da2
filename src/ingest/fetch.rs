// src/ingest/fetch.rs
//! HTTP access for adapters, behind a trait so tests can serve fixtures.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use metrics::histogram;
use reqwest::redirect::Policy;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ssrf::UrlValidator;

pub type Headers<'a> = &'a [(&'a str, String)];

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET `url` and return the body as text. Non-2xx is an error.
    async fn get_text(&self, url: &str, headers: Headers<'_>) -> Result<String>;
}

pub type SharedFetcher = Arc<dyn Fetcher>;

/// URL without its query string, for error messages (queries may carry tokens).
pub fn display_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// GET and decode JSON.
pub async fn get_json<T: DeserializeOwned>(
    fetcher: &dyn Fetcher,
    url: &str,
    headers: Headers<'_>,
) -> Result<T> {
    let body = fetcher.get_text(url, headers).await?;
    serde_json::from_str(&body)
        .with_context(|| format!("decoding json from {}", display_url(url)))
}

const MAX_REDIRECTS: usize = 5;
const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Every redirect hop has to pass the same checks as the first URL.
fn redirect_policy(validator: UrlValidator) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("more than {MAX_REDIRECTS} redirects"));
        }
        let target = attempt.url().to_string();
        match validator.validate(&target) {
            Ok(_) => attempt.follow(),
            Err(e) => attempt.error(format!("redirect to {} refused: {e}", display_url(&target))),
        }
    })
}

pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout_secs: u64) -> Result<Self> {
        Self::with_validator(user_agent, timeout_secs, UrlValidator::new())
    }

    pub fn with_validator(user_agent: &str, timeout_secs: u64, validator: UrlValidator) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(timeout_secs.clamp(1, 10)))
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .redirect(redirect_policy(validator))
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit.max(1);
        self
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_text(&self, url: &str, headers: Headers<'_>) -> Result<String> {
        let t0 = std::time::Instant::now();
        let shown = display_url(url);
        let mut req = self.client.get(url);
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        let mut resp = req
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("GET {shown}"))?;

        let limit = self.max_body_bytes;
        if resp.content_length().is_some_and(|n| n > limit as u64) {
            bail!("body of {shown} exceeds {limit} bytes");
        }
        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("reading body of {shown}"))?
        {
            if body.len() + chunk.len() > limit {
                bail!("body of {shown} exceeds {limit} bytes");
            }
            body.extend_from_slice(&chunk);
        }
        histogram!("ingest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Serves canned bodies keyed by exact URL; unknown URLs fail like a 404.
#[derive(Default, Clone)]
pub struct FixtureFetcher {
    bodies: Arc<Mutex<HashMap<String, String>>>,
    hits: Arc<Mutex<Vec<String>>>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(url, body);
        self
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<String>) {
        self.bodies
            .lock()
            .expect("fixture map poisoned")
            .insert(url.into(), body.into());
    }

    pub fn remove(&self, url: &str) {
        self.bodies.lock().expect("fixture map poisoned").remove(url);
    }

    /// URLs requested so far, in order.
    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().expect("fixture hits poisoned").clone()
    }
}

#[async_trait]
impl Fetcher for FixtureFetcher {
    async fn get_text(&self, url: &str, _headers: Headers<'_>) -> Result<String> {
        self.hits
            .lock()
            .expect("fixture hits poisoned")
            .push(url.to_string());
        self.bodies
            .lock()
            .expect("fixture map poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("GET {}: 404 (no fixture)", display_url(url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_fetcher_serves_and_records() {
        let f = FixtureFetcher::new().with("https://e.com/a.json", r#"{"n": 3}"#);

        #[derive(serde::Deserialize)]
        struct N {
            n: u32,
        }
        let v: N = get_json(&f, "https://e.com/a.json", &[]).await.unwrap();
        assert_eq!(v.n, 3);
        assert!(f.get_text("https://e.com/missing", &[]).await.is_err());
        assert_eq!(f.hits().len(), 2);
    }

    #[tokio::test]
    async fn redirects_into_blocked_ranges_are_refused() {
        use crate::test_http::{bind, serve, Canned};

        let (listener, addr) = bind().await;
        let server = serve(
            listener,
            vec![
                Canned::redirect("http://169.254.169.254/latest/meta-data"),
                Canned::redirect(&format!("http://{addr}/internal-secret")),
                Canned::ok("secret"),
            ],
        );
        let fetcher = HttpFetcher::new("signalboard-test", 5).unwrap();

        let err = fetcher.get_text(&format!("http://{addr}/a"), &[]).await.unwrap_err();
        assert!(format!("{err:#}").contains("refused"), "{err:#}");
        let err = fetcher.get_text(&format!("http://{addr}/b"), &[]).await.unwrap_err();
        assert!(format!("{err:#}").contains("refused"), "{err:#}");

        // The third canned response was never requested.
        server.abort();
        assert!(server.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        use crate::test_http::{bind, serve, Canned};

        let (listener, addr) = bind().await;
        let chunked = "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\nconnection: close\r\n\r\n";
        serve(
            listener,
            vec![
                Canned::ok("short"),
                Canned::ok(&"x".repeat(64)),
                Canned::split(chunked, &[&[b'y'; 40][..], &[b'y'; 40][..]]),
            ],
        );
        let fetcher = HttpFetcher::new("signalboard-test", 5).unwrap().max_body_bytes(50);
        let url = format!("http://{addr}/");

        assert_eq!(fetcher.get_text(&url, &[]).await.unwrap(), "short");
        let declared = fetcher.get_text(&url, &[]).await.unwrap_err();
        assert!(declared.to_string().contains("exceeds 50 bytes"), "{declared:#}");
        let streamed = fetcher.get_text(&url, &[]).await.unwrap_err();
        assert!(streamed.to_string().contains("exceeds 50 bytes"), "{streamed:#}");
    }

    #[tokio::test]
    async fn body_split_inside_a_character_decodes_whole() {
        use crate::test_http::{bind, serve, Canned};

        let (listener, addr) = bind().await;
        let text = "中文 feed";
        let bytes = text.as_bytes();
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            bytes.len()
        );
        serve(listener, vec![Canned::split(&head, &[&bytes[..1], &bytes[1..]])]);
        let fetcher = HttpFetcher::new("signalboard-test", 5).unwrap();
        assert_eq!(fetcher.get_text(&format!("http://{addr}/"), &[]).await.unwrap(), text);
    }

    #[test]
    fn display_url_drops_query() {
        assert_eq!(
            display_url("https://e.com/api?auth_token=secret"),
            "https://e.com/api"
        );
        assert_eq!(display_url("https://e.com/a"), "https://e.com/a");
    }
}
