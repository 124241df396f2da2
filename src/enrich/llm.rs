// src/enrich/llm.rs
//! LLM client abstraction: OpenAI-compatible chat completions, a deterministic
//! mock, a disabled client and a daily-budget wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AiConfig;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
/// Text deltas of a streamed completion.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider for a JSON object answer.
    pub json_mode: bool,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system.into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: user.into(),
                },
            ],
            temperature: 0.3,
            max_tokens: 1024,
            json_mode: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

/// Trait object used by the processor and the reader.
pub trait LlmClient: Send + Sync {
    /// Full answer text.
    fn complete<'a>(&'a self, req: &'a ChatRequest) -> BoxFuture<'a, Result<String>>;
    /// Answer as a stream of text deltas.
    fn complete_stream<'a>(&'a self, req: &'a ChatRequest) -> BoxFuture<'a, Result<TextStream>>;
    /// Provider name for diagnostics and cache provenance.
    fn provider_name(&self) -> &str;
    fn model(&self) -> &str;
}

pub type DynLlm = Arc<dyn LlmClient>;

/// Factory: build a client according to config and environment variables.
///
/// * If `AI_TEST_MODE=mock`, returns the deterministic mock client.
/// * Else if `config.enabled == false` or the key is empty, returns a disabled client.
/// * Else builds the OpenAI-compatible client.
///
/// Every enabled client is wrapped with the daily limit.
pub fn build_llm_client(config: &AiConfig) -> DynLlm {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Arc::new(BudgetedClient::new(MockLlm::new(), config.daily_limit));
    }
    if !config.enabled {
        return Arc::new(DisabledLlm);
    }
    if config.api_key.trim().is_empty() {
        warn!(target: "enrich", provider = %config.provider, "AI enabled but api key is empty; disabling");
        return Arc::new(DisabledLlm);
    }
    match OpenAiCompatible::new(
        &config.provider,
        &config.base_url_or_default(),
        &config.api_key,
        &config.model_or_default(),
    ) {
        Ok(client) => {
            info!(
                target: "enrich",
                provider = %config.provider,
                model = client.model(),
                daily_limit = config.daily_limit,
                "llm client ready"
            );
            Arc::new(BudgetedClient::new(client, config.daily_limit))
        }
        Err(e) => {
            warn!(target: "enrich", error = %e, "failed to build llm client; disabling");
            Arc::new(DisabledLlm)
        }
    }
}

// ------------------------------------------------------------
// OpenAI-compatible chat completions
// ------------------------------------------------------------

pub struct OpenAiCompatible {
    http: reqwest::Client,
    provider: String,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireDeltaChoice>,
}

#[derive(Deserialize)]
struct WireDeltaChoice {
    delta: WireDelta,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed line of a `text/event-stream` completion body.
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine {
    Text(String),
    Done,
    Skip,
}

pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<WireChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|t| !t.is_empty())
            .map(SseLine::Text)
            .unwrap_or(SseLine::Skip),
        Err(_) => SseLine::Skip,
    }
}

/// Splits a byte stream into lines, decoding each only once it is complete
/// so multi-byte characters split across network chunks survive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left after the stream ends.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

impl OpenAiCompatible {
    pub fn new(provider: &str, base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("signalboard/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .context("building llm http client")?;
        Ok(Self {
            http,
            provider: provider.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn send(&self, req: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let body = WireRequest {
            model: &self.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream,
            response_format: req
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
        };
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("{} request failed: {}", self.provider, e.without_url()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "{} returned {status}: {}",
                self.provider,
                text.chars().take(300).collect::<String>()
            );
        }
        Ok(resp)
    }

    async fn complete_impl(&self, req: &ChatRequest) -> Result<String> {
        let resp = self.send(req, false).await?;
        let body: WireResponse = resp.json().await.context("decoding completion")?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("{} returned an empty completion", self.provider))
    }

    async fn stream_impl(&self, req: &ChatRequest) -> Result<TextStream> {
        let resp = self.send(req, true).await?;
        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new();
            let mut done = false;
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err::<String, anyhow::Error>(anyhow!("stream read failed: {}", e.without_url()));
                        break;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        SseLine::Text(t) => yield Ok(t),
                        SseLine::Done => {
                            done = true;
                            break 'outer;
                        }
                        SseLine::Skip => {}
                    }
                }
            }
            // Last line may arrive without a trailing newline.
            if !done {
                if let SseLine::Text(t) = parse_sse_line(&lines.finish()) {
                    yield Ok(t);
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

impl LlmClient for OpenAiCompatible {
    fn complete<'a>(&'a self, req: &'a ChatRequest) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.complete_impl(req))
    }
    fn complete_stream<'a>(&'a self, req: &'a ChatRequest) -> BoxFuture<'a, Result<TextStream>> {
        Box::pin(self.stream_impl(req))
    }
    fn provider_name(&self) -> &str {
        &self.provider
    }
    fn model(&self) -> &str {
        &self.model
    }
}

// ------------------------------------------------------------
// Disabled + mock
// ------------------------------------------------------------

/// Always errors; used when AI is disabled.
pub struct DisabledLlm;

impl LlmClient for DisabledLlm {
    fn complete<'a>(&'a self, _req: &'a ChatRequest) -> BoxFuture<'a, Result<String>> {
        Box::pin(async { Err(anyhow!("AI is disabled")) })
    }
    fn complete_stream<'a>(&'a self, _req: &'a ChatRequest) -> BoxFuture<'a, Result<TextStream>> {
        Box::pin(async { Err(anyhow!("AI is disabled")) })
    }
    fn provider_name(&self) -> &str {
        "disabled"
    }
    fn model(&self) -> &str {
        "none"
    }
}

/// Deterministic client for tests and local runs.
///
/// JSON-mode requests get an enrichment object derived from the prompt;
/// everything else gets `reply` (or an echo of the prompt's start).
#[derive(Default)]
pub struct MockLlm {
    reply: Option<String>,
    fail_when: Option<String>,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Self::default()
        }
    }

    /// Fail every request whose user message contains `needle`.
    pub fn failing_when(mut self, needle: impl Into<String>) -> Self {
        self.fail_when = Some(needle.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, req: &ChatRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let user = req.user_content();
        if let Some(needle) = &self.fail_when {
            if user.contains(needle.as_str()) {
                bail!("mock failure");
            }
        }
        if let Some(reply) = &self.reply {
            return Ok(reply.clone());
        }
        let head: String = user.chars().take(60).collect();
        if req.json_mode {
            return Ok(serde_json::json!({
                "tags": ["mock"],
                "tags_localized": ["模拟"],
                "summary": format!("Mock summary: {head}"),
                "summary_localized": "模拟摘要",
                "title_translated": "模拟标题",
            })
            .to_string());
        }
        Ok(format!("Mock answer: {head}"))
    }
}

impl LlmClient for MockLlm {
    fn complete<'a>(&'a self, req: &'a ChatRequest) -> BoxFuture<'a, Result<String>> {
        let out = self.answer(req);
        Box::pin(async move { out })
    }
    fn complete_stream<'a>(&'a self, req: &'a ChatRequest) -> BoxFuture<'a, Result<TextStream>> {
        let out = self.answer(req);
        Box::pin(async move {
            let text = out?;
            let pieces: Vec<Result<String>> = text
                .split_inclusive(' ')
                .map(|p| Ok(p.to_string()))
                .collect();
            let stream: TextStream = Box::pin(futures::stream::iter(pieces));
            Ok(stream)
        })
    }
    fn provider_name(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock-1"
    }
}

// ------------------------------------------------------------
// Daily limit wrapper
// ------------------------------------------------------------

#[derive(Debug, Clone)]
struct DailyCounter {
    date: NaiveDate,
    count: u32,
}

impl DailyCounter {
    fn today() -> Self {
        Self {
            date: Utc::now().date_naive(),
            count: 0,
        }
    }
}

/// Counts upstream calls per UTC day and refuses once `daily_limit` is hit.
pub struct BudgetedClient<C: LlmClient> {
    inner: C,
    daily_limit: u32,
    counter: Mutex<DailyCounter>,
}

impl<C: LlmClient> BudgetedClient<C> {
    pub fn new(inner: C, daily_limit: u32) -> Self {
        Self {
            inner,
            daily_limit,
            counter: Mutex::new(DailyCounter::today()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Reserve one call from today's budget.
    fn take(&self) -> Result<()> {
        let mut g = self
            .counter
            .lock()
            .map_err(|_| anyhow!("llm budget counter poisoned"))?;
        let today = Utc::now().date_naive();
        if g.date != today {
            *g = DailyCounter::today();
        }
        if g.count >= self.daily_limit {
            bail!("daily AI limit of {} calls reached", self.daily_limit);
        }
        g.count += 1;
        Ok(())
    }

    pub fn used_today(&self) -> u32 {
        self.counter.lock().map(|g| g.count).unwrap_or(0)
    }
}

impl<C: LlmClient> LlmClient for BudgetedClient<C> {
    fn complete<'a>(&'a self, req: &'a ChatRequest) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.take()?;
            self.inner.complete(req).await
        })
    }
    fn complete_stream<'a>(&'a self, req: &'a ChatRequest) -> BoxFuture<'a, Result<TextStream>> {
        Box::pin(async move {
            self.take()?;
            self.inner.complete_stream(req).await
        })
    }
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }
    fn model(&self) -> &str {
        self.inner.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_parse() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseLine::Text("Hi".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
    }

    #[test]
    fn multibyte_text_split_across_chunks_decodes_whole() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"中文\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find('中').unwrap() + 1;

        let mut lines = LineBuffer::new();
        assert!(lines.push(&bytes[..split]).is_empty());
        let done = lines.push(&bytes[split..]);
        assert_eq!(done.len(), 1);
        assert_eq!(parse_sse_line(&done[0]), SseLine::Text("中文".into()));
        assert_eq!(lines.finish(), "");
    }

    #[tokio::test]
    async fn streamed_completion_survives_split_characters() {
        use crate::test_http::{bind, serve, Canned};

        let (listener, addr) = bind().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"中文\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"摘要\"}}]}\n\n",
            "data: [DONE]\n\n"
        )
        .as_bytes();
        let split = body.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
        serve(listener, vec![Canned::split(head, &[&body[..split], &body[split..]])]);

        let client = OpenAiCompatible::new("local", &format!("http://{addr}/v1"), "k", "m").unwrap();
        let pieces: Vec<String> = client
            .complete_stream(&ChatRequest::new("sys", "user"))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(pieces.concat(), "中文摘要");
    }

    #[test]
    fn trailing_line_without_newline_is_kept() {
        let mut lines = LineBuffer::new();
        let out = lines.push(b"data: [DONE]\ndata: tail");
        assert_eq!(out, vec!["data: [DONE]\n".to_string()]);
        assert_eq!(lines.finish(), "data: tail");
    }

    #[tokio::test]
    async fn budget_refuses_after_limit() {
        let client = BudgetedClient::new(MockLlm::with_reply("ok"), 2);
        let req = ChatRequest::new("sys", "user");
        assert_eq!(client.complete(&req).await.unwrap(), "ok");
        assert!(client.complete_stream(&req).await.is_ok());
        let err = client.complete(&req).await.unwrap_err();
        assert!(err.to_string().contains("daily AI limit"));
        assert_eq!(client.inner().calls(), 2);
        assert_eq!(client.used_today(), 2);
    }

    #[tokio::test]
    async fn mock_streams_reply_in_pieces() {
        let client = MockLlm::with_reply("one two three");
        let req = ChatRequest::new("sys", "user");
        let pieces: Vec<String> = client
            .complete_stream(&req)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(pieces, vec!["one ", "two ", "three"]);
    }

    #[tokio::test]
    async fn mock_fails_on_needle_and_disabled_always_fails() {
        let client = MockLlm::new().failing_when("boom");
        assert!(client.complete(&ChatRequest::new("s", "boom here")).await.is_err());
        assert!(client.complete(&ChatRequest::new("s", "fine")).await.is_ok());
        assert!(DisabledLlm.complete(&ChatRequest::new("s", "u")).await.is_err());
    }

    #[test]
    #[serial_test::serial]
    fn factory_respects_test_mode_and_enabled_flag() {
        std::env::set_var("AI_TEST_MODE", "mock");
        let c = build_llm_client(&AiConfig::default());
        assert_eq!(c.provider_name(), "mock");
        std::env::remove_var("AI_TEST_MODE");

        let c = build_llm_client(&AiConfig::default());
        assert_eq!(c.provider_name(), "disabled");

        let cfg = AiConfig {
            enabled: true,
            api_key: "k".into(),
            ..AiConfig::default()
        };
        let c = build_llm_client(&cfg);
        assert_eq!(c.provider_name(), "openai");
        assert_eq!(c.model(), "gpt-4o-mini");
    }
}
