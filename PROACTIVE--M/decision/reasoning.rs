use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::DecisionError;

/// Generation settings passed with every prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Model identifier forwarded to the service.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion length cap.
    pub max_tokens: u32,
    /// Per-call deadline.
    pub timeout: Duration,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: "default".into(),
            temperature: 0.2,
            max_tokens: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Text-generation backend consulted by the decision stage.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Generates a completion for `prompt`.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, DecisionError>;

    /// Whether calls are worth attempting.
    fn is_available(&self) -> bool;

    /// Re-checks an unavailable service and reports the new state. Clients
    /// that cannot recover keep the default.
    async fn refresh_availability(&self) -> bool {
        self.is_available()
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

/// Default spacing between probes while the service is unreachable.
pub const DEFAULT_REPROBE_INTERVAL: Duration = Duration::from_secs(30);

/// JSON-over-HTTP client: POSTs `{prompt, model, temperature, max_tokens}`
/// and reads `{text}`.
///
/// A failed probe or connection marks the client unavailable. While
/// unavailable, [`refresh_availability`](ReasoningClient::refresh_availability)
/// probes again at most once per reprobe interval.
#[derive(Debug)]
pub struct HttpReasoningClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    available: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
    reprobe_interval: Duration,
}

impl HttpReasoningClient {
    /// Creates the client. It reports available until a probe says otherwise.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, DecisionError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
            available: AtomicBool::new(true),
            last_probe: Mutex::new(None),
            reprobe_interval: DEFAULT_REPROBE_INTERVAL,
        })
    }

    /// Overrides how often an unreachable service is probed again.
    #[must_use]
    pub const fn with_reprobe_interval(mut self, interval: Duration) -> Self {
        self.reprobe_interval = interval;
        self
    }

    /// Endpoint the client posts to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends a tiny generation request and records whether it succeeded.
    pub async fn probe(&self) -> bool {
        let payload = json!({
            "prompt": "system check",
            "max_tokens": 8,
            "temperature": 0.0,
        });
        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(5))
            .json(&payload);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let ok = match req.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(endpoint = %self.endpoint, status = %response.status(), "reasoning probe rejected");
                false
            }
            Err(err) => {
                warn!(endpoint = %self.endpoint, %err, "reasoning service unreachable");
                false
            }
        };
        *self.last_probe.lock() = Some(Instant::now());
        self.available.store(ok, Ordering::Relaxed);
        ok
    }

    fn probe_due(&self) -> bool {
        let last = *self.last_probe.lock();
        match last {
            Some(at) => at.elapsed() >= self.reprobe_interval,
            None => true,
        }
    }
}

#[async_trait]
impl ReasoningClient for HttpReasoningClient {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, DecisionError> {
        let payload = GenerateRequest {
            prompt,
            model: &params.model,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };
        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(params.timeout)
            .json(&payload);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let response = match req.send().await {
            Ok(response) => response,
            Err(err) => {
                if err.is_connect() {
                    self.available.store(false, Ordering::Relaxed);
                }
                return Err(err.into());
            }
        };
        let body: GenerateResponse = response.error_for_status()?.json().await?;
        self.available.store(true, Ordering::Relaxed);
        debug!(chars = body.text.len(), "reasoning reply received");
        Ok(body.text)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn refresh_availability(&self) -> bool {
        if self.is_available() {
            return true;
        }
        if !self.probe_due() {
            return false;
        }
        debug!(endpoint = %self.endpoint, "probing reasoning service again");
        self.probe().await
    }
}

/// Client used when no reasoning service is configured. Never available.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineReasoningClient;

#[async_trait]
impl ReasoningClient for OfflineReasoningClient {
    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, DecisionError> {
        Err(DecisionError::Unavailable)
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        body.len() >= length
    }

    async fn serve_text(listener: TcpListener, text: &'static str) {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0_u8; 1024];
                loop {
                    let read = socket.read(&mut chunk).await.unwrap_or(0);
                    if read == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..read]);
                    if request_complete(&request) {
                        break;
                    }
                }
                let body = json!({ "text": text }).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_marks_client_unavailable() {
        let client = HttpReasoningClient::new(
            "http://127.0.0.1:1/generate",
            Some(String::new()),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(client.is_available());
        assert!(client.api_key.is_none());
        assert!(!client.probe().await);
        assert!(!client.is_available());

        let params = GenerationParams {
            timeout: Duration::from_secs(2),
            ..GenerationParams::default()
        };
        let err = client.generate("hello", &params).await.unwrap_err();
        assert!(matches!(err, DecisionError::Http(_)));
    }

    #[test]
    fn request_body_carries_generation_settings() {
        let body = serde_json::to_value(GenerateRequest {
            prompt: "p",
            model: "m",
            temperature: 0.5,
            max_tokens: 12,
        })
        .unwrap();
        assert_eq!(
            body,
            json!({ "prompt": "p", "model": "m", "temperature": 0.5, "max_tokens": 12 })
        );
    }

    #[tokio::test]
    async fn service_coming_up_later_is_picked_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpReasoningClient::new(
            format!("http://{addr}/generate"),
            None,
            Duration::from_secs(2),
        )
        .unwrap()
        .with_reprobe_interval(Duration::ZERO);
        assert!(!client.probe().await);
        assert!(!client.refresh_availability().await);

        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(serve_text(listener, "notify"));
        assert!(client.refresh_availability().await);
        assert!(client.is_available());
        let params = GenerationParams {
            timeout: Duration::from_secs(2),
            ..GenerationParams::default()
        };
        assert_eq!(client.generate("hello", &params).await.unwrap(), "notify");
    }

    #[tokio::test]
    async fn recheck_waits_for_the_interval() {
        let client = HttpReasoningClient::new(
            "http://127.0.0.1:1/generate",
            None,
            Duration::from_secs(2),
        )
        .unwrap()
        .with_reprobe_interval(Duration::from_secs(3600));
        assert!(!client.probe().await);
        let before = *client.last_probe.lock();
        assert!(!client.refresh_availability().await);
        assert_eq!(*client.last_probe.lock(), before);
    }
}
