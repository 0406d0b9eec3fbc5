//! Issues provider calls. Retry covers only the call that establishes the
//! stream; once a sequence handle exists, failures end the sequence.

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{truncate_for_details, InferenceError};
use crate::sse::{SseFrame, SseFramer};

pub const DEFAULT_TRANSPORT_RETRY_COUNT: usize = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Raw vendor events, already JSON-decoded, in arrival order.
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<Value, InferenceError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: usize,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_TRANSPORT_RETRY_COUNT,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn issue(&self, payload: Value) -> Result<RawEventStream, InferenceError>;
}

pub type DispatcherRef = Arc<dyn Dispatcher>;

/// One attempt at opening a vendor stream.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, payload: &Value) -> Result<RawEventStream, InferenceError>;
}

pub struct RetryingDispatcher<C> {
    connector: C,
    policy: RetryPolicy,
    label: String,
}

impl<C: Connector> RetryingDispatcher<C> {
    pub fn new(label: impl Into<String>, connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            label: label.into(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl<C: Connector> Dispatcher for RetryingDispatcher<C> {
    async fn issue(&self, payload: Value) -> Result<RawEventStream, InferenceError> {
        let payload = &payload;
        retry_transport_operation_async(&self.label, self.policy, || {
            self.connector.connect(payload)
        })
        .await
    }
}

pub(crate) async fn retry_transport_operation_async<T, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, InferenceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, InferenceError>>,
{
    let mut attempt = 0usize;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) if !error.code.is_retryable() => return Err(error),
            Err(error) => {
                if attempt >= policy.max_retries {
                    warn!(
                        provider = %label,
                        attempts = attempt + 1,
                        error = %error,
                        "giving up on stream connection"
                    );
                    return Err(error);
                }
                attempt += 1;
                warn!(
                    provider = %label,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %error,
                    "stream connection failed, retrying"
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// POST to the endpoint as-is.
    Fixed,
    /// POST to `{endpoint}/models/{model}{suffix}`. The payload's `model`
    /// field selects the path and is not sent in the body.
    ModelPath { suffix: String },
}

/// POSTs a JSON payload and frames the SSE response body.
#[derive(Clone)]
pub struct HttpSseConnector {
    client: Client,
    endpoint: String,
    route: Route,
    headers: Vec<(String, String)>,
    label: String,
}

impl HttpSseConnector {
    pub fn new(
        client: Client,
        label: impl Into<String>,
        endpoint: impl Into<String>,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            route: Route::Fixed,
            headers,
            label: label.into(),
        }
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn resolve_route(&self, payload: &Value) -> Result<(String, Value), InferenceError> {
        match &self.route {
            Route::Fixed => Ok((self.endpoint.clone(), payload.clone())),
            Route::ModelPath { suffix } => {
                let model = payload
                    .get("model")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|model| !model.is_empty())
                    .ok_or_else(|| {
                        InferenceError::conversion(format!(
                            "{} payload is missing `model`",
                            self.label
                        ))
                    })?;
                let model_path = if model.starts_with("models/") {
                    model.to_string()
                } else {
                    format!("models/{model}")
                };
                let url = format!("{}{suffix}", join_url(&self.endpoint, &model_path));
                let mut body = payload.clone();
                if let Some(object) = body.as_object_mut() {
                    object.remove("model");
                }
                Ok((url, body))
            }
        }
    }
}

/// Shared clients; loopback servers bypass any configured proxy.
pub(crate) fn shared_http_client(base_url: &str) -> Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if is_loopback_base_url(base_url) {
        LOOPBACK_CLIENT
            .get_or_init(|| {
                Client::builder()
                    .no_proxy()
                    .build()
                    .unwrap_or_else(|_| Client::new())
            })
            .clone()
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new).clone()
    }
}

fn is_loopback_base_url(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "[::1]"
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

#[async_trait]
impl Connector for HttpSseConnector {
    async fn connect(&self, payload: &Value) -> Result<RawEventStream, InferenceError> {
        let (url, body) = self.resolve_route(payload)?;
        let mut request = self
            .client
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.json(&body).send().await.map_err(|error| {
            InferenceError::connection(format!("{} transport failed: {error}", self.label))
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_string());
            return Err(InferenceError::connection(format!(
                "{} HTTP {status}: {}",
                self.label,
                truncate_for_details(&body, 400)
            ))
            .with_details(json!({ "status": status })));
        }

        info!(provider = %self.label, url = %url, "vendor stream opened");
        Ok(sse_json_events(self.label.clone(), response.bytes_stream()))
    }
}

/// Turns a byte stream into JSON events. A transport error or malformed
/// event ends the sequence with `StreamInterrupted`.
pub(crate) fn sse_json_events<S, B, E>(label: String, body: S) -> RawEventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut framer = SseFramer::new();
        let mut pending = Vec::new();
        let mut done = false;

        while !done {
            let Some(next) = body.next().await else {
                pending.extend(framer.finish());
                done = true;
                continue;
            };
            match next {
                Ok(bytes) => pending.extend(framer.push(bytes.as_ref())),
                Err(error) => {
                    yield Err(InferenceError::interrupted(format!(
                        "{label} stream read failed: {error}"
                    )));
                    return;
                }
            }

            for frame in pending.drain(..).collect::<Vec<_>>() {
                match frame {
                    SseFrame::Done => {
                        done = true;
                        break;
                    }
                    SseFrame::Data(data) => match serde_json::from_str::<Value>(&data) {
                        Ok(event) => {
                            debug!(provider = %label, event = %data, "vendor event");
                            yield Ok(event);
                        }
                        Err(error) => {
                            yield Err(invalid_event(&label, &data, error));
                            return;
                        }
                    },
                }
            }
        }

        // Frames flushed from an unterminated tail.
        for frame in pending {
            let SseFrame::Data(data) = frame else {
                break;
            };
            match serde_json::from_str::<Value>(&data) {
                Ok(event) => yield Ok(event),
                Err(error) => {
                    yield Err(invalid_event(&label, &data, error));
                    return;
                }
            }
        }
    })
}

fn invalid_event(label: &str, data: &str, error: serde_json::Error) -> InferenceError {
    InferenceError::interrupted(format!("Invalid {label} event JSON: {error}"))
        .with_details(json!({ "event": truncate_for_details(data, 800) }))
}
