//! `fetch` as a loop task.
//!
//! The request runs on the background runtime. Absolute URLs go through
//! `reqwest`; routes beginning with `/` are answered by the host's
//! [`LocalHandler`] on the blocking pool. Either way the outcome lands in a
//! slot shared with the task and is delivered to script when the loop
//! processes the ready signal.

use super::{lock, Background, DispatchKind, Task, TaskContext, TaskId, TaskState};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Request as built by the script `fetch` glue.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            ..Default::default()
        }
    }

    pub fn method(&self) -> &str {
        if self.method.is_empty() {
            "GET"
        } else {
            &self.method
        }
    }

    pub fn is_local(&self) -> bool {
        self.url.starts_with('/')
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            status_text: String::new(),
            url: String::new(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// `200 OK` with a JSON body and content type.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string()).with_header("content-type", "application/json")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// What script receives: a response or an `Error` with name and message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FetchOutcome {
    Response(FetchResponse),
    Error { name: String, message: String },
}

impl FetchOutcome {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Error {
            name: "TypeError".to_string(),
            message: message.into(),
        }
    }

    pub fn fetch_error(message: impl Into<String>) -> Self {
        Self::Error {
            name: "FetchError".to_string(),
            message: message.into(),
        }
    }
}

/// Host handler for in-process routes.
pub trait LocalHandler: Send + Sync {
    fn handle(&self, request: &FetchRequest) -> FetchResponse;
}

impl<F> LocalHandler for F
where
    F: Fn(&FetchRequest) -> FetchResponse + Send + Sync,
{
    fn handle(&self, request: &FetchRequest) -> FetchResponse {
        self(request)
    }
}

#[derive(Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    local: Option<Arc<dyn LocalHandler>>,
}

impl FetchClient {
    pub fn new(timeout: Option<Duration>, local: Option<Arc<dyn LocalHandler>>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|err| Error::init(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { http, local })
    }

    pub async fn perform(&self, request: FetchRequest) -> FetchOutcome {
        let url = request.url.clone();
        let result = if request.is_local() {
            self.perform_local(request).await
        } else {
            self.perform_network(request).await
        };
        match result {
            Ok(response) => FetchOutcome::Response(response),
            Err(outcome) => {
                tracing::debug!(url = %url, outcome = ?outcome, "fetch failed");
                outcome
            }
        }
    }

    async fn perform_local(
        &self,
        request: FetchRequest,
    ) -> std::result::Result<FetchResponse, FetchOutcome> {
        let Some(handler) = self.local.clone() else {
            return Err(FetchOutcome::type_error(format!(
                "no local handler for route '{}'",
                request.url
            )));
        };

        let url = request.url.clone();
        let mut response = tokio::task::spawn_blocking(move || handler.handle(&request))
            .await
            .map_err(|err| FetchOutcome::fetch_error(format!("local handler failed: {err}")))?;
        if response.url.is_empty() {
            response.url = url;
        }
        Ok(response)
    }

    async fn perform_network(
        &self,
        request: FetchRequest,
    ) -> std::result::Result<FetchResponse, FetchOutcome> {
        let method = reqwest::Method::from_bytes(request.method().as_bytes()).map_err(|_| {
            FetchOutcome::type_error(format!("'{}' is not a valid HTTP method", request.method))
        })?;
        let url = reqwest::Url::parse(&request.url).map_err(|err| {
            FetchOutcome::type_error(format!("invalid URL '{}': {err}", request.url))
        })?;

        let mut builder = self.http.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.text().await.map_err(transport_error)?;

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            url,
            headers,
            body,
        })
    }
}

fn transport_error(err: reqwest::Error) -> FetchOutcome {
    if err.is_builder() {
        FetchOutcome::type_error(err.to_string())
    } else {
        FetchOutcome::fetch_error(err.to_string())
    }
}

pub struct FetchTask {
    id: TaskId,
    client: FetchClient,
    request: Option<FetchRequest>,
    outcome: Arc<Mutex<Option<FetchOutcome>>>,
    in_flight: Option<AbortHandle>,
}

impl FetchTask {
    pub fn new(client: FetchClient, request: FetchRequest) -> Self {
        Self {
            id: 0,
            client,
            request: Some(request),
            outcome: Arc::new(Mutex::new(None)),
            in_flight: None,
        }
    }
}

impl Task for FetchTask {
    fn set_id(&mut self, id: TaskId) {
        self.id = id;
    }

    fn id(&self) -> TaskId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "fetch"
    }

    fn start(&mut self, background: &Background) {
        let Some(request) = self.request.take() else {
            return;
        };
        let client = self.client.clone();
        let slot = self.outcome.clone();
        self.in_flight = Some(background.ready_when(self.id, async move {
            let outcome = client.perform(request).await;
            *lock(&slot) = Some(outcome);
        }));
    }

    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskState> {
        self.in_flight = None;
        let outcome = lock(&self.outcome)
            .take()
            .unwrap_or_else(|| FetchOutcome::fetch_error("request finished without a result"));
        let payload = serde_json::to_value(&outcome)?;
        cx.host().dispatch(DispatchKind::Fetch, self.id, payload)?;
        Ok(TaskState::Finished)
    }

    fn cancel(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_payload_shape() {
        let response = FetchResponse::json(&json!({"key": "value"}));
        let payload = serde_json::to_value(FetchOutcome::Response(response)).unwrap();
        assert_eq!(payload["type"], "response");
        assert_eq!(payload["status"], 200);
        assert_eq!(payload["statusText"], "");
        assert_eq!(payload["body"], "{\"key\":\"value\"}");
        assert_eq!(payload["headers"], json!([["content-type", "application/json"]]));

        let payload = serde_json::to_value(FetchOutcome::type_error("bad")).unwrap();
        assert_eq!(payload, json!({"type": "error", "name": "TypeError", "message": "bad"}));
    }

    #[test]
    fn test_request_defaults() {
        let request: FetchRequest = serde_json::from_value(json!({"url": "/ping"})).unwrap();
        assert_eq!(request.method(), "GET");
        assert!(request.is_local());
        assert!(request.body.is_none());
    }

    #[tokio::test]
    async fn test_local_route_uses_handler() {
        let handler: Arc<dyn LocalHandler> = Arc::new(|request: &FetchRequest| {
            FetchResponse::new(201, format!("{} {}", request.method(), request.url))
        });
        let client = FetchClient::new(None, Some(handler)).unwrap();

        let outcome = client.perform(FetchRequest::get("/ping")).await;
        let FetchOutcome::Response(response) = outcome else {
            panic!("expected response, got {outcome:?}");
        };
        assert_eq!(response.status, 201);
        assert_eq!(response.body, "GET /ping");
        assert_eq!(response.url, "/ping");
    }

    #[tokio::test]
    async fn test_local_route_without_handler() {
        let client = FetchClient::new(None, None).unwrap();
        let outcome = client.perform(FetchRequest::get("/ping")).await;
        assert!(matches!(outcome, FetchOutcome::Error { ref name, .. } if name == "TypeError"));
    }

    #[tokio::test]
    async fn test_malformed_url_is_type_error() {
        let client = FetchClient::new(None, None).unwrap();
        let outcome = client.perform(FetchRequest::get("not a url")).await;
        assert!(matches!(outcome, FetchOutcome::Error { ref name, .. } if name == "TypeError"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_fetch_error() {
        let client = FetchClient::new(Some(Duration::from_secs(2)), None).unwrap();
        let outcome = client.perform(FetchRequest::get("http://127.0.0.1:1/")).await;
        assert!(matches!(outcome, FetchOutcome::Error { ref name, .. } if name == "FetchError"));
    }
}
