//! Transport abstraction for opening completion streams

use std::{collections::HashMap, pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    types::CompletionRequest,
};

/// A stream of raw body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An opened response: status line plus an unread body
pub struct TransportResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body into a string (used for error bodies)
    pub async fn text(mut self) -> Result<String> {
        let mut raw = Vec::new();
        while let Some(chunk) = self.body.next().await {
            raw.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Opens completion streams
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// POST a request and return as soon as the status line arrives.
    ///
    /// Non-2xx statuses are returned as responses, not errors; classifying
    /// them is the caller's job.
    async fn open(
        &self,
        conversation_id: Option<&str>,
        request: &CompletionRequest,
    ) -> Result<TransportResponse>;
}

/// Where and how to reach a completion endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL, e.g. `http://localhost:8000`
    pub base_url: String,
    /// Endpoint path appended to the base URL
    pub path: String,
    /// Append the conversation id as a trailing path segment
    pub conversation_scoped: bool,
    /// Sent as the `user` query parameter
    pub user: Option<String>,
    /// Bearer token
    pub api_key: Option<String>,
    /// Whole-request timeout; a stream that outlives it fails
    pub timeout_secs: Option<u64>,
    /// Extra request headers
    pub headers: HashMap<String, String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            path: "/v1/chat/completions".to_string(),
            conversation_scoped: false,
            user: None,
            api_key: None,
            timeout_secs: None,
            headers: HashMap::new(),
        }
    }
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: EndpointConfig,
}

impl HttpTransport {
    /// Create a transport for an endpoint
    pub fn new(endpoint: EndpointConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = endpoint.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            client: builder.build()?,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Resolve the request URL for a conversation
    pub fn url(&self, conversation_id: Option<&str>) -> Result<reqwest::Url> {
        let joined = format!(
            "{}/{}",
            self.endpoint.base_url.trim_end_matches('/'),
            self.endpoint.path.trim_start_matches('/')
        );
        let mut url = reqwest::Url::parse(&joined)
            .map_err(|e| Error::InvalidConfig(format!("bad endpoint URL {}: {}", joined, e)))?;

        let conversation_id = conversation_id.filter(|id| !id.is_empty());
        if let (true, Some(id)) = (self.endpoint.conversation_scoped, conversation_id) {
            url.path_segments_mut()
                .map_err(|_| Error::InvalidConfig(format!("endpoint URL cannot take a path: {}", joined)))?
                .pop_if_empty()
                .push(id);
        }

        if let Some(ref user) = self.endpoint.user {
            url.query_pairs_mut().append_pair("user", user);
        }

        Ok(url)
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn open(
        &self,
        conversation_id: Option<&str>,
        request: &CompletionRequest,
    ) -> Result<TransportResponse> {
        let url = self.url(conversation_id)?;
        tracing::debug!(%url, "Opening completion stream");

        let mut builder = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        if let Some(ref key) = self.endpoint.api_key {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &self.endpoint.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes_stream().map(|chunk| chunk.map_err(Error::from));

        Ok(TransportResponse::new(status, Box::pin(body)))
    }
}
