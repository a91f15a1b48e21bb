use crate::error::QueryError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Raw response body, chunked as it arrived.
pub type ByteStream = BoxStream<'static, Result<Bytes, QueryError>>;

/// Payload of one question sent to the answering endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub client_id: String,
    pub conversation_id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

impl QueryRequest {
    pub fn new(
        client_id: impl Into<String>,
        conversation_id: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            conversation_id: conversation_id.into(),
            question: question.into(),
            filters: None,
        }
    }

    pub fn with_filters(mut self, filters: Value) -> Self {
        self.filters = Some(filters);
        self
    }
}

/// Opens one long-lived authenticated request and exposes its body.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    /// Fails with [`QueryError::Status`] for a non-success response and
    /// [`QueryError::Transport`] when the request never completed.
    async fn open(&self, bearer: &str, request: &QueryRequest) -> Result<ByteStream, QueryError>;
}

/// `POST`s the request as JSON with a bearer header and streams the body.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl QueryTransport for HttpTransport {
    async fn open(&self, bearer: &str, request: &QueryRequest) -> Result<ByteStream, QueryError> {
        debug!(
            endpoint = %self.endpoint,
            conversation = %request.conversation_id,
            "opening query stream"
        );
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(bearer)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|err| QueryError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(%err, "failed to read error body");
                    String::new()
                }
            };
            return Err(QueryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| QueryError::Stream(err.to_string())))
            .boxed())
    }
}

/// Serves canned chunks, optionally spaced out in time. Used for offline runs.
#[derive(Debug, Clone, Default)]
pub struct ReplayTransport {
    chunks: Vec<Result<Bytes, QueryError>>,
    delay: Option<Duration>,
    reject: Option<QueryError>,
}

impl ReplayTransport {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(|chunk| Ok(chunk.into())).collect(),
            delay: None,
            reject: None,
        }
    }

    /// Transport whose request fails before any stream opens.
    pub fn rejecting(error: QueryError) -> Self {
        Self {
            reject: Some(error),
            ..Self::default()
        }
    }

    /// Split one body into chunks of `size` bytes.
    pub fn chunked(body: &[u8], size: usize) -> Self {
        Self::new(
            body.chunks(size.max(1))
                .map(Bytes::copy_from_slice)
                .collect::<Vec<_>>(),
        )
    }

    /// Append a mid-stream read failure after the canned chunks.
    pub fn then_fail(mut self, error: QueryError) -> Self {
        self.chunks.push(Err(error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl QueryTransport for ReplayTransport {
    async fn open(&self, _bearer: &str, _request: &QueryRequest) -> Result<ByteStream, QueryError> {
        if let Some(error) = &self.reject {
            return Err(error.clone());
        }
        let chunks = stream::iter(self.chunks.clone());
        match self.delay {
            Some(delay) => Ok(chunks
                .then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    chunk
                })
                .boxed()),
            None => Ok(chunks.boxed()),
        }
    }
}
