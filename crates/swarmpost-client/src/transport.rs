//! Transport seam -- how request bytes reach a storage node or a server.
//!
//! `Transport` is the injection point: the dispatcher never talks HTTP
//! itself. `HttpTransport` sends directly over HTTPS with reqwest; tests and
//! onion-routing embedders provide their own implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

use swarmpost_protocol::SwarmNode;

/// Storage nodes answer 421 when the requested account is not in their swarm.
pub const STATUS_MISDIRECTED: u16 = 421;
/// Storage nodes answer 406 when the request timestamp drifted too far.
pub const STATUS_CLOCK_OUT_OF_SYNC: u16 = 406;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// A request to a fixed HTTP server (community server, file server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Hex X25519 key of the server, for transports that encrypt to it.
    pub server_public_key: String,
}

/// Metadata of a completed response.
///
/// `network_time_ms` is only set by the latest-network-time target and
/// carries the corrected timestamp the request was sent with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub code: u16,
    pub headers: HashMap<String, String>,
    pub network_time_ms: Option<u64>,
}

impl ResponseInfo {
    pub fn ok() -> Self {
        Self {
            code: 200,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("http status {code}")]
    Status { code: u16, body: Option<String> },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to parse response: {0}")]
    Parsing(String),
    #[error("transport does not support {0}")]
    UnsupportedTarget(&'static str),
}

impl TransportError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransportError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_misdirected(&self) -> bool {
        self.status_code() == Some(STATUS_MISDIRECTED)
    }

    pub fn is_clock_out_of_sync(&self) -> bool {
        self.status_code() == Some(STATUS_CLOCK_OUT_OF_SYNC)
    }

    /// Whether another node could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status { code, .. } => *code != STATUS_CLOCK_OUT_OF_SYNC,
            TransportError::UnsupportedTarget(_) => false,
            TransportError::InvalidUrl(_)
            | TransportError::Timeout
            | TransportError::Network(_)
            | TransportError::Parsing(_) => true,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON-RPC body to a storage node.
    async fn send_to_snode(
        &self,
        node: &SwarmNode,
        body: Bytes,
        timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Bytes)>;

    async fn send_to_server(
        &self,
        request: &ServerRequest,
        body: Option<Bytes>,
        timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Option<Bytes>)>;

    async fn upload(
        &self,
        _request: &ServerRequest,
        _data: Bytes,
        _timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Option<Bytes>)> {
        Err(TransportError::UnsupportedTarget("upload"))
    }

    async fn download(
        &self,
        _request: &ServerRequest,
        _timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Option<Bytes>)> {
        Err(TransportError::UnsupportedTarget("download"))
    }
}

// ============================================================================
// Direct HTTPS
// ============================================================================

/// Direct HTTPS transport.
///
/// Storage nodes present self-signed certificates identified by their
/// Ed25519 key, so certificate validation is disabled for node requests.
/// Server requests use a validating client.
pub struct HttpTransport {
    snode_client: reqwest::Client,
    server_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> TransportResult<Self> {
        let snode_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let server_client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            snode_client,
            server_client,
        })
    }

    fn request(
        &self,
        request: &ServerRequest,
        timeout: Duration,
    ) -> TransportResult<reqwest::RequestBuilder> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", request.url)))?;
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.server_client.request(method, url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }

    async fn execute(builder: reqwest::RequestBuilder) -> TransportResult<(ResponseInfo, Bytes)> {
        let resp = builder.send().await.map_err(map_reqwest_error)?;
        let code = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = resp.bytes().await.map_err(map_reqwest_error)?;

        if !(200..300).contains(&code) {
            return Err(TransportError::Status {
                code,
                body: Some(String::from_utf8_lossy(&body).into_owned()).filter(|b| !b.is_empty()),
            });
        }

        Ok((
            ResponseInfo {
                code,
                headers,
                network_time_ms: None,
            },
            body,
        ))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Parsing(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

fn non_empty(body: Bytes) -> Option<Bytes> {
    Some(body).filter(|b| !b.is_empty())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_to_snode(
        &self,
        node: &SwarmNode,
        body: Bytes,
        timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Bytes)> {
        let builder = self
            .snode_client
            .post(node.rpc_url())
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .body(body);
        tracing::trace!(%node, "transport: snode request");
        Self::execute(builder).await
    }

    async fn send_to_server(
        &self,
        request: &ServerRequest,
        body: Option<Bytes>,
        timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Option<Bytes>)> {
        let mut builder = self.request(request, timeout)?;
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let (info, body) = Self::execute(builder).await?;
        Ok((info, non_empty(body)))
    }

    async fn upload(
        &self,
        request: &ServerRequest,
        data: Bytes,
        timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Option<Bytes>)> {
        let builder = self
            .request(request, timeout)?
            .header("Content-Type", "application/octet-stream")
            .body(data);
        let (info, body) = Self::execute(builder).await?;
        Ok((info, non_empty(body)))
    }

    async fn download(
        &self,
        request: &ServerRequest,
        timeout: Duration,
    ) -> TransportResult<(ResponseInfo, Option<Bytes>)> {
        let (info, body) = Self::execute(self.request(request, timeout)?).await?;
        Ok((info, non_empty(body)))
    }
}
