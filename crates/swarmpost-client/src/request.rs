//! Prepared requests -- a typed request built once and sent through the dispatcher.

use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use swarmpost_protocol::messages::{METHOD_BATCH, METHOD_INFO, METHOD_STORE};

use crate::dispatcher::{DispatchError, Dispatcher, RequestTimeouts, Target};
use crate::transport::{HttpMethod, ResponseInfo, ServerRequest};

/// Request payload before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    /// Raw bytes, sent unchanged.
    Bytes(Bytes),
    /// Base64 text, decoded before sending.
    Base64(String),
}

impl RequestBody {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, DispatchError> {
        serde_json::to_value(value)
            .map(RequestBody::Json)
            .map_err(|e| DispatchError::InvalidBody(e.to_string()))
    }

    pub fn encode(&self) -> Result<Bytes, DispatchError> {
        match self {
            RequestBody::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| DispatchError::InvalidBody(e.to_string())),
            RequestBody::Bytes(bytes) => Ok(bytes.clone()),
            RequestBody::Base64(text) => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map(Bytes::from)
                .map_err(|e| DispatchError::InvalidBody(format!("bad base64 body: {e}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Store,
    Batch,
    Info,
    /// Path on a fixed server, e.g. `/room/abc/messages/since/12`.
    Server(String),
}

impl Endpoint {
    pub fn path(&self) -> &str {
        match self {
            Endpoint::Store => METHOD_STORE,
            Endpoint::Batch => METHOD_BATCH,
            Endpoint::Info => METHOD_INFO,
            Endpoint::Server(path) => path,
        }
    }
}

/// A request built once and sendable many times.
///
/// For server targets `method` and `headers` are authoritative: they replace
/// the method of the target's `ServerRequest` and are merged over its headers
/// when sent.
pub struct PreparedRequest<R> {
    pub method: HttpMethod,
    pub target: Target,
    pub endpoint: Endpoint,
    pub headers: HashMap<String, String>,
    pub body: Option<RequestBody>,
    pub timeouts: RequestTimeouts,
    _response: PhantomData<fn() -> R>,
}

impl<R> Clone for PreparedRequest<R> {
    fn clone(&self) -> Self {
        Self {
            method: self.method,
            target: self.target.clone(),
            endpoint: self.endpoint.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeouts: self.timeouts,
            _response: PhantomData,
        }
    }
}

impl<R: DeserializeOwned> PreparedRequest<R> {
    pub fn new(method: HttpMethod, target: Target, endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            method,
            target,
            endpoint,
            headers: HashMap::new(),
            body: None,
            timeouts: RequestTimeouts::uniform(timeout),
            _response: PhantomData,
        }
    }

    /// Request to `path` on a fixed server at `base_url`.
    pub fn server(
        method: HttpMethod,
        base_url: &str,
        server_public_key: impl Into<String>,
        path: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let path = path.into();
        let target = Target::Server(ServerRequest {
            method,
            url: format!("{}{path}", base_url.trim_end_matches('/')),
            headers: HashMap::new(),
            server_public_key: server_public_key.into(),
        });
        Self::new(method, target, Endpoint::Server(path), timeout)
    }

    /// JSON-RPC call to a storage node: `{"method": <endpoint>, "params": ...}`.
    pub fn rpc<P: Serialize>(
        target: Target,
        endpoint: Endpoint,
        params: &P,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let params =
            serde_json::to_value(params).map_err(|e| DispatchError::InvalidBody(e.to_string()))?;
        let body = serde_json::json!({ "method": endpoint.path(), "params": params });
        Ok(Self::new(HttpMethod::Post, target, endpoint, timeout).with_body(RequestBody::Json(body)))
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_path_build_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request_and_path_build = timeout;
        self
    }

    pub fn retry_count(&self) -> u8 {
        self.target.retry_count()
    }

    /// The target as dispatched, with this request's method and headers
    /// applied to server targets.
    pub fn dispatch_target(&self) -> Cow<'_, Target> {
        let apply = |request: &ServerRequest| {
            let mut request = request.clone();
            request.method = self.method;
            request
                .headers
                .extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
            request
        };
        match &self.target {
            Target::Server(request) => Cow::Owned(Target::Server(apply(request))),
            Target::ServerUpload(request) => Cow::Owned(Target::ServerUpload(apply(request))),
            Target::ServerDownload(request) => Cow::Owned(Target::ServerDownload(apply(request))),
            Target::Cached { .. }
            | Target::Snode { .. }
            | Target::RandomSnode { .. }
            | Target::RandomSnodeLatestNetworkTime { .. } => Cow::Borrowed(&self.target),
        }
    }

    /// Send and decode the body as `R`. An empty response decodes from `null`.
    pub async fn send(&self, dispatcher: &Dispatcher) -> Result<(ResponseInfo, R), DispatchError> {
        let body = self.body.as_ref().map(RequestBody::encode).transpose()?;
        let target = self.dispatch_target();
        tracing::trace!(
            target_kind = target.name(),
            endpoint = self.endpoint.path(),
            method = self.method.as_str(),
            "dispatch: sending prepared request"
        );
        let (info, bytes) = dispatcher
            .send_with_timeouts(body, &target, self.timeouts)
            .await?;
        let decoded = match bytes {
            Some(bytes) => serde_json::from_slice(&bytes),
            None => serde_json::from_value(serde_json::Value::Null),
        }
        .map_err(|e| DispatchError::Parsing(e.to_string()))?;
        Ok((info, decoded))
    }
}
