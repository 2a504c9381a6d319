//! Worker HTTP client.
//!
//! Workers expose `GET /status` and `POST /generate`, both JSON in
//! camelCase. The client opens one HTTP/1.1 connection per call; polls
//! are seconds apart and generations take far longer than a handshake.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use gpurelay_state::{GenerationRequest, GenerationResponse, WorkerStatusReport};

use crate::error::{ClientError, ClientResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Calls a worker's status and generation endpoints.
///
/// Implementations do not time out on their own; callers bound each call.
pub trait WorkerClient: Send + Sync {
    fn status<'a>(&'a self, address: &'a str) -> BoxFuture<'a, ClientResult<WorkerStatusReport>>;

    fn generate<'a>(
        &'a self,
        address: &'a str,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, ClientResult<GenerationResponse>>;
}

/// [`WorkerClient`] over plain HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    user_agent: String,
}

impl Default for HttpWorkerClient {
    fn default() -> Self {
        Self {
            user_agent: concat!("gpurelay-health/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpWorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn call(&self, address: &str, method: Method, path: &str, body: Bytes) -> ClientResult<Bytes> {
        let endpoint = Endpoint::parse(address)?;
        let authority = endpoint.authority.as_str();
        let path = format!("{}{path}", endpoint.base_path);

        let stream = TcpStream::connect(authority)
            .await
            .map_err(|source| ClientError::Connect {
                address: authority.to_string(),
                source,
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "worker connection closed with error");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path.as_str())
            .header(HOST, authority)
            .header(USER_AGENT, &self.user_agent);
        if !body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let req = builder
            .body(Full::new(body))
            .map_err(|e| ClientError::Encode(e.to_string()))?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            debug!(%status, %authority, %path, "worker returned non-2xx");
            return Err(ClientError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }
}

impl WorkerClient for HttpWorkerClient {
    fn status<'a>(&'a self, address: &'a str) -> BoxFuture<'a, ClientResult<WorkerStatusReport>> {
        Box::pin(async move {
            let body = self.call(address, Method::GET, "/status", Bytes::new()).await?;
            serde_json::from_slice(&body).map_err(ClientError::Decode)
        })
    }

    fn generate<'a>(
        &'a self,
        address: &'a str,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, ClientResult<GenerationResponse>> {
        Box::pin(async move {
            let payload =
                serde_json::to_vec(request).map_err(|e| ClientError::Encode(e.to_string()))?;
            let body = self
                .call(address, Method::POST, "/generate", Bytes::from(payload))
                .await?;
            serde_json::from_slice(&body).map_err(ClientError::Decode)
        })
    }
}

/// Check that `address` is a usable worker address: `host:port`, an
/// optional `http://` scheme, and an optional path prefix.
pub fn check_address(address: &str) -> ClientResult<()> {
    Endpoint::parse(address).map(|_| ())
}

/// Where a worker listens: `host:port` plus an optional path prefix.
///
/// Addresses may omit the scheme; only `http` is supported.
#[derive(Debug, PartialEq, Eq)]
struct Endpoint {
    authority: String,
    /// Prefix for endpoint paths, without a trailing slash.
    base_path: String,
}

impl Endpoint {
    fn parse(address: &str) -> ClientResult<Self> {
        let invalid = |reason: &str| ClientError::Address {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = address.trim();
        let uri: Uri = if trimmed.contains("://") {
            trimmed.parse()
        } else {
            format!("http://{trimmed}").parse()
        }
        .map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;

        if uri.scheme_str() != Some("http") {
            return Err(invalid("only http is supported"));
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        if authority.port_u16().is_none() {
            return Err(invalid("missing port"));
        }

        Ok(Self {
            authority: authority.as_str().to_string(),
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }
}
