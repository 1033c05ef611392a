//! Reflex kubehub: the transport seam between the reflector and the API server.
//!
//! [`Transport`] is the only way the reflector talks to the cluster. [`KubeTransport`] backs it
//! with a `kube::Client` (kubeconfig or in-cluster, TLS and auth owned by kube);
//! [`mock::MockTransport`] backs it with scripted responses for tests.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::Client;
use reflex_core::{Error, Result};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub mod mock;

pub use http::Method;

/// Raw body chunks of a long-lived watch response. The stream ends, or yields one error, on close.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Result of a one-shot request.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }

    /// Decode the body as JSON, naming `what` in the error.
    pub fn json<T: serde::de::DeserializeOwned>(&self, what: &'static str) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|source| Error::Decode { what, source })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one request and return status, headers and body. Non-2xx statuses are returned, not raised.
    async fn request_once(&self, path: &str, method: Method) -> Result<TransportResponse>;

    /// Open a streaming read at `path` (query string included).
    async fn open_watch_stream(&self, path: &str) -> Result<ByteStream>;
}

static KUBE_CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide kube client, built once from kubeconfig or the in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    let client = KUBE_CLIENT
        .get_or_try_init(|| async {
            let client = Client::try_default().await.map_err(|e| Error::Transport(e.to_string()))?;
            info!(namespace = %client.default_namespace(), "kube client ready");
            Ok::<_, Error>(client)
        })
        .await?;
    Ok(client.clone())
}

/// Transport over a `kube::Client`.
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    fn build(path: &str, method: Method) -> Result<http::Request<Vec<u8>>> {
        http::Request::builder()
            .method(method)
            .uri(path)
            .body(Vec::new())
            .map_err(|e| Error::Transport(format!("building request for {}: {}", path, e)))
    }
}

#[async_trait]
impl Transport for KubeTransport {
    async fn request_once(&self, path: &str, method: Method) -> Result<TransportResponse> {
        let req = Self::build(path, method.clone())?;
        metrics::counter!("transport_requests_total", 1u64, "method" => method.to_string());
        match self.client.request_text(req).await {
            Ok(text) => Ok(TransportResponse { status: 200, headers: http::HeaderMap::new(), body: Bytes::from(text) }),
            // API errors are a status, not a transport failure
            Err(kube::Error::Api(ae)) => {
                debug!(path = %path, code = ae.code, reason = %ae.reason, "api error response");
                Ok(TransportResponse { status: ae.code, headers: http::HeaderMap::new(), body: Bytes::from(ae.message) })
            }
            Err(e) => Err(Error::Transport(format!("{} {}: {}", method, path, e))),
        }
    }

    async fn open_watch_stream(&self, path: &str) -> Result<ByteStream> {
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

        let req = Self::build(path, Method::GET)?;
        metrics::counter!("transport_requests_total", 1u64, "method" => "WATCH");
        let reader = self
            .client
            .request_stream(req)
            .await
            .map_err(|e| Error::Transport(format!("opening watch {}: {}", path, e)))?;
        // futures AsyncBufRead -> tokio AsyncRead -> Bytes stream
        let stream = ReaderStream::new(reader.compat())
            .map(|chunk| chunk.map_err(|e| Error::Transport(format!("watch read: {}", e))));
        Ok(stream.boxed())
    }
}

/// Append `key=value` pairs (percent-encoded) to `path`.
pub fn with_query(path: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    let query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{}{}{}", path, sep, query.join("&"))
}
