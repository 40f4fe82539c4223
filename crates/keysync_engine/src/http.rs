//! HTTP transport implementation.
//!
//! Maps the three transport calls onto `POST` endpoints with CBOR bodies:
//!
//! | Call | Endpoint |
//! |---|---|
//! | `read_batch` | `{base}/kv/read` |
//! | `write_batch` | `{base}/kv/write` |
//! | `remove_batch` | `{base}/kv/remove` |
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so any library
//! (reqwest, hyper, a platform fetch bridge) can be plugged in.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{SyncError, SyncResult};
use crate::transport::{RawRead, RemoteQuery, RemoteTransport, SealedRecord, WriteStatus};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const READ_PATH: &str = "/kv/read";
const WRITE_PATH: &str = "/kv/write";
const REMOVE_PATH: &str = "/kv/remove";

/// HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// Body of `POST /kv/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Conditional reads, answered in order.
    pub queries: Vec<RemoteQuery>,
}

/// Response to `POST /kv/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    /// One answer per query.
    pub results: Vec<RawRead>,
}

/// Body of `POST /kv/write`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Records to store.
    pub records: Vec<SealedRecord>,
}

/// Response to `POST /kv/write`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    /// One status per record.
    pub statuses: Vec<WriteStatus>,
}

/// Body of `POST /kv/remove`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRequest {
    /// Keys to delete.
    pub keys: Vec<String>,
}

/// HTTP-based remote transport.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the service (e.g., "https://kv.example.com").
    base_url: String,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the message of the most recent failed request, if the last
    /// request failed.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn post_cbor<Req, Res>(&self, endpoint: &str, request: &Req) -> SyncResult<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let body = to_cbor(request)
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;

        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.client.post(&url, body).await.map_err(|e| {
            tracing::warn!(%url, error = %e, "remote request failed");
            *self.last_error.write() = Some(e.clone());
            SyncError::transport_retryable(e)
        })?;
        *self.last_error.write() = None;

        from_cbor(&response)
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))
    }
}

#[async_trait]
impl<C: HttpClient> RemoteTransport for HttpTransport<C> {
    async fn read_batch(&self, queries: &[RemoteQuery]) -> SyncResult<Vec<RawRead>> {
        let request = ReadRequest {
            queries: queries.to_vec(),
        };
        let response: ReadResponse = self.post_cbor(READ_PATH, &request).await?;
        if response.results.len() != queries.len() {
            return Err(SyncError::Protocol(format!(
                "expected {} read results, got {}",
                queries.len(),
                response.results.len()
            )));
        }
        Ok(response.results)
    }

    async fn write_batch(&self, records: &[SealedRecord]) -> SyncResult<Vec<WriteStatus>> {
        let request = WriteRequest {
            records: records.to_vec(),
        };
        let response: WriteResponse = self.post_cbor(WRITE_PATH, &request).await?;
        Ok(response.statuses)
    }

    async fn remove_batch(&self, keys: &[String]) -> SyncResult<()> {
        let request = RemoveRequest {
            keys: keys.to_vec(),
        };
        let _: () = self.post_cbor(REMOVE_PATH, &request).await?;
        Ok(())
    }
}

/// Serves one `/kv/*` request body against any [`RemoteTransport`].
///
/// This is the server half of [`HttpTransport`]'s wire format; mount it
/// behind an HTTP router, or use it through [`LoopbackClient`] in tests.
///
/// # Errors
///
/// Returns an error string for unknown paths, undecodable bodies and
/// failures of the backing transport.
pub async fn serve_kv<T>(backend: &T, path: &str, body: &[u8]) -> Result<Vec<u8>, String>
where
    T: RemoteTransport + ?Sized,
{
    let encode = |r: SyncResult<Vec<u8>>| r.map_err(|e| e.to_string());
    match path {
        READ_PATH => {
            let request: ReadRequest = from_cbor(body).map_err(|e| e.to_string())?;
            let results = backend
                .read_batch(&request.queries)
                .await
                .map_err(|e| e.to_string())?;
            encode(to_cbor(&ReadResponse { results }))
        }
        WRITE_PATH => {
            let request: WriteRequest = from_cbor(body).map_err(|e| e.to_string())?;
            let statuses = backend
                .write_batch(&request.records)
                .await
                .map_err(|e| e.to_string())?;
            encode(to_cbor(&WriteResponse { statuses }))
        }
        REMOVE_PATH => {
            let request: RemoveRequest = from_cbor(body).map_err(|e| e.to_string())?;
            backend
                .remove_batch(&request.keys)
                .await
                .map_err(|e| e.to_string())?;
            encode(to_cbor(&()))
        }
        other => Err(format!("unknown endpoint {other}")),
    }
}

/// An HTTP client that routes requests straight to an in-process backend.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<T: RemoteTransport> {
    backend: T,
}

impl<T: RemoteTransport> LoopbackClient<T> {
    /// Creates a new loopback client serving from `backend`.
    pub fn new(backend: T) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<T: RemoteTransport> HttpClient for LoopbackClient<T> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        let path = url.find("/kv/").map(|i| &url[i..]).unwrap_or(url);
        serve_kv(&self.backend, path, &body).await
    }
}
