use std::{sync::Arc, time::Duration};

use chatrelay_core::{ByteStream, CoreError};
use futures::StreamExt;
use reqwest::{Client, header::HeaderMap};
use serde::de::DeserializeOwned;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

pub mod clients;
pub mod fingerprint;

pub use clients::{DolphinClient, DolphinConfig, ZaiClient, ZaiConfig};

/// `timeout_seconds` bounds connecting and every wait for the next read, so a body that keeps
/// arriving is never cut off however long the answer runs.
pub fn build_http_client(timeout_seconds: u64) -> Result<Client, CoreError> {
    let timeout = Duration::from_secs(timeout_seconds);
    Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()
        .map_err(|err| CoreError::Internal(format!("upstream http client init failed: {err}")))
}

/// Shared transport for one upstream: a pooled `reqwest` client plus an optional cap on
/// concurrently open chat streams.
#[derive(Clone)]
pub struct HttpRuntime {
    label: String,
    client: Client,
    max_inflight: Option<Arc<Semaphore>>,
}

impl HttpRuntime {
    pub fn new(label: impl Into<String>, client: Client, max_inflight: Option<usize>) -> Self {
        Self {
            label: label.into(),
            client,
            max_inflight: max_inflight.map(Semaphore::new).map(Arc::new),
        }
    }

    fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, CoreError> {
        self.max_inflight
            .as_ref()
            .map(|semaphore| {
                semaphore.clone().try_acquire_owned().map_err(|_| {
                    CoreError::UpstreamTransport(format!(
                        "upstream overloaded: max in-flight limit reached for {}",
                        self.label
                    ))
                })
            })
            .transpose()
    }

    /// Single POST, no retry. The in-flight permit lives as long as the returned body stream.
    pub async fn post_event_stream(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<ByteStream, CoreError> {
        let permit = self.acquire()?;
        debug!(
            event = "upstream.request.sent",
            upstream = %self.label,
            url = %url,
            body_bytes = body.len()
        );

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                CoreError::UpstreamTransport(format!("upstream request failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(
                event = "upstream.request.rejected",
                upstream = %self.label,
                status = status.as_u16(),
                detail = %detail
            );
            return Err(CoreError::UpstreamStatus { status: status.as_u16(), detail });
        }

        let stream = response.bytes_stream().map(move |chunk| {
            let _held = &permit;
            chunk.map_err(|err| {
                CoreError::UpstreamTransport(format!("upstream stream failed: {err}"))
            })
        });
        Ok(Box::pin(stream))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<T, CoreError> {
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|err| {
                CoreError::UpstreamTransport(format!("upstream request failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CoreError::UpstreamStatus { status: status.as_u16(), detail });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| {
                CoreError::UpstreamTransport(format!("upstream response parse failed: {err}"))
            })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;

    use axum::Router;

    pub(crate) async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }
}
