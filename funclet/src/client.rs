//! Call clients: the only path from a handle to its service.
//!
//! Two disciplines over the same wire contract. `BlockingCallClient` (ureq)
//! blocks the calling thread; `AsyncCallClient` (reqwest) suspends the
//! calling task and pools connections across calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::{CallArgs, CodecError, PayloadCodec};

/// Default bound on pooled connections per client.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The service could not be reached or the connection died mid-call.
    #[error("transport failure calling {url}: {message}")]
    Transport { url: String, message: String },

    /// The remote callable faulted; the message is whatever the service sent.
    #[error("remote call failed with status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Blocking call client with agent-level connection reuse.
///
/// Do not use from inside an async task; that is what [`AsyncCallClient`]
/// is for.
pub struct BlockingCallClient {
    agent: ureq::Agent,
    url: String,
    codec: Arc<dyn PayloadCodec>,
}

impl BlockingCallClient {
    pub fn new(url: String, codec: Arc<dyn PayloadCodec>, call_timeout: Option<Duration>) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(call_timeout)
            .build()
            .new_agent();
        Self { agent, url, codec }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn call(&self, call: &CallArgs) -> Result<serde_json::Value, CallError> {
        let payload = self.codec.encode_call(call)?;

        let mut response = self
            .agent
            .post(&self.url)
            .header("Content-Type", self.codec.content_type())
            .send(&payload[..])
            .map_err(|e| CallError::Transport {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .body_mut()
            .read_to_vec()
            .map_err(|e| CallError::Transport {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        if !status.is_success() {
            return Err(CallError::Remote {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(self.codec.decode_value(&body)?)
    }
}

/// Suspend-capable call client with a rebuildable pooled session.
///
/// If a call hits a transport-level fault, the session is discarded, a fresh
/// one is built, and the call is retried exactly once; a second failure
/// propagates. Remote faults are never retried.
pub struct AsyncCallClient {
    url: String,
    codec: Arc<dyn PayloadCodec>,
    max_connections: usize,
    call_timeout: Option<Duration>,
    session: Mutex<Option<reqwest::Client>>,
}

impl AsyncCallClient {
    /// Session construction here is best-effort: an environment that cannot
    /// build a client yet must not prevent constructing the handle. The
    /// first call retries construction.
    pub fn new(
        url: String,
        codec: Arc<dyn PayloadCodec>,
        max_connections: usize,
        call_timeout: Option<Duration>,
    ) -> Self {
        let session = Mutex::new(Self::build_session(&url, max_connections, call_timeout));
        Self {
            url,
            codec,
            max_connections,
            call_timeout,
            session,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_session(
        url: &str,
        max_connections: usize,
        call_timeout: Option<Duration>,
    ) -> Option<reqwest::Client> {
        let mut builder = reqwest::Client::builder().pool_max_idle_per_host(max_connections);
        if let Some(timeout) = call_timeout {
            builder = builder.timeout(timeout);
        }
        match builder.build() {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(%url, error = %e, "call session not built; first call will retry");
                None
            }
        }
    }

    fn session(&self) -> Result<reqwest::Client, CallError> {
        let mut guard = self.session.lock().unwrap();
        if guard.is_none() {
            *guard = Self::build_session(&self.url, self.max_connections, self.call_timeout);
        }
        guard.clone().ok_or_else(|| CallError::Transport {
            url: self.url.clone(),
            message: "call session could not be constructed".to_string(),
        })
    }

    fn discard_session(&self) {
        *self.session.lock().unwrap() = None;
    }

    pub async fn call(&self, call: &CallArgs) -> Result<serde_json::Value, CallError> {
        let payload = self.codec.encode_call(call)?;

        match self.send(&payload).await {
            Err(CallError::Transport { message, .. }) => {
                tracing::warn!(
                    url = %self.url,
                    error = %message,
                    "transport fault; rebuilding session and retrying once"
                );
                self.discard_session();
                self.send(&payload).await
            }
            other => other,
        }
    }

    async fn send(&self, payload: &[u8]) -> Result<serde_json::Value, CallError> {
        let session = self.session()?;

        let response = session
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, self.codec.content_type())
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| CallError::Transport {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| CallError::Transport {
            url: self.url.clone(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(CallError::Remote {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(self.codec.decode_value(&body)?)
    }
}
