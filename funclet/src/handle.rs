//! The caller-held proxy for one function service, and its serializable
//! snapshot.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::client::{AsyncCallClient, BlockingCallClient, CallError};
use crate::codec::CallArgs;
use crate::exit_hook::{self, HookToken};
use crate::launcher::{Backend, ChildProcessRef};
use crate::service::{ReadinessWait, ServiceBuilder, ServiceError};

/// Everything needed to rebuild a handle on the other side of a process or
/// machine boundary. Never contains live OS handles: no process ids, no
/// sockets, no sessions.
///
/// The port is the resolved one, so reconstruction targets the original
/// address and either reattaches (service still listening) or re-launches
/// (port free again). A reconstructed handle is not guaranteed to refer to
/// the same process the original launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleState {
    pub artifact: Artifact,
    pub host: IpAddr,
    pub port: u16,
    pub backend: Backend,
    pub wait: ReadinessWait,
    pub backlog: u32,
    pub max_connections: usize,
    pub call_timeout: Option<Duration>,
}

impl HandleState {
    /// Re-run full construction from the captured inputs. Safe to call even
    /// when the original process is long dead.
    pub async fn reconstruct(self) -> Result<ServiceHandle, ServiceError> {
        ServiceBuilder::from_state(self).serve().await
    }
}

pub(crate) struct HandleParts {
    pub artifact: Artifact,
    pub address: SocketAddr,
    pub backend: Backend,
    pub wait: ReadinessWait,
    pub backlog: u32,
    pub max_connections: usize,
    pub call_timeout: Option<Duration>,
    pub child: Option<ChildProcessRef>,
    pub blocking: BlockingCallClient,
    pub client: AsyncCallClient,
    pub exit_hook: Option<HookToken>,
}

/// Caller-held proxy for a running function service.
///
/// The address never changes after construction. The child-process ref is
/// owned exclusively: a handle that attached to a service it did not launch
/// holds none and never kills anything. Dropping the handle tears the
/// service down; [`ServiceHandle::state`] is the transferable form.
pub struct ServiceHandle {
    artifact: Artifact,
    address: SocketAddr,
    backend: Backend,
    wait: ReadinessWait,
    backlog: u32,
    max_connections: usize,
    call_timeout: Option<Duration>,
    child: Option<ChildProcessRef>,
    blocking: BlockingCallClient,
    client: AsyncCallClient,
    exit_hook: Option<HookToken>,
}

impl ServiceHandle {
    pub(crate) fn from_parts(parts: HandleParts) -> Self {
        Self {
            artifact: parts.artifact,
            address: parts.address,
            backend: parts.backend,
            wait: parts.wait,
            backlog: parts.backlog,
            max_connections: parts.max_connections,
            call_timeout: parts.call_timeout,
            child: parts.child,
            blocking: parts.blocking,
            client: parts.client,
            exit_hook: parts.exit_hook,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn name(&self) -> &str {
        self.artifact.name()
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    /// Whether this handle launched (and therefore owns) the service
    /// process. Attach-only handles return false.
    pub fn owns_process(&self) -> bool {
        self.child.is_some()
    }

    /// Invoke the service, suspending the calling task.
    pub async fn call(&self, call: &CallArgs) -> Result<serde_json::Value, CallError> {
        self.client.call(call).await
    }

    /// Invoke the service, blocking the calling thread. Not for use inside
    /// an async task.
    pub fn call_blocking(&self, call: &CallArgs) -> Result<serde_json::Value, CallError> {
        self.blocking.call(call)
    }

    /// Capture the transferable snapshot of this handle.
    pub fn state(&self) -> HandleState {
        HandleState {
            artifact: self.artifact.clone(),
            host: self.address.ip(),
            port: self.address.port(),
            backend: self.backend,
            wait: self.wait,
            backlog: self.backlog,
            max_connections: self.max_connections,
            call_timeout: self.call_timeout,
        }
    }

    /// Tear the service down: terminate the owned child (if any) and drop
    /// the exit-hook registration. Idempotent; never errors.
    pub fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::info!(address = %self.address, pid = child.id(), "terminating service process");
            child.terminate();
        }
        if let Some(token) = self.exit_hook.take() {
            exit_hook::unregister(token);
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.artifact.name())
            .field("address", &self.address)
            .field("backend", &self.backend)
            .field("owns_process", &self.owns_process())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serde_roundtrip() {
        let state = HandleState {
            artifact: Artifact::new("fact", b"fact/v1".to_vec()),
            host: "127.0.0.1".parse().unwrap(),
            port: 52881,
            backend: Backend::DetachedProcess,
            wait: ReadinessWait::Attempts(100),
            backlog: 1024,
            max_connections: 100,
            call_timeout: Some(Duration::from_secs(30)),
        };

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: HandleState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn state_contains_no_live_resources() {
        // The serialized form is a small record of construction inputs.
        let state = HandleState {
            artifact: Artifact::new("f", b"f".to_vec()),
            host: "127.0.0.1".parse().unwrap(),
            port: 50000,
            backend: Backend::ForkedSubprocess,
            wait: ReadinessWait::Disabled,
            backlog: 16,
            max_connections: 4,
            call_timeout: None,
        };
        let value = serde_json::to_value(&state).unwrap();
        let mut keys: Vec<&str> =
            value.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            [
                "artifact",
                "backend",
                "backlog",
                "call_timeout",
                "host",
                "max_connections",
                "port",
                "wait"
            ]
        );
    }
}
