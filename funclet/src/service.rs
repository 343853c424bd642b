//! Service construction: port selection, launch-or-attach, readiness.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::client::{AsyncCallClient, BlockingCallClient, DEFAULT_MAX_CONNECTIONS};
use crate::codec::{JsonCodec, PayloadCodec};
use crate::exit_hook;
use crate::handle::{HandleParts, HandleState, ServiceHandle};
use crate::launcher::{self, Backend, CurrentExeSpawner, LaunchError, ProcessSpawner};
use crate::plan::BootstrapPlan;
use crate::port;

/// Default readiness budget, in probes.
pub const DEFAULT_WAIT_ATTEMPTS: u32 = 100;
/// Default listen queue depth.
pub const DEFAULT_BACKLOG: u32 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("port selection failed: {0}")]
    PortSelection(#[source] std::io::Error),
}

/// How the service address is chosen when none is dictated by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortSelection {
    /// Use exactly this port.
    Explicit(u16),
    /// Ask the OS for a free ephemeral port.
    AnyFree,
    /// Derive the port from the artifact payload, so unrelated processes
    /// constructing the same artifact agree on the address.
    #[default]
    Deterministic,
}

/// Readiness negotiation budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessWait {
    /// Probe up to this many times before failing construction.
    Attempts(u32),
    /// Hand the handle back without waiting; the caller takes the race.
    Disabled,
}

impl Default for ReadinessWait {
    fn default() -> Self {
        ReadinessWait::Attempts(DEFAULT_WAIT_ATTEMPTS)
    }
}

impl ReadinessWait {
    fn budget(&self) -> Option<u32> {
        match self {
            ReadinessWait::Attempts(n) if *n > 0 => Some(*n),
            _ => None,
        }
    }
}

/// Builds one function service and hands back its [`ServiceHandle`].
pub struct ServiceBuilder {
    artifact: Artifact,
    host: IpAddr,
    port: PortSelection,
    backend: Backend,
    wait: ReadinessWait,
    backlog: u32,
    max_connections: usize,
    call_timeout: Option<Duration>,
    codec: Arc<dyn PayloadCodec>,
    spawner: Arc<dyn ProcessSpawner>,
    allow_fork_in_runtime: bool,
}

impl ServiceBuilder {
    pub fn new(artifact: Artifact) -> Self {
        Self {
            artifact,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: PortSelection::default(),
            backend: Backend::default(),
            wait: ReadinessWait::default(),
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            call_timeout: None,
            codec: Arc::new(JsonCodec),
            spawner: Arc::new(CurrentExeSpawner),
            allow_fork_in_runtime: false,
        }
    }

    /// Rebuild construction inputs from a captured snapshot. The snapshot's
    /// resolved port becomes explicit, so the rebuilt handle targets the
    /// original address.
    pub fn from_state(state: HandleState) -> Self {
        let mut builder = Self::new(state.artifact);
        builder.host = state.host;
        builder.port = PortSelection::Explicit(state.port);
        builder.backend = state.backend;
        builder.wait = state.wait;
        builder.backlog = state.backlog;
        builder.max_connections = state.max_connections;
        builder.call_timeout = state.call_timeout;
        builder
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_port(mut self, port: PortSelection) -> Self {
        self.port = port;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_wait(mut self, wait: ReadinessWait) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Per-call deadline for both call disciplines. No deadline by default;
    /// callers needing bounded latency opt in.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Escape hatch: permit the forked backend inside a multi-threaded
    /// runtime.
    pub fn with_allow_fork_in_runtime(mut self, allow: bool) -> Self {
        self.allow_fork_in_runtime = allow;
        self
    }

    /// Construct the service: pick the address, launch a process for it
    /// unless one is already listening, and wait for readiness.
    pub async fn serve(self) -> Result<ServiceHandle, ServiceError> {
        let port = match self.port {
            PortSelection::Explicit(port) => port,
            PortSelection::AnyFree => {
                port::free_port(self.host).map_err(ServiceError::PortSelection)?
            }
            PortSelection::Deterministic => {
                port::specific_port(self.artifact.payload(), port::DEFAULT_PORT_RANGE)
            }
        };

        let plan = BootstrapPlan::render(self.artifact.clone(), self.host, port, self.backlog);
        let address = plan.address();
        let url = plan.url();
        tracing::info!(name = %self.artifact.name(), %address, "selected service address");

        let budget = self.wait.budget();

        if budget.is_some() && !port::is_port_bound(self.host, port) {
            // Desynchronize siblings racing to launch the same deterministic
            // address: whoever wakes first binds, the rest attach.
            tokio::time::sleep(Duration::from_millis(fastrand::u64(..1000))).await;
        }

        let mut child = if !port::is_port_bound(self.host, port) {
            let child = launcher::launch(
                &plan,
                self.backend,
                self.spawner.as_ref(),
                Arc::clone(&self.codec),
                self.allow_fork_in_runtime,
            )?;
            tracing::info!(pid = child.id(), backend = %self.backend, "launched service process");
            Some(child)
        } else {
            tracing::info!(%address, "port already bound, attaching to the running service");
            None
        };

        if let Some(attempts) = budget {
            if let Err(e) = launcher::await_ready(&url, attempts).await {
                // A child that never became ready is not left behind.
                if let Some(child) = child.as_mut() {
                    child.terminate();
                }
                return Err(e.into());
            }
        }

        let blocking =
            BlockingCallClient::new(url.clone(), Arc::clone(&self.codec), self.call_timeout);
        let client = AsyncCallClient::new(
            url,
            Arc::clone(&self.codec),
            self.max_connections,
            self.call_timeout,
        );

        let exit_hook = child.as_ref().map(|child| {
            let pid = child.id();
            exit_hook::register(move || launcher::kill_pid_best_effort(pid))
        });

        tracing::info!(name = %self.artifact.name(), %address, "service handle ready");

        Ok(ServiceHandle::from_parts(HandleParts {
            artifact: self.artifact,
            address,
            backend: self.backend,
            wait: self.wait,
            backlog: self.backlog,
            max_connections: self.max_connections,
            call_timeout: self.call_timeout,
            child,
            blocking,
            client,
            exit_hook,
        }))
    }
}
