//! Bootstrap plans: the rendered document a service process runs.
//!
//! A plan binds an artifact to a concrete `(host, port, backlog)` and
//! travels to a detached child through a single environment variable; a
//! forked child receives it in memory.

use std::net::{IpAddr, SocketAddr};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::Artifact;

/// Environment variable carrying the plan to a detached child process.
pub const PLAN_ENV_VAR: &str = "FUNCLET_BOOTSTRAP_PLAN";

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("plan payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("plan payload is not a valid plan document: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Self-contained bootstrap document for one service process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPlan {
    pub artifact: Artifact,
    pub host: IpAddr,
    pub port: u16,
    pub backlog: u32,
    /// Correlates parent and child log streams for one launch.
    pub launch_id: Uuid,
}

impl BootstrapPlan {
    pub fn render(artifact: Artifact, host: IpAddr, port: u16, backlog: u32) -> Self {
        Self {
            artifact,
            host,
            port,
            backlog,
            launch_id: Uuid::new_v4(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.address())
    }

    /// Encode for the child's environment: JSON wrapped in base64 so the
    /// value survives any shell or exec layer untouched.
    pub fn to_env_payload(&self) -> Result<String, PlanError> {
        let json = serde_json::to_vec(self).map_err(PlanError::Serialize)?;
        Ok(BASE64.encode(json))
    }

    pub fn from_env_payload(payload: &str) -> Result<Self, PlanError> {
        let json = BASE64.decode(payload.trim().as_bytes())?;
        serde_json::from_slice(&json).map_err(PlanError::Deserialize)
    }
}
