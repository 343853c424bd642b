//! Artifacts, the function registry, and the callable-resolution seam.
//!
//! An `Artifact` is the opaque unit a service process executes: a payload the
//! core never interprets plus the name used to resolve the executable
//! callable. Producing the payload is an external build step; the default
//! resolver looks the name up in the process-global `FunctionRegistry`, which
//! host binaries populate before calling `bootstrap::init`.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::codec::CallArgs;

/// The callable a service owns: positional + named arguments in, value out.
pub type ServiceFn = Arc<dyn Fn(CallArgs) -> anyhow::Result<serde_json::Value> + Send + Sync>;

/// Opaque service payload plus its resolution name.
///
/// The payload bytes also drive deterministic port selection, so two
/// artifacts with identical payloads resolve to the same address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    name: String,
    #[serde(with = "payload_b64")]
    payload: Vec<u8>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

mod payload_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no callable registered under `{0}`")]
    Unknown(String),

    #[error("artifact payload not understood by this resolver: {0}")]
    Unsupported(String),
}

/// Seam between the opaque artifact and an executable callable.
///
/// The default implementation consults the global registry; schemes that
/// interpret the payload itself (embedded scripts, wasm blobs) install their
/// own resolver via `bootstrap::init_with`.
pub trait CallableResolver: Send + Sync + 'static {
    fn resolve(&self, artifact: &Artifact) -> Result<ServiceFn, ResolveError>;
}

/// Resolves the artifact name against the global `FunctionRegistry`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryResolver;

impl CallableResolver for RegistryResolver {
    fn resolve(&self, artifact: &Artifact) -> Result<ServiceFn, ResolveError> {
        registry::resolve(artifact.name())
            .ok_or_else(|| ResolveError::Unknown(artifact.name().to_string()))
    }
}

pub mod registry {
    //! Process-global function registry.
    //!
    //! Host binaries register every servable function here before calling
    //! `bootstrap::init`, so a re-executed child can resolve its callable.

    use super::*;

    static REGISTRY: LazyLock<RwLock<HashMap<String, ServiceFn>>> =
        LazyLock::new(|| RwLock::new(HashMap::new()));

    /// Register a callable under `name`. Re-registering replaces the
    /// previous entry.
    pub fn register<F>(name: impl Into<String>, f: F)
    where
        F: Fn(CallArgs) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(%name, "registering service function");
        REGISTRY.write().unwrap().insert(name, Arc::new(f));
    }

    /// Look up a callable by name.
    pub fn resolve(name: &str) -> Option<ServiceFn> {
        REGISTRY.read().unwrap().get(name).cloned()
    }

    /// Names currently registered, unordered.
    pub fn registered_names() -> Vec<String> {
        REGISTRY.read().unwrap().keys().cloned().collect()
    }
}
