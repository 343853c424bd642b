//! funclet: run a single function as a standalone loopback HTTP service.
//!
//! A service is one process owning one callable behind one endpoint:
//! `GET /` answers the liveness probe, `POST /` carries codec-encoded
//! arguments in and the encoded return value out. Addresses are
//! deterministic by default (a digest of the artifact payload), so unrelated
//! processes constructing the same artifact agree on the port and
//! de-duplicate onto one service: whoever finds the port free launches,
//! everyone else attaches.
//!
//! Handles are transferable: [`ServiceHandle::state`] captures a small
//! serializable record (never a live process or socket), and
//! [`HandleState::reconstruct`] either reattaches to the running service or
//! launches a fresh one.
//!
//! ```no_run
//! use funclet::{Artifact, CallArgs, ServiceBuilder};
//! use serde_json::json;
//!
//! fn main() -> anyhow::Result<()> {
//!     funclet::registry::register("double", |call: CallArgs| {
//!         let n = call.args.first().and_then(serde_json::Value::as_i64).unwrap_or(0);
//!         Ok(json!(n * 2))
//!     });
//!     // Become the service when spawned as one; otherwise fall through.
//!     funclet::bootstrap::init();
//!
//!     tokio::runtime::Runtime::new()?.block_on(async {
//!         let mut handle = ServiceBuilder::new(Artifact::new("double", b"double/v1".to_vec()))
//!             .serve()
//!             .await?;
//!         let out = handle.call(&CallArgs::positional([json!(21)])).await?;
//!         assert_eq!(out, json!(42));
//!         handle.shutdown();
//!         anyhow::Ok(())
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod bootstrap;
pub mod client;
pub mod codec;
pub mod exit_hook;
pub mod handle;
pub mod launcher;
pub mod plan;
pub mod port;
pub mod service;

pub use artifact::{Artifact, CallableResolver, RegistryResolver, ResolveError, ServiceFn, registry};
pub use client::{AsyncCallClient, BlockingCallClient, CallError, DEFAULT_MAX_CONNECTIONS};
pub use codec::{CODEC_VERSION, CallArgs, CodecError, JsonCodec, PayloadCodec};
pub use handle::{HandleState, ServiceHandle};
pub use launcher::{
    Backend, ChildProcessRef, CurrentExeSpawner, HostBinarySpawner, LaunchError, ProcessSpawner,
};
pub use plan::{BootstrapPlan, PLAN_ENV_VAR, PlanError};
pub use service::{PortSelection, ReadinessWait, ServiceBuilder, ServiceError};
