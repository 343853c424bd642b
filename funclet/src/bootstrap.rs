//! Child-side bootstrap: the single-endpoint HTTP server a service process runs.
//!
//! Host binaries call [`init`] at the top of `main()`. When the bootstrap
//! environment variable is present the process becomes the service described
//! by the plan and never returns; otherwise control returns immediately.
//!
//! Endpoint behavior:
//! - `GET /` answers 200 with an empty body. Pure liveness probe; the
//!   wrapped callable is never invoked.
//! - `POST /` decodes the body into call arguments, invokes the callable,
//!   and answers with the encoded return value. A callable fault answers 500
//!   with the error text; an undecodable body answers 400. The process keeps
//!   serving either way.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpSocket;

use crate::artifact::{CallableResolver, RegistryResolver, ServiceFn};
use crate::codec::{JsonCodec, PayloadCodec};
use crate::plan::{BootstrapPlan, PLAN_ENV_VAR};

struct ServeState {
    callable: ServiceFn,
    codec: Arc<dyn PayloadCodec>,
    /// Calls are serialized per instance; liveness probes are not.
    call_lock: tokio::sync::Mutex<()>,
}

impl ServeState {
    fn new(callable: ServiceFn, codec: Arc<dyn PayloadCodec>) -> Arc<Self> {
        Arc::new(Self {
            callable,
            codec,
            call_lock: tokio::sync::Mutex::new(()),
        })
    }
}

fn app(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/", get(liveness).post(invoke))
        .with_state(state)
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn invoke(State(state): State<Arc<ServeState>>, body: Bytes) -> Response {
    let call = match state.codec.decode_call(&body) {
        Ok(call) => call,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting undecodable call body");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    // One call at a time through the callable.
    let _serial = state.call_lock.lock().await;

    let callable = Arc::clone(&state.callable);
    let result = tokio::task::spawn_blocking(move || callable(call)).await;

    match result {
        Ok(Ok(value)) => match state.codec.encode_value(&value) {
            Ok(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, state.codec.content_type())],
                bytes,
            )
                .into_response(),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode return value");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        },
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "service function failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "service function panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "service function panicked".to_string())
                .into_response()
        }
    }
}

/// A plan whose listener is bound but not yet serving.
///
/// Splitting bind from serve lets callers learn the actual address (port 0
/// plans) before traffic starts.
#[derive(Debug)]
pub struct BoundService {
    listener: tokio::net::TcpListener,
    router: Router,
    local_addr: SocketAddr,
}

impl BoundService {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the process dies. Returns only on server error.
    pub async fn serve(self) -> anyhow::Result<()> {
        tracing::info!(address = %self.local_addr, "function service listening");
        axum::serve(self.listener, self.router)
            .await
            .context("server loop failed")?;
        Ok(())
    }
}

/// Resolve the callable and bind the plan's address with its backlog.
pub async fn bind_plan(
    plan: &BootstrapPlan,
    resolver: &dyn CallableResolver,
    codec: Arc<dyn PayloadCodec>,
) -> anyhow::Result<BoundService> {
    let addr = plan.address();

    // Placeholder bind: claim the address and release it immediately, so a
    // conflicting service makes this process exit before the callable is
    // touched.
    crate::port::try_bind(addr).with_context(|| format!("address {addr} is not bindable"))?;

    let callable = resolver
        .resolve(&plan.artifact)
        .with_context(|| format!("cannot resolve callable `{}`", plan.artifact.name()))?;

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .context("failed to create listen socket")?;
    socket.set_reuseaddr(true).context("set_reuseaddr failed")?;
    socket
        .bind(addr)
        .with_context(|| format!("failed to bind {addr}"))?;
    let listener = socket
        .listen(plan.backlog)
        .context("failed to listen")?;
    let local_addr = listener.local_addr().context("no local address")?;

    let state = ServeState::new(callable, codec);
    Ok(BoundService {
        listener,
        router: app(state),
        local_addr,
    })
}

/// Bind and serve a plan in the current process. Never returns under normal
/// operation.
pub async fn serve_plan(
    plan: &BootstrapPlan,
    resolver: &dyn CallableResolver,
    codec: Arc<dyn PayloadCodec>,
) -> anyhow::Result<()> {
    bind_plan(plan, resolver, codec).await?.serve().await
}

/// Become the service if a bootstrap plan is present in the environment.
///
/// With the default resolver (global registry) and codec. Call after all
/// service functions are registered.
pub fn init() {
    init_with(&RegistryResolver, Arc::new(JsonCodec));
}

/// [`init`] with an explicit resolver and codec.
pub fn init_with(resolver: &dyn CallableResolver, codec: Arc<dyn PayloadCodec>) {
    let Ok(payload) = std::env::var(PLAN_ENV_VAR) else {
        return;
    };

    init_child_tracing();

    let code = match BootstrapPlan::from_env_payload(&payload) {
        Ok(plan) => {
            tracing::info!(
                launch_id = %plan.launch_id,
                name = %plan.artifact.name(),
                address = %plan.address(),
                "bootstrapping function service"
            );
            match run_service(&plan, resolver, codec) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "service exited with error");
                    1
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "invalid bootstrap plan payload");
            2
        }
    };
    std::process::exit(code);
}

fn run_service(
    plan: &BootstrapPlan,
    resolver: &dyn CallableResolver,
    codec: Arc<dyn PayloadCodec>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(serve_plan(plan, resolver, codec))
}

/// Best-effort default subscriber for the child process. The parent's
/// subscriber choice is its own; a child owns its process and gets one.
fn init_child_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
