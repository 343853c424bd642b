//! Process supervision: spawning service processes, probing readiness,
//! and tearing them down.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::PayloadCodec;
use crate::plan::{BootstrapPlan, PLAN_ENV_VAR};

/// Per-probe request timeout during readiness waiting.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_BACKOFF_BASE: Duration = Duration::from_millis(10);
const PROBE_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Environment override that permits forking inside a multi-threaded runtime.
pub const ALLOW_FORK_ENV_VAR: &str = "FUNCLET_ALLOW_FORK";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("unknown backend `{0}`")]
    InvalidConfiguration(String),

    #[error("failed to spawn service process: {0}")]
    Spawn(#[source] io::Error),

    #[cfg(unix)]
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error(
        "forked-subprocess backend inside a multi-threaded runtime; \
         enable allow_fork_in_runtime or set FUNCLET_ALLOW_FORK=1"
    )]
    ForkRestricted,

    #[error("plan encoding failed: {0}")]
    Plan(#[from] crate::plan::PlanError),

    #[error("liveness probe client could not be built: {0}")]
    ProbeClient(#[source] reqwest::Error),

    #[error("service at {url} did not become ready within {attempts} probes")]
    StartupTimeout { url: String, attempts: u32 },
}

/// Process-launch strategy. A closed enumeration: configuration strings
/// parse through [`FromStr`] and unknown names fail fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Spawn a brand-new OS process: the host executable re-invoked with the
    /// plan in its environment. Portable; pays full runtime startup; shares
    /// nothing with the parent beyond the binary image.
    #[default]
    DetachedProcess,
    /// `fork(2)`: the child inherits the parent's loaded state. Cheaper
    /// startup, unix-only, and refused inside a multi-threaded runtime
    /// unless explicitly overridden.
    ForkedSubprocess,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::DetachedProcess => "detached-process",
            Backend::ForkedSubprocess => "forked-subprocess",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detached-process" => Ok(Backend::DetachedProcess),
            "forked-subprocess" => Ok(Backend::ForkedSubprocess),
            other => Err(LaunchError::InvalidConfiguration(other.to_string())),
        }
    }
}

/// Extension point for how detached service processes are started.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, plan: &BootstrapPlan) -> Result<Child, LaunchError>;
}

/// Re-invokes the current executable. The host binary must call
/// `bootstrap::init` before anything else so the child becomes the service
/// instead of re-running the host program.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentExeSpawner;

impl ProcessSpawner for CurrentExeSpawner {
    fn spawn(&self, plan: &BootstrapPlan) -> Result<Child, LaunchError> {
        let exe = std::env::current_exe().map_err(LaunchError::Spawn)?;
        spawn_host_binary(&exe, plan)
    }
}

/// Runs a named host binary (one that calls `bootstrap::init` at startup).
#[derive(Debug, Clone)]
pub struct HostBinarySpawner {
    program: PathBuf,
}

impl HostBinarySpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ProcessSpawner for HostBinarySpawner {
    fn spawn(&self, plan: &BootstrapPlan) -> Result<Child, LaunchError> {
        spawn_host_binary(&self.program, plan)
    }
}

fn spawn_host_binary(program: &Path, plan: &BootstrapPlan) -> Result<Child, LaunchError> {
    let payload = plan.to_env_payload()?;
    Command::new(program)
        .env(PLAN_ENV_VAR, payload)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(LaunchError::Spawn)
}

enum ChildInner {
    Detached(Child),
    #[cfg(unix)]
    Forked(nix::unistd::Pid),
}

/// Exclusive ownership of one launched service process.
///
/// At most one handle holds the ref for a given process; attach-only handles
/// have none and never kill anything.
pub struct ChildProcessRef {
    inner: ChildInner,
}

impl fmt::Debug for ChildProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcessRef").field("pid", &self.id()).finish()
    }
}

impl ChildProcessRef {
    pub fn id(&self) -> u32 {
        match &self.inner {
            ChildInner::Detached(child) => child.id(),
            #[cfg(unix)]
            ChildInner::Forked(pid) => pid.as_raw() as u32,
        }
    }

    /// Best-effort teardown: graceful stop, forceful kill, then reap. Each
    /// step is attempted independently and never errors out of disposal;
    /// calling this twice, or on an already-dead process, is a no-op.
    pub fn terminate(&mut self) {
        match &mut self.inner {
            ChildInner::Detached(child) => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;
                    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
                }
                if let Err(e) = child.kill() {
                    tracing::debug!(pid = child.id(), error = %e, "kill after terminate");
                }
                if let Err(e) = child.wait() {
                    tracing::debug!(pid = child.id(), error = %e, "reap after kill");
                }
            }
            #[cfg(unix)]
            ChildInner::Forked(pid) => {
                use nix::sys::signal::{Signal, kill};
                use nix::sys::wait::waitpid;
                let _ = kill(*pid, Signal::SIGTERM);
                let _ = kill(*pid, Signal::SIGKILL);
                if let Err(e) = waitpid(*pid, None) {
                    tracing::debug!(pid = pid.as_raw(), error = %e, "reap after kill");
                }
            }
        }
    }
}

/// Launch a service process for `plan` via the selected backend.
pub fn launch(
    plan: &BootstrapPlan,
    backend: Backend,
    spawner: &dyn ProcessSpawner,
    codec: Arc<dyn PayloadCodec>,
    allow_fork_in_runtime: bool,
) -> Result<ChildProcessRef, LaunchError> {
    tracing::info!(
        backend = %backend,
        name = %plan.artifact.name(),
        address = %plan.address(),
        launch_id = %plan.launch_id,
        "launching service process"
    );
    match backend {
        Backend::DetachedProcess => {
            let child = spawner.spawn(plan)?;
            Ok(ChildProcessRef {
                inner: ChildInner::Detached(child),
            })
        }
        Backend::ForkedSubprocess => launch_forked(plan, codec, allow_fork_in_runtime),
    }
}

#[cfg(unix)]
fn launch_forked(
    plan: &BootstrapPlan,
    codec: Arc<dyn PayloadCodec>,
    allow_fork_in_runtime: bool,
) -> Result<ChildProcessRef, LaunchError> {
    use nix::unistd::ForkResult;

    let threaded_runtime = matches!(
        tokio::runtime::Handle::try_current().map(|h| h.runtime_flavor()),
        Ok(tokio::runtime::RuntimeFlavor::MultiThread)
    );
    let overridden = allow_fork_in_runtime
        || std::env::var_os(ALLOW_FORK_ENV_VAR).is_some_and(|v| v == "1");
    if threaded_runtime {
        if !overridden {
            return Err(LaunchError::ForkRestricted);
        }
        tracing::warn!("forking inside a multi-threaded runtime; restriction overridden");
    }

    // SAFETY: only reached from a single-threaded context, or with the
    // restriction explicitly overridden; the child never returns to the
    // caller's control flow.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => {
            // The forking thread's TLS still claims to be inside the
            // parent's runtime; the child's runtime needs a fresh thread.
            let plan = plan.clone();
            let code = std::thread::spawn(move || run_forked_service(plan, codec))
                .join()
                .unwrap_or(1);
            // _exit: the inherited atexit registrations (including the
            // parent's service teardown hooks) must not run in the child.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => Ok(ChildProcessRef {
            inner: ChildInner::Forked(child),
        }),
        Err(e) => Err(LaunchError::Fork(e)),
    }
}

#[cfg(unix)]
fn run_forked_service(plan: BootstrapPlan, codec: Arc<dyn PayloadCodec>) -> i32 {
    match tokio::runtime::Runtime::new() {
        Ok(runtime) => {
            match runtime.block_on(crate::bootstrap::serve_plan(
                &plan,
                &crate::artifact::RegistryResolver,
                codec,
            )) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "forked service exited");
                    1
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "forked child could not start a runtime");
            1
        }
    }
}

#[cfg(not(unix))]
fn launch_forked(
    _plan: &BootstrapPlan,
    _codec: Arc<dyn PayloadCodec>,
    _allow_fork_in_runtime: bool,
) -> Result<ChildProcessRef, LaunchError> {
    Err(LaunchError::InvalidConfiguration(
        "forked-subprocess is only available on unix".to_string(),
    ))
}

/// Probe `url` with `GET` until it answers success, backing off
/// exponentially (`min(1s, 10ms * 2^attempt)`) up to the attempt budget.
pub async fn await_ready(url: &str, attempts: u32) -> Result<(), LaunchError> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(LaunchError::ProbeClient)?;

    for attempt in 0..=attempts {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(%url, attempt, "service answered the liveness probe");
                return Ok(());
            }
            Ok(response) => {
                tracing::trace!(%url, status = %response.status(), "probe answered non-success");
            }
            Err(e) => {
                tracing::trace!(%url, attempt, error = %e, "probe not answered");
            }
        }
        if attempt < attempts {
            let factor = 1u32 << attempt.min(10);
            let delay = std::cmp::min(PROBE_BACKOFF_CAP, PROBE_BACKOFF_BASE * factor);
            tokio::time::sleep(delay).await;
        }
    }

    Err(LaunchError::StartupTimeout {
        url: url.to_string(),
        attempts,
    })
}

/// Signal a process by pid, ignoring every failure. Used by exit hooks,
/// which cannot hold the `ChildProcessRef` itself.
#[cfg(unix)]
pub(crate) fn kill_pid_best_effort(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid as i32);
    let _ = kill(pid, Signal::SIGTERM);
    let _ = kill(pid, Signal::SIGKILL);
}

#[cfg(not(unix))]
pub(crate) fn kill_pid_best_effort(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn backend_parses_known_names() {
        assert_eq!(
            "detached-process".parse::<Backend>().unwrap(),
            Backend::DetachedProcess
        );
        assert_eq!(
            "forked-subprocess".parse::<Backend>().unwrap(),
            Backend::ForkedSubprocess
        );
    }

    #[test]
    fn backend_rejects_unknown_names() {
        match "Popen".parse::<Backend>() {
            Err(LaunchError::InvalidConfiguration(name)) => assert_eq!(name, "Popen"),
            other => panic!("expected InvalidConfiguration, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn backend_display_matches_wire_names() {
        assert_eq!(Backend::DetachedProcess.to_string(), "detached-process");
        assert_eq!(Backend::ForkedSubprocess.to_string(), "forked-subprocess");
        assert_eq!(
            serde_json::to_value(Backend::ForkedSubprocess).unwrap(),
            serde_json::json!("forked-subprocess")
        );
    }

    fn sample_plan() -> BootstrapPlan {
        BootstrapPlan::render(
            crate::artifact::Artifact::new("f", b"f/v1".to_vec()),
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            50999,
            16,
        )
    }

    #[test]
    fn spawn_failure_is_reported() {
        let spawner = HostBinarySpawner::new("/definitely/not/a/real/binary");
        match spawner.spawn(&sample_plan()) {
            Err(LaunchError::Spawn(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("expected Spawn error, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[test]
    fn terminate_is_idempotent_on_live_and_dead_processes() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let mut child_ref = ChildProcessRef {
            inner: ChildInner::Detached(child),
        };

        child_ref.terminate();
        child_ref.terminate();

        // Already-exited process: same contract.
        let quick = Command::new("true").stdin(Stdio::null()).spawn().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let mut quick_ref = ChildProcessRef {
            inner: ChildInner::Detached(quick),
        };
        quick_ref.terminate();
        quick_ref.terminate();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn await_ready_succeeds_against_a_live_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        await_ready(&format!("{}/", server.uri()), 5).await.unwrap();
    }

    #[tokio::test]
    async fn await_ready_times_out_against_a_dead_port() {
        let port = crate::port::free_port(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
            .unwrap();
        let url = format!("http://127.0.0.1:{port}/");

        match await_ready(&url, 3).await {
            Err(LaunchError::StartupTimeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected StartupTimeout, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fork_is_refused_inside_a_threaded_runtime() {
        let result = launch(
            &sample_plan(),
            Backend::ForkedSubprocess,
            &CurrentExeSpawner,
            Arc::new(crate::codec::JsonCodec),
            false,
        );
        assert!(matches!(result, Err(LaunchError::ForkRestricted)));
    }
}
