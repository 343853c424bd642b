//! Explicit process-exit teardown registration.
//!
//! Handles register their child-process teardown here so it also runs when
//! the owning process exits without disposing of them. Normal disposal
//! unregisters, so a teardown never runs twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

type Hook = Box<dyn FnOnce() + Send>;

static HOOKS: OnceLock<Mutex<HashMap<u64, Hook>>> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn hooks() -> &'static Mutex<HashMap<u64, Hook>> {
    HOOKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Proof of registration; pass back to [`unregister`] on normal disposal.
#[derive(Debug)]
pub struct HookToken(u64);

/// Register a teardown to run at process exit.
pub fn register(hook: impl FnOnce() + Send + 'static) -> HookToken {
    install_trampoline();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    hooks().lock().unwrap().insert(id, Box::new(hook));
    HookToken(id)
}

/// Remove a registered teardown so it will not run at exit.
pub fn unregister(token: HookToken) {
    hooks().lock().unwrap().remove(&token.0);
}

/// Run and drop every registered hook. Invoked from the exit trampoline;
/// each hook runs at most once no matter how often this is called.
pub fn run_all() {
    let drained: Vec<Hook> = {
        let mut map = hooks().lock().unwrap();
        map.drain().map(|(_, hook)| hook).collect()
    };
    for hook in drained {
        hook();
    }
}

#[cfg(unix)]
fn install_trampoline() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        extern "C" fn run_hooks_at_exit() {
            crate::exit_hook::run_all();
        }
        // On failure, hooks still run through explicit disposal.
        let rc = unsafe { libc::atexit(run_hooks_at_exit) };
        if rc != 0 {
            tracing::warn!("could not install the process-exit trampoline");
        }
    });
}

#[cfg(not(unix))]
fn install_trampoline() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    // One test: run_all drains the shared registry, so interleaving with a
    // second registering test would race.
    #[test]
    fn hooks_run_once_and_unregistration_sticks() {
        let ran = Arc::new(AtomicU32::new(0));
        let hooked = Arc::clone(&ran);
        let _kept = register(move || {
            hooked.fetch_add(1, Ordering::SeqCst);
        });

        let removed_ran = Arc::new(AtomicU32::new(0));
        let hooked = Arc::clone(&removed_ran);
        let removed = register(move || {
            hooked.fetch_add(1, Ordering::SeqCst);
        });
        unregister(removed);

        run_all();
        run_all();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(removed_ran.load(Ordering::SeqCst), 0);
    }
}
