//! Activation scopes.
//!
//! `start`/`stop` pairs may nest. Only the outermost pair has effects: the
//! first `start` exports stub credentials and switches interception on, the
//! matching last `stop` restores the environment exactly, switches
//! interception off and (optionally) resets every backend.

use crate::config::StubCredentials;
use crate::emulator::Emulator;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";

static GLOBAL: Lazy<LifecycleController> = Lazy::new(|| LifecycleController::new(Emulator::global()));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("stop() called more times than start()")]
    Underflow,
}

#[derive(Default)]
struct LifecycleState {
    nested_count: usize,
    saved_env: Vec<(&'static str, Option<OsString>)>,
}

pub struct LifecycleController {
    emulator: Arc<Emulator>,
    state: Mutex<LifecycleState>,
}

impl LifecycleController {
    pub fn new(emulator: Arc<Emulator>) -> Self {
        Self {
            emulator,
            state: Mutex::new(LifecycleState::default()),
        }
    }

    /// Controller for [`Emulator::global`].
    pub fn global() -> &'static LifecycleController {
        &GLOBAL
    }

    pub fn emulator(&self) -> &Arc<Emulator> {
        &self.emulator
    }

    pub fn credentials(&self) -> &StubCredentials {
        &self.emulator.config().credentials
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        state.nested_count += 1;
        if state.nested_count > 1 {
            return;
        }

        if self.emulator.config().patch_env {
            let credentials = self.credentials();
            state.saved_env = vec![
                (ACCESS_KEY_ENV, std::env::var_os(ACCESS_KEY_ENV)),
                (SECRET_KEY_ENV, std::env::var_os(SECRET_KEY_ENV)),
            ];
            std::env::set_var(ACCESS_KEY_ENV, &credentials.access_key_id);
            std::env::set_var(SECRET_KEY_ENV, &credentials.secret_access_key);
        }
        self.emulator.set_intercepting(true);
        info!("Emulator activated");
    }

    pub fn stop(&self, reset: bool) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if state.nested_count == 0 {
            return Err(LifecycleError::Underflow);
        }
        state.nested_count -= 1;
        if state.nested_count > 0 {
            return Ok(());
        }

        for (key, value) in std::mem::take(&mut state.saved_env) {
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
        self.emulator.set_intercepting(false);
        drop(state);

        // reset hooks may query this controller
        if reset {
            self.emulator.reset();
        }
        info!("Emulator deactivated");
        Ok(())
    }

    /// Start a scope that stops (with reset) when the guard drops.
    pub fn activate(&self) -> ActivationGuard<'_> {
        self.start();
        ActivationGuard { controller: self }
    }

    pub fn depth(&self) -> usize {
        self.state.lock().nested_count
    }

    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }
}

/// Ends an activation scope on drop.
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct ActivationGuard<'a> {
    controller: &'a LifecycleController,
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.controller.stop(true) {
            warn!("Activation guard dropped after scope was already stopped: {}", e);
        }
    }
}

/// [`LifecycleController::activate`] on the global controller.
pub fn activate() -> ActivationGuard<'static> {
    LifecycleController::global().activate()
}
