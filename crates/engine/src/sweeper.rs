//! Background sweeper closing idle sessions
//!
//! One named thread wakes up every interval and calls
//! `Repository::clean_sessions`. It holds a weak reference so the repository
//! can still drop; the thread exits when the upgrade fails or on `stop`.

use crate::repository::Repository;
use cairn_core::{CairnError, CairnResult};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct SweeperState {
    stop: Mutex<bool>,
    wakeup: Condvar,
}

/// Handle on the sweeper thread
pub struct SessionSweeper {
    state: Arc<SweeperState>,
    handle: Option<JoinHandle<()>>,
}

impl SessionSweeper {
    /// Spawn the sweeper thread
    ///
    /// # Errors
    ///
    /// `Config` if the thread cannot be spawned.
    pub fn start(repo: Weak<Repository>, interval: Duration) -> CairnResult<Self> {
        let state = Arc::new(SweeperState {
            stop: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let thread_state = Arc::clone(&state);
        let handle = std::thread::Builder::new()
            .name("cairn-sweeper".to_string())
            .spawn(move || sweep_loop(&thread_state, &repo, interval))
            .map_err(|e| CairnError::Config(format!("cannot spawn session sweeper: {}", e)))?;
        info!(target: "cairn::session", interval_secs = interval.as_secs(), "Session sweeper started");
        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it
    ///
    /// Called from the sweeper thread itself, it only signals.
    pub fn stop(&mut self) {
        {
            let mut stop = self.state.stop.lock();
            *stop = true;
            self.state.wakeup.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(target: "cairn::session", "Session sweeper panicked");
            }
        }
    }

    /// Whether the thread is still attached
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep_loop(state: &SweeperState, repo: &Weak<Repository>, interval: Duration) {
    loop {
        {
            let deadline = Instant::now() + interval;
            let mut stop = state.stop.lock();
            while !*stop {
                if state.wakeup.wait_until(&mut stop, deadline).timed_out() {
                    break;
                }
            }
            if *stop {
                return;
            }
        }
        let Some(repo) = repo.upgrade() else {
            return;
        };
        let closed = repo.clean_sessions();
        if closed > 0 {
            debug!(target: "cairn::session", closed, "Idle sessions closed");
        }
    }
}
