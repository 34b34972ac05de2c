//! Host-context watchdog.
//!
//! A low-priority loop polls the host's current context identity on a
//! coarse interval and feeds it through the debounced [`ContextWatch`].
//! When a replacement sticks, the rebuild callback runs on the watchdog
//! thread; everything heavy (tearing down shared state, respawning
//! workers) belongs to that callback, the loop itself stays trivial.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{GlPipError, GlPipResult};
use crate::gpu::{ContextWatch, WatchVerdict};
use crate::runtime::{SharedRuntimeState, WorkSignal};

/// How often the watchdog re-checks the host context identity.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How long a replacement context must stay current before it is believed.
pub const REBUILD_DWELL: Duration = Duration::from_millis(500);

/// Minimum spacing between two rebuilds.
pub const MIN_REBUILD_INTERVAL: Duration = Duration::from_secs(5);

pub struct Watchdog {
    handle: Option<JoinHandle<()>>,
    signal: Arc<WorkSignal>,
}

impl Watchdog {
    /// Spawn the watchdog loop. `current_id` samples the host's live
    /// context identity; `on_rebuild` runs for each confirmed replacement.
    pub fn spawn<I, R>(
        runtime: Arc<SharedRuntimeState>,
        mut watch: ContextWatch,
        interval: Duration,
        current_id: I,
        mut on_rebuild: R,
    ) -> GlPipResult<Self>
    where
        I: Fn() -> u64 + Send + 'static,
        R: FnMut(u64) + Send + 'static,
    {
        let signal = Arc::new(WorkSignal::new());
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("glpip-watchdog".to_string())
            .spawn(move || {
                log::info!("[Watchdog] started");
                while !runtime.shutdown_requested() {
                    thread_signal.wait_timeout(interval);
                    if runtime.shutdown_requested() {
                        break;
                    }
                    if let WatchVerdict::Rebuild(id) =
                        watch.observe(current_id(), Instant::now())
                    {
                        on_rebuild(id);
                    }
                }
                log::info!("[Watchdog] stopped");
            })
            .map_err(|err| GlPipError::Other(format!("spawn watchdog: {err}")))?;
        Ok(Self {
            handle: Some(handle),
            signal,
        })
    }

    /// Wake the loop out of its park (used on shutdown).
    pub fn wake(&self) {
        self.signal.notify();
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[Watchdog] thread panicked");
            }
        }
    }
}
