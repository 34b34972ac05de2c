//! Shared runtime state and worker wake signals.
//!
//! No ambient globals: all cross-thread flags live in one injected
//! `SharedRuntimeState` handed to every component at construction, with
//! the reader/writer threads of each field spelled out.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::ModeId;

/// Process-wide mutable flags shared by the main thread and the workers.
///
/// All fields are atomics; there is no lock to take on the per-frame path.
#[derive(Debug, Default)]
pub struct SharedRuntimeState {
    /// Interned id of the active mode, `ModeId::NONE` when windowed/native.
    /// Written by the main thread (mode switches), read by every thread.
    current_mode: AtomicU32,
    /// Whether a virtual/fullscreen mode is active at all. When false the
    /// viewport interception layer is completely inert.
    /// Written by the main thread, read by main + render worker.
    virtual_mode_active: AtomicBool,
    /// Whether the property GUI is visible (overlay category flag source).
    /// Written by the input subsystem, read by the render worker.
    gui_visible: AtomicBool,
    /// Shutdown flag checked by every worker at iteration boundaries.
    /// Written once by the owner on teardown.
    shutdown: AtomicBool,
}

impl SharedRuntimeState {
    pub fn new() -> Self {
        Self {
            current_mode: AtomicU32::new(ModeId::NONE.raw()),
            ..Default::default()
        }
    }

    pub fn current_mode(&self) -> ModeId {
        ModeId::from_raw(self.current_mode.load(Ordering::Acquire))
    }

    pub fn set_current_mode(&self, mode: ModeId) {
        self.current_mode.store(mode.raw(), Ordering::Release);
        self.virtual_mode_active
            .store(mode != ModeId::NONE, Ordering::Release);
    }

    pub fn virtual_mode_active(&self) -> bool {
        self.virtual_mode_active.load(Ordering::Acquire)
    }

    pub fn gui_visible(&self) -> bool {
        self.gui_visible.load(Ordering::Acquire)
    }

    pub fn set_gui_visible(&self, visible: bool) {
        self.gui_visible.store(visible, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Work-availability signal for the worker threads.
///
/// Workers block only here between frames; GPU fences are never waited on
/// from the CPU side on this path.
#[derive(Debug, Default)]
pub struct WorkSignal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark work available and wake one parked worker.
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.condvar.notify_one();
    }

    /// Park until work is available, then consume the flag.
    pub fn wait(&self) {
        let mut pending = self.pending.lock();
        while !*pending {
            self.condvar.wait(&mut pending);
        }
        *pending = false;
    }

    /// Park until work is available or `timeout` elapses. Returns true if
    /// work was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.condvar.wait_for(&mut pending, timeout);
        }
        let had_work = *pending;
        *pending = false;
        had_work
    }
}
