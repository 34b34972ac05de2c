//! GPU-timeline synchronization seam.
//!
//! Fences are carried as raw `u64` handles so they can cross threads inside
//! lock-free snapshots; every wait re-validates liveness immediately before
//! waiting, centralizing the staleness check instead of repeating it at
//! each call site. A fence that is gone by the time a consumer reaches it
//! must already have signaled, so the wait is silently skipped.

use std::sync::Arc;

use glow::HasContext;

/// Raw fence handle. The GL implementation stores the `GLsync` pointer
/// value; `0` means "no fence".
pub type RawFence = u64;

/// GL_TIMEOUT_IGNORED; glWaitSync requires exactly this timeout value.
const TIMEOUT_IGNORED: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Ordering operations on one GPU command stream.
///
/// Each worker owns one implementation bound to its own context; the store
/// and pipeline take it as a parameter instead of owning it, so the same
/// slot bookkeeping runs against the real GL timeline in production and a
/// recording timeline in tests.
pub trait GpuTimeline {
    /// Insert a fence after the commands issued so far. Returns 0 if the
    /// driver refuses (callers treat a zero fence as "nothing to wait on").
    fn insert_fence(&self) -> RawFence;

    /// Whether the handle still names a live fence object.
    fn fence_valid(&self, fence: RawFence) -> bool;

    /// Make subsequent GPU commands on this context wait for `fence`.
    /// GPU-side only; the calling CPU thread continues immediately.
    fn wait_gpu(&self, fence: RawFence);

    /// Bounded CPU-side wait, used only at fallback points. Returns true if
    /// the fence signaled within the ceiling; the caller proceeds either way.
    fn wait_cpu_bounded(&self, fence: RawFence, timeout_ms: u64) -> bool;

    fn delete_fence(&self, fence: RawFence);

    /// Flush queued commands so fences become visible to other contexts.
    fn flush(&self);
}

/// OpenGL fence timeline over a glow context.
pub struct GlTimeline {
    gl: Arc<glow::Context>,
}

impl GlTimeline {
    pub fn new(gl: Arc<glow::Context>) -> Self {
        Self { gl }
    }

    pub fn gl(&self) -> &Arc<glow::Context> {
        &self.gl
    }

    fn sync(fence: RawFence) -> glow::NativeFence {
        glow::NativeFence(fence as usize as *mut _)
    }
}

impl GpuTimeline for GlTimeline {
    fn insert_fence(&self) -> RawFence {
        match unsafe { self.gl.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0) } {
            Ok(sync) => sync.0 as usize as u64,
            Err(_) => 0,
        }
    }

    fn fence_valid(&self, fence: RawFence) -> bool {
        fence != 0 && unsafe { self.gl.is_sync(Self::sync(fence)) }
    }

    fn wait_gpu(&self, fence: RawFence) {
        if !self.fence_valid(fence) {
            // Rotated out before we got here; it must have completed.
            return;
        }
        unsafe {
            self.gl.wait_sync(Self::sync(fence), 0, TIMEOUT_IGNORED);
        }
    }

    fn wait_cpu_bounded(&self, fence: RawFence, timeout_ms: u64) -> bool {
        if !self.fence_valid(fence) {
            return true;
        }
        let timeout_ns = (timeout_ms.min(1_000) * 1_000_000) as i32;
        let status = unsafe {
            self.gl
                .client_wait_sync(Self::sync(fence), glow::SYNC_FLUSH_COMMANDS_BIT, timeout_ns)
        };
        status == glow::ALREADY_SIGNALED || status == glow::CONDITION_SATISFIED
    }

    fn delete_fence(&self, fence: RawFence) {
        if fence != 0 {
            unsafe {
                self.gl.delete_sync(Self::sync(fence));
            }
        }
    }

    fn flush(&self) {
        unsafe {
            self.gl.flush();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{GpuEvent, TestTimeline};
    use super::*;

    #[test]
    fn test_recording_timeline_orders_events() {
        let timeline = TestTimeline::new();
        let fence = timeline.insert_fence();
        timeline.wait_gpu(fence);
        timeline.delete_fence(fence);
        assert_eq!(
            timeline.events(),
            vec![
                GpuEvent::InsertFence(fence),
                GpuEvent::WaitGpu(fence),
                GpuEvent::DeleteFence(fence),
            ]
        );
    }

    #[test]
    fn test_stale_fence_wait_is_skipped() {
        let timeline = TestTimeline::new();
        let fence = timeline.insert_fence();
        timeline.invalidate(fence);
        timeline.wait_gpu(fence);
        assert!(timeline
            .events()
            .contains(&GpuEvent::StaleWaitSkipped(fence)));
        assert!(!timeline.events().contains(&GpuEvent::WaitGpu(fence)));
    }

    #[test]
    fn test_bounded_cpu_wait_treats_stale_fence_as_complete() {
        let timeline = TestTimeline::new();
        let fence = timeline.insert_fence();
        assert!(timeline.wait_cpu_bounded(fence, 100));
        assert!(timeline.events().contains(&GpuEvent::WaitCpu(fence)));

        // A fence rotated out before the wait must report complete without
        // actually waiting.
        timeline.invalidate(fence);
        assert!(timeline.wait_cpu_bounded(fence, 100));
        assert_eq!(
            timeline
                .events()
                .iter()
                .filter(|e| **e == GpuEvent::WaitCpu(fence))
                .count(),
            1
        );
    }
}
