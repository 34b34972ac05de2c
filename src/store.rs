//! Completed-frame handoff between the render worker and the host thread.
//!
//! Three pre-created render targets rotate through the worker. The worker
//! publishes whichever one it just finished through a lock-free snapshot;
//! the host samples the published frame whenever it composites, acknowledging
//! with a consumer fence so the worker never scribbles over a texture the
//! host's GPU commands are still reading. Neither side ever blocks the other
//! on the CPU.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::gpu::{GpuTimeline, RawFence};
use crate::snapshot::Snapshot;

/// Number of rotating render targets. Two would let the producer catch the
/// consumer mid-read; three gives it somewhere to go while one frame is
/// published and another is still in flight on the host GPU.
pub const SLOT_COUNT: usize = 3;

/// One published frame, as the host thread sees it.
///
/// `sequence` is 0 only for the pre-first-frame default; `fence` is the
/// producer fence guarding the frame's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletedRenderFrame {
    pub texture: u32,
    pub framebuffer: u32,
    pub fence: RawFence,
    pub slot_index: usize,
    pub sequence: u64,
}

#[derive(Default)]
struct Slot {
    texture: AtomicU32,
    framebuffer: AtomicU32,
    /// Fence inserted by the worker after rendering into this slot.
    producer_fence: AtomicU64,
    /// Fence inserted by the host after sampling this slot; 0 when none.
    consumer_fence: AtomicU64,
    /// Set when the host has taken this slot's frame and not yet fenced it.
    handed_out: AtomicBool,
}

/// Slot bookkeeping shared between the render worker and the host thread.
pub struct FrameStore {
    slots: [Slot; SLOT_COUNT],
    completed: Snapshot<CompletedRenderFrame>,
    write_slot: AtomicUsize,
    sequence: AtomicU64,
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            completed: Snapshot::new(CompletedRenderFrame::default()),
            // First acquire starts the rotation at slot 0.
            write_slot: AtomicUsize::new(SLOT_COUNT - 1),
            sequence: AtomicU64::new(0),
        }
    }

    /// Record the GL objects backing slot `index`. Called once per slot
    /// during worker setup, before any frame is produced.
    pub fn set_slot_target(&self, index: usize, texture: u32, framebuffer: u32) {
        let slot = &self.slots[index];
        slot.texture.store(texture, Ordering::Release);
        slot.framebuffer.store(framebuffer, Ordering::Release);
    }

    /// GL objects backing slot `index`, as `(texture, framebuffer)`.
    pub fn slot_target(&self, index: usize) -> (u32, u32) {
        let slot = &self.slots[index];
        (
            slot.texture.load(Ordering::Acquire),
            slot.framebuffer.load(Ordering::Acquire),
        )
    }

    /// Pick the next slot the worker may render into, inserting a GPU-side
    /// wait on the host's consumer fence if the slot was sampled recently.
    ///
    /// Returns `None` when every candidate slot is either currently
    /// published or handed out to the host without an acknowledging fence
    /// yet; the worker skips the frame rather than overwrite in-flight
    /// reads.
    pub fn acquire_writable_slot(&self, timeline: &impl GpuTimeline) -> Option<usize> {
        let published = {
            let frame = self.completed.read();
            (frame.sequence > 0).then_some(frame.slot_index)
        };
        let current = self.write_slot.load(Ordering::Relaxed);

        for offset in 1..=SLOT_COUNT {
            let index = (current + offset) % SLOT_COUNT;
            if published == Some(index) {
                continue;
            }
            let slot = &self.slots[index];
            let consumer = slot.consumer_fence.swap(0, Ordering::AcqRel);
            if consumer != 0 {
                // The host read this slot; queue the reuse behind its
                // sampling commands, then retire the fence.
                timeline.wait_gpu(consumer);
                timeline.delete_fence(consumer);
                slot.handed_out.store(false, Ordering::Release);
            } else if slot.handed_out.load(Ordering::Acquire) {
                // Taken by the host but not yet fenced; still in flight.
                continue;
            }
            self.write_slot.store(index, Ordering::Relaxed);
            return Some(index);
        }
        None
    }

    /// Publish the slot the worker just finished rendering. Inserts the
    /// producer fence and flushes so the fence and the frame's contents are
    /// visible to the host context.
    pub fn publish_completed_frame(&self, timeline: &impl GpuTimeline, slot_index: usize) {
        let fence = timeline.insert_fence();
        timeline.flush();

        let slot = &self.slots[slot_index];
        let previous = slot.producer_fence.swap(fence, Ordering::AcqRel);
        if previous != 0 {
            timeline.delete_fence(previous);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.completed.publish(CompletedRenderFrame {
            texture: slot.texture.load(Ordering::Acquire),
            framebuffer: slot.framebuffer.load(Ordering::Acquire),
            fence,
            slot_index,
            sequence,
        });
    }

    /// Latest published frame, or `None` before the first publication.
    /// Marks the slot handed out; the host must answer with
    /// [`submit_consumer_fence`](Self::submit_consumer_fence) after
    /// sampling, or the slot stays off-limits to the worker.
    pub fn completed_render_frame(&self) -> Option<CompletedRenderFrame> {
        let frame = self.completed.read();
        if frame.sequence == 0 {
            return None;
        }
        self.slots[frame.slot_index]
            .handed_out
            .store(true, Ordering::Release);
        Some(frame)
    }

    /// Acknowledge a sampled slot with the fence the host inserted after
    /// its read commands.
    pub fn submit_consumer_fence(
        &self,
        timeline: &impl GpuTimeline,
        slot_index: usize,
        fence: RawFence,
    ) {
        let slot = &self.slots[slot_index];
        let previous = slot.consumer_fence.swap(fence, Ordering::AcqRel);
        if previous != 0 {
            timeline.delete_fence(previous);
        }
        slot.handed_out.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::timeline::testing::{GpuEvent, TestTimeline};

    fn store_with_targets() -> FrameStore {
        let store = FrameStore::new();
        for i in 0..SLOT_COUNT {
            store.set_slot_target(i, 100 + i as u32, 200 + i as u32);
        }
        store
    }

    #[test]
    fn test_first_acquire_yields_slot_zero() {
        let store = store_with_targets();
        let timeline = TestTimeline::new();
        assert_eq!(store.acquire_writable_slot(&timeline), Some(0));
    }

    #[test]
    fn test_rotation_skips_published_slot() {
        let store = store_with_targets();
        let timeline = TestTimeline::new();

        let slot = store.acquire_writable_slot(&timeline).unwrap();
        store.publish_completed_frame(&timeline, slot);

        // The published slot must not come up again until a newer frame
        // displaces it.
        for _ in 0..4 {
            let next = store.acquire_writable_slot(&timeline).unwrap();
            assert_ne!(next, slot, "published slot {slot} was reacquired");
        }
    }

    #[test]
    fn test_publication_carries_slot_target_and_sequence() {
        let store = store_with_targets();
        let timeline = TestTimeline::new();

        assert!(store.completed_render_frame().is_none(), "no frame yet");

        let slot = store.acquire_writable_slot(&timeline).unwrap();
        store.publish_completed_frame(&timeline, slot);

        let frame = store.completed_render_frame().expect("published frame");
        assert_eq!(frame.slot_index, slot);
        assert_eq!(frame.texture, 100 + slot as u32);
        assert_eq!(frame.framebuffer, 200 + slot as u32);
        assert_eq!(frame.sequence, 1);
        assert_ne!(frame.fence, 0);
    }

    #[test]
    fn test_consumer_fence_gates_slot_reuse() {
        let store = store_with_targets();
        let timeline = TestTimeline::new();

        let slot = store.acquire_writable_slot(&timeline).unwrap();
        store.publish_completed_frame(&timeline, slot);
        let frame = store.completed_render_frame().unwrap();

        // Host samples and acknowledges.
        let ack = timeline.insert_fence();
        store.submit_consumer_fence(&timeline, frame.slot_index, ack);

        // Publish from two other slots so the acknowledged one rotates back
        // into the writable set.
        for _ in 0..2 {
            let s = store.acquire_writable_slot(&timeline).unwrap();
            store.publish_completed_frame(&timeline, s);
        }
        let reused = store.acquire_writable_slot(&timeline).unwrap();
        assert_eq!(reused, slot);

        let events = timeline.events();
        let wait = events
            .iter()
            .position(|e| *e == GpuEvent::WaitGpu(ack))
            .expect("reuse waited on the consumer fence");
        let delete = events
            .iter()
            .position(|e| *e == GpuEvent::DeleteFence(ack))
            .expect("consumer fence retired");
        assert!(wait < delete, "wait must precede retirement");
    }

    #[test]
    fn test_unacknowledged_reads_stall_the_producer() {
        let store = store_with_targets();
        let timeline = TestTimeline::new();

        // The host reads each published frame but never fences any of them.
        for _ in 0..SLOT_COUNT {
            let slot = store.acquire_writable_slot(&timeline).expect("slot free");
            store.publish_completed_frame(&timeline, slot);
            store.completed_render_frame().unwrap();
        }

        // Every slot is either published or handed out without a fence.
        assert_eq!(
            store.acquire_writable_slot(&timeline),
            None,
            "producer must skip the frame rather than overwrite live reads"
        );

        // A single acknowledgement unblocks it.
        let ack = timeline.insert_fence();
        store.submit_consumer_fence(&timeline, 0, ack);
        assert!(store.acquire_writable_slot(&timeline).is_some());
    }

    #[test]
    fn test_stale_consumer_fence_skips_gpu_wait() {
        let store = store_with_targets();
        let timeline = TestTimeline::new();

        let slot = store.acquire_writable_slot(&timeline).unwrap();
        store.publish_completed_frame(&timeline, slot);
        let frame = store.completed_render_frame().unwrap();

        let ack = timeline.insert_fence();
        store.submit_consumer_fence(&timeline, frame.slot_index, ack);
        timeline.invalidate(ack);

        for _ in 0..2 {
            let s = store.acquire_writable_slot(&timeline).unwrap();
            store.publish_completed_frame(&timeline, s);
        }
        let reused = store.acquire_writable_slot(&timeline).unwrap();
        assert_eq!(reused, slot);

        let events = timeline.events();
        assert!(
            events.contains(&GpuEvent::StaleWaitSkipped(ack)),
            "stale fence should be skipped, not waited on"
        );
        assert!(!events.contains(&GpuEvent::WaitGpu(ack)));
    }

    #[test]
    fn test_never_read_frames_recycle_freely() {
        let store = store_with_targets();
        let timeline = TestTimeline::new();

        // Host never looks at anything; worker keeps cycling through the
        // two unpublished slots without ever stalling.
        for i in 0..10 {
            let slot = store
                .acquire_writable_slot(&timeline)
                .unwrap_or_else(|| panic!("iteration {i} stalled"));
            store.publish_completed_frame(&timeline, slot);
        }
    }

    #[test]
    fn test_producer_fence_rotation_deletes_old_fence() {
        let store = store_with_targets();
        let timeline = TestTimeline::new();

        let slot = store.acquire_writable_slot(&timeline).unwrap();
        store.publish_completed_frame(&timeline, slot);
        let first = store.completed.read().fence;

        // Cycle far enough for the same slot to be rendered again.
        loop {
            let s = store.acquire_writable_slot(&timeline).unwrap();
            store.publish_completed_frame(&timeline, s);
            if s == slot {
                break;
            }
        }

        assert!(
            timeline.events().contains(&GpuEvent::DeleteFence(first)),
            "superseded producer fence must be retired"
        );
    }
}
