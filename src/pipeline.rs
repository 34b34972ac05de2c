//! Render worker: frame requests in, composed overlay frames out.
//!
//! The main thread posts at most one pending [`FrameRenderRequest`] per
//! frame (newer requests replace older ones, the worker only ever renders
//! the freshest state). The worker owns its own shared GL context and
//! paints the overlay scene — background, border, registered overlay
//! elements — into one of the [`FrameStore`] slots, then publishes it with
//! a producer fence. All GL access is behind the [`OverlayPainter`] and
//! [`GpuTimeline`] seams so the slot and queue logic is testable without a
//! GPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use glow::HasContext;
use parking_lot::{Mutex, RwLock};

use crate::config::{BackgroundStyle, BorderStyle, ConfigStore, ModeId};
use crate::error::{GlPipError, GlPipResult};
use crate::geometry::{RectF, RectI};
use crate::gpu::{framebuffer_from_raw, texture_from_raw, GpuTimeline};
use crate::runtime::{SharedRuntimeState, WorkSignal};
use crate::store::{CompletedRenderFrame, FrameStore};

/// How long the worker parks before re-checking the shutdown flag when no
/// work arrives.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Which overlay categories the requested frame should include.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayFlags {
    pub ui: bool,
    pub debug: bool,
    pub transition: bool,
}

/// One frame's worth of input for the render worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRenderRequest {
    pub mode: ModeId,
    /// Host native output rectangle (always origin-anchored).
    pub native: RectI,
    pub from_rect: RectF,
    pub to_rect: RectF,
    /// Geometry progress, 0..=1; the content rect is the interpolation of
    /// `from_rect` and `to_rect` at this value.
    pub progress: f32,
    pub overlays: OverlayFlags,
}

/// Single-pending-request queue between the main thread and the worker.
///
/// Submitting while a request is already pending replaces it; stale frames
/// are worthless by the time the worker would get to them.
#[derive(Default)]
pub struct FrameQueue {
    pending: Mutex<Option<FrameRenderRequest>>,
    signal: WorkSignal,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, request: FrameRenderRequest) {
        *self.pending.lock() = Some(request);
        self.signal.notify();
    }

    pub fn take(&self) -> Option<FrameRenderRequest> {
        self.pending.lock().take()
    }

    /// Park until a request arrives or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout)
    }

    /// Wake the worker without posting work (used on shutdown).
    pub fn wake(&self) {
        self.signal.notify();
    }
}

/// Category an overlay element belongs to; visibility is gated per category
/// by [`OverlayFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayCategory {
    Ui,
    Debug,
    Transition,
}

/// Handle to a registered overlay element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayId(u64);

/// One textured overlay quad, positioned in native pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayElement {
    pub texture: u32,
    pub rect: RectI,
    pub category: OverlayCategory,
    /// Draw order within a frame; higher draws on top.
    pub z: i32,
    pub visible: bool,
}

/// Registry of overlay elements, shared between the subsystems that create
/// overlays and the render worker that draws them.
///
/// The frame path only takes the read lock; the write lock is held only at
/// create/update/destroy, which happen off the per-frame cadence.
#[derive(Default)]
pub struct OverlayRegistry {
    elements: RwLock<HashMap<OverlayId, OverlayElement>>,
    next_id: AtomicU64,
}

impl OverlayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, element: OverlayElement) -> OverlayId {
        let id = OverlayId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.elements.write().insert(id, element);
        id
    }

    pub fn update(&self, id: OverlayId, edit: impl FnOnce(&mut OverlayElement)) {
        if let Some(element) = self.elements.write().get_mut(&id) {
            edit(element);
        }
    }

    pub fn remove(&self, id: OverlayId) -> bool {
        self.elements.write().remove(&id).is_some()
    }

    /// Snapshot of the elements visible under `flags`, in draw order.
    pub fn visible(&self, flags: OverlayFlags) -> Vec<OverlayElement> {
        let mut out: Vec<OverlayElement> = self
            .elements
            .read()
            .values()
            .filter(|e| e.visible)
            .filter(|e| match e.category {
                OverlayCategory::Ui => flags.ui,
                OverlayCategory::Debug => flags.debug,
                OverlayCategory::Transition => flags.transition,
            })
            .copied()
            .collect();
        out.sort_by_key(|e| e.z);
        out
    }
}

/// Destination render target for one painted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaintTarget {
    pub texture: u32,
    pub framebuffer: u32,
    pub width: i32,
    pub height: i32,
}

/// Fully resolved description of one overlay frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameScene {
    pub native: RectI,
    /// Where the host content will land; the painter leaves this region to
    /// the host-side blit and draws border/background around it.
    pub content_rect: RectI,
    pub background: BackgroundStyle,
    pub border: BorderStyle,
    pub overlays: Vec<OverlayElement>,
}

/// Paints one resolved scene into a render target. The GL implementation
/// runs on the worker context; tests substitute a recording painter.
pub trait OverlayPainter {
    fn paint(&mut self, target: PaintTarget, scene: &FrameScene) -> GlPipResult<()>;
}

/// GL scene painter: clears the background, draws the border as scissored
/// clears, and blits overlay textures through a scratch read framebuffer.
pub struct GlScenePainter {
    gl: Arc<glow::Context>,
    read_fbo: glow::NativeFramebuffer,
}

impl GlScenePainter {
    pub fn new(gl: Arc<glow::Context>) -> GlPipResult<Self> {
        let read_fbo = unsafe { gl.create_framebuffer() }
            .map_err(|err| GlPipError::RenderTarget(format!("scratch read fbo: {err}")))?;
        Ok(Self { gl, read_fbo })
    }

    unsafe fn scissor_clear(&self, rect: RectI, color: [f32; 4], target_h: i32) {
        if rect.w <= 0 || rect.h <= 0 {
            return;
        }
        // Scissor rects are bottom-left anchored.
        self.gl
            .scissor(rect.x, target_h - (rect.y + rect.h), rect.w, rect.h);
        self.gl.clear_color(color[0], color[1], color[2], color[3]);
        self.gl.clear(glow::COLOR_BUFFER_BIT);
    }
}

impl OverlayPainter for GlScenePainter {
    fn paint(&mut self, target: PaintTarget, scene: &FrameScene) -> GlPipResult<()> {
        let gl = &self.gl;
        unsafe {
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, framebuffer_from_raw(target.framebuffer));
            gl.viewport(0, 0, target.width, target.height);

            gl.disable(glow::SCISSOR_TEST);
            let bg = scene.background.color;
            gl.clear_color(bg[0], bg[1], bg[2], bg[3]);
            gl.clear(glow::COLOR_BUFFER_BIT);

            if scene.border.enabled {
                let c = scene.content_rect;
                let w = scene.border.width_px.max(0);
                gl.enable(glow::SCISSOR_TEST);
                let color = scene.border.color;
                // Four strips around the content rect.
                self.scissor_clear(
                    RectI::new(c.x - w, c.y - w, c.w + 2 * w, w),
                    color,
                    target.height,
                );
                self.scissor_clear(
                    RectI::new(c.x - w, c.y + c.h, c.w + 2 * w, w),
                    color,
                    target.height,
                );
                self.scissor_clear(RectI::new(c.x - w, c.y, w, c.h), color, target.height);
                self.scissor_clear(RectI::new(c.x + c.w, c.y, w, c.h), color, target.height);
                gl.disable(glow::SCISSOR_TEST);
            }

            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(self.read_fbo));
            for overlay in &scene.overlays {
                gl.framebuffer_texture_2d(
                    glow::READ_FRAMEBUFFER,
                    glow::COLOR_ATTACHMENT0,
                    glow::TEXTURE_2D,
                    texture_from_raw(overlay.texture),
                    0,
                );
                let r = overlay.rect;
                let dst_y = target.height - (r.y + r.h);
                gl.blit_framebuffer(
                    0,
                    0,
                    r.w,
                    r.h,
                    r.x,
                    dst_y,
                    r.x + r.w,
                    dst_y + r.h,
                    glow::COLOR_BUFFER_BIT,
                    glow::LINEAR,
                );
            }
            gl.framebuffer_texture_2d(
                glow::READ_FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                None,
                0,
            );
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, None);
        }
        Ok(())
    }
}

impl Drop for GlScenePainter {
    fn drop(&mut self) {
        unsafe {
            self.gl.delete_framebuffer(self.read_fbo);
        }
    }
}

/// Resolve a frame request against the live configuration into a paintable
/// scene. Returns `None` when the mode has been deleted out from under the
/// request.
fn resolve_scene(
    config: &ConfigStore,
    registry: &OverlayRegistry,
    request: &FrameRenderRequest,
) -> Option<FrameScene> {
    let snapshot = config.load();
    let mode = snapshot.mode(request.mode)?;
    let content_rect = request
        .from_rect
        .lerp(request.to_rect, request.progress.clamp(0.0, 1.0))
        .round();
    Some(FrameScene {
        native: request.native,
        content_rect,
        background: mode.background,
        border: mode.border,
        overlays: registry.visible(request.overlays),
    })
}

/// The background render worker thread.
///
/// GPU state (context, timeline, painter, slot render targets) is created
/// by the `init` closure on the worker thread itself; a failed init logs
/// and degrades to "no overlay frames" rather than taking the host down.
pub struct RenderWorker {
    handle: Option<JoinHandle<()>>,
}

impl RenderWorker {
    pub fn spawn<T, P, F>(
        runtime: Arc<SharedRuntimeState>,
        config: Arc<ConfigStore>,
        queue: Arc<FrameQueue>,
        store: Arc<FrameStore>,
        registry: Arc<OverlayRegistry>,
        init: F,
    ) -> GlPipResult<Self>
    where
        T: GpuTimeline + 'static,
        P: OverlayPainter + 'static,
        F: FnOnce(&FrameStore) -> GlPipResult<(T, P)> + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name("glpip-render".to_string())
            .spawn(move || {
                let (timeline, mut painter) = match init(&store) {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::error!("[RenderWorker] init failed, overlay rendering disabled: {err}");
                        return;
                    }
                };
                log::info!("[RenderWorker] started");
                Self::run(&runtime, &config, &queue, &store, &registry, &timeline, &mut painter);
                log::info!("[RenderWorker] stopped");
            })
            .map_err(|err| GlPipError::Other(format!("spawn render worker: {err}")))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    fn run<T: GpuTimeline, P: OverlayPainter>(
        runtime: &SharedRuntimeState,
        config: &ConfigStore,
        queue: &FrameQueue,
        store: &FrameStore,
        registry: &OverlayRegistry,
        timeline: &T,
        painter: &mut P,
    ) {
        while !runtime.shutdown_requested() {
            if !queue.wait_timeout(IDLE_POLL) {
                continue;
            }
            let Some(request) = queue.take() else {
                continue;
            };
            let Some(scene) = resolve_scene(config, registry, &request) else {
                log::warn!(
                    "[RenderWorker] dropping frame for unknown mode {}",
                    request.mode.raw()
                );
                continue;
            };
            let Some(slot) = store.acquire_writable_slot(timeline) else {
                // Every slot is published or in flight on the host GPU;
                // skip this frame, the next request will try again.
                log::trace!("[RenderWorker] no writable slot, skipping frame");
                continue;
            };
            let (texture, framebuffer) = store.slot_target(slot);
            let target = PaintTarget {
                texture,
                framebuffer,
                width: scene.native.w,
                height: scene.native.h,
            };
            if let Err(err) = painter.paint(target, &scene) {
                log::error!("[RenderWorker] paint failed: {err}");
                continue;
            }
            store.publish_completed_frame(timeline, slot);
        }
    }

    /// Wait for the worker to exit. Call after setting the shutdown flag
    /// and waking the queue.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[RenderWorker] worker thread panicked");
            }
        }
    }
}

/// Host-thread side of the handoff: take the latest published frame, order
/// the host GPU behind its producer fence, run the caller's sampling
/// commands, then acknowledge with a consumer fence.
///
/// Returns `false` when no frame has been published yet.
pub fn composite_published_frame<T: GpuTimeline>(
    timeline: &T,
    store: &FrameStore,
    sample: impl FnOnce(&CompletedRenderFrame),
) -> bool {
    let Some(frame) = store.completed_render_frame() else {
        return false;
    };
    timeline.wait_gpu(frame.fence);
    sample(&frame);
    let ack = timeline.insert_fence();
    timeline.flush();
    store.submit_consumer_fence(timeline, frame.slot_index, ack);
    true
}
