//! Top-level engine: owns the shared state, wires the subsystems together,
//! and exposes the entry points the interception layer calls.
//!
//! Thread shape: the host's render thread drives [`PipEngine::submit_frame`]
//! and the viewport/composite calls; the render and capture workers run on
//! their own threads with their own shared GL contexts; the watchdog polls
//! context identity in the background. Teardown is cooperative: flag, wake,
//! bounded join, GPU objects left to the driver.

use std::sync::Arc;
use std::time::Instant;

use glow::HasContext;

use crate::capture::{
    CaptureQueue, CaptureRequest, CaptureRouter, CaptureSource, CaptureWorker, MirrorBlitter,
    MirrorSet,
};
use crate::config::{
    ConfigCommandSender, ConfigEditor, ConfigSnapshot, ConfigStore, ModeId,
};
use crate::error::{GlPipError, GlPipResult};
use crate::geometry::{RectF, RectI};
use crate::gpu::{framebuffer_from_raw, ContextWatch, GlTimeline, GpuTimeline};
use crate::pipeline::{
    composite_published_frame, FrameQueue, FrameRenderRequest, OverlayFlags, OverlayPainter,
    OverlayRegistry, RenderWorker,
};
use crate::runtime::SharedRuntimeState;
use crate::store::FrameStore;
use crate::transition::{ModeTransitionState, TransitionEngine};
use crate::viewport::{steady_rect, ViewportCall, ViewportCompositor, ViewportDecision};
use crate::watchdog::{Watchdog, CHECK_INTERVAL, MIN_REBUILD_INTERVAL, REBUILD_DWELL};

/// The engine facade. One instance per hooked host process.
pub struct PipEngine {
    runtime: Arc<SharedRuntimeState>,
    config: Arc<ConfigStore>,
    config_sender: ConfigCommandSender,
    editor: ConfigEditor,
    transition: TransitionEngine,
    viewport: ViewportCompositor,
    store: Arc<FrameStore>,
    frame_queue: Arc<FrameQueue>,
    overlays: Arc<OverlayRegistry>,
    mirrors: Arc<MirrorSet>,
    capture_queue: Arc<CaptureQueue>,
    capture_router: CaptureRouter,
    render_worker: Option<RenderWorker>,
    capture_worker: Option<CaptureWorker>,
    watchdog: Option<Watchdog>,
}

impl PipEngine {
    pub fn new(initial: ConfigSnapshot) -> Self {
        let runtime = Arc::new(SharedRuntimeState::new());
        let config = Arc::new(ConfigStore::new(initial));
        let (editor, config_sender) = ConfigEditor::new(Arc::clone(&config));
        let transition = TransitionEngine::new();
        let viewport = ViewportCompositor::new(
            Arc::clone(&runtime),
            Arc::clone(&config),
            transition.snapshot(),
        );
        Self {
            runtime,
            config,
            config_sender,
            editor,
            transition,
            viewport,
            store: Arc::new(FrameStore::new()),
            frame_queue: Arc::new(FrameQueue::new()),
            overlays: Arc::new(OverlayRegistry::new()),
            mirrors: Arc::new(MirrorSet::new()),
            capture_queue: Arc::new(CaptureQueue::new()),
            capture_router: CaptureRouter::new(),
            render_worker: None,
            capture_worker: None,
            watchdog: None,
        }
    }

    pub fn runtime(&self) -> &Arc<SharedRuntimeState> {
        &self.runtime
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Sender half of the single-writer config queue, for the input and UI
    /// subsystems.
    pub fn config_sender(&self) -> ConfigCommandSender {
        self.config_sender.clone()
    }

    pub fn overlays(&self) -> &Arc<OverlayRegistry> {
        &self.overlays
    }

    pub fn mirrors(&self) -> &Arc<MirrorSet> {
        &self.mirrors
    }

    pub fn frame_store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// Spawn the background render worker. `init` runs on the worker thread
    /// and builds its GPU state (shared context, slot targets, painter).
    pub fn attach_render_worker<T, P, F>(&mut self, init: F) -> GlPipResult<()>
    where
        T: GpuTimeline + 'static,
        P: OverlayPainter + 'static,
        F: FnOnce(&FrameStore) -> GlPipResult<(T, P)> + Send + 'static,
    {
        self.render_worker = Some(RenderWorker::spawn(
            Arc::clone(&self.runtime),
            Arc::clone(&self.config),
            Arc::clone(&self.frame_queue),
            Arc::clone(&self.store),
            Arc::clone(&self.overlays),
            init,
        )?);
        Ok(())
    }

    /// Spawn the background capture worker for the shared-texture path.
    pub fn attach_capture_worker<T, B, F>(&mut self, init: F) -> GlPipResult<()>
    where
        T: GpuTimeline + 'static,
        B: MirrorBlitter + 'static,
        F: FnOnce(&MirrorSet) -> GlPipResult<(T, B)> + Send + 'static,
    {
        self.capture_worker = Some(CaptureWorker::spawn(
            Arc::clone(&self.runtime),
            Arc::clone(&self.mirrors),
            Arc::clone(&self.capture_queue),
            init,
        )?);
        Ok(())
    }

    /// Spawn the context watchdog with the standard debounce parameters.
    pub fn attach_watchdog<I, R>(
        &mut self,
        initial_context: u64,
        current_id: I,
        on_rebuild: R,
    ) -> GlPipResult<()>
    where
        I: Fn() -> u64 + Send + 'static,
        R: FnMut(u64) + Send + 'static,
    {
        self.watchdog = Some(Watchdog::spawn(
            Arc::clone(&self.runtime),
            ContextWatch::new(initial_context, REBUILD_DWELL, MIN_REBUILD_INTERVAL),
            CHECK_INTERVAL,
            current_id,
            on_rebuild,
        )?);
        Ok(())
    }

    /// Switch to the named mode, animating from wherever the geometry is
    /// right now. A switch during a transition redirects it mid-flight.
    pub fn request_mode_switch(&mut self, name: &str, now: Instant) -> GlPipResult<()> {
        let snapshot = self.config.load();
        let to_mode = snapshot
            .resolve(name)
            .ok_or_else(|| GlPipError::UnknownMode(name.to_string()))?;
        let to_cfg = snapshot
            .mode(to_mode)
            .ok_or_else(|| GlPipError::UnknownMode(name.to_string()))?;

        let native_w = to_cfg.native_width as i32;
        let native_h = to_cfg.native_height as i32;
        let full = RectF::new(0.0, 0.0, native_w as f32, native_h as f32);
        let to = steady_rect(to_cfg, native_w, native_h);

        let from_mode = self.runtime.current_mode();
        let state = self.transition.snapshot().read();
        let from = if state.active {
            state.current
        } else {
            match snapshot.mode(from_mode) {
                Some(from_cfg) => steady_rect(from_cfg, native_w, native_h),
                None => full,
            }
        };

        log::info!("[Engine] mode switch -> '{name}'");
        self.runtime.set_current_mode(to_mode);
        self.transition
            .start(from_mode, to_mode, from, to, to_cfg.transition, now);
        Ok(())
    }

    /// Leave virtual mode, animating back out to the full native output.
    pub fn exit_virtual_mode(&mut self, now: Instant) {
        let from_mode = self.runtime.current_mode();
        if from_mode == ModeId::NONE {
            return;
        }
        let snapshot = self.config.load();
        let state = self.transition.snapshot().read();

        let (style, native_w, native_h) = match snapshot.mode(from_mode) {
            Some(cfg) => (
                cfg.transition,
                cfg.native_width as i32,
                cfg.native_height as i32,
            ),
            None => {
                let g = self.viewport.geometry();
                (Default::default(), g.native_w.max(1), g.native_h.max(1))
            }
        };
        let full = RectF::new(0.0, 0.0, native_w as f32, native_h as f32);
        let from = if state.active {
            state.current
        } else {
            match snapshot.mode(from_mode) {
                Some(cfg) => steady_rect(cfg, native_w, native_h),
                None => full,
            }
        };

        log::info!("[Engine] exiting virtual mode");
        self.runtime.set_current_mode(ModeId::NONE);
        self.transition
            .start(from_mode, ModeId::NONE, from, full, style, now);
    }

    /// Per-frame driver, called once by the host render thread: applies
    /// queued config edits, advances the animation, and posts a render
    /// request for the overlay worker.
    pub fn submit_frame(&mut self, now: Instant) -> ModeTransitionState {
        let applied = self.editor.apply_pending();
        if applied > 0 {
            log::debug!("[Engine] applied {applied} config command(s)");
        }

        let state = self.transition.tick(now);
        let mode = self.runtime.current_mode();
        if mode == ModeId::NONE && !state.active {
            return state;
        }

        let geometry = self.viewport.geometry();
        let native = if geometry.native_w > 0 && geometry.native_h > 0 {
            RectI::new(0, 0, geometry.native_w, geometry.native_h)
        } else if let Some(cfg) = self.config.load().mode(mode) {
            RectI::new(0, 0, cfg.native_width as i32, cfg.native_height as i32)
        } else {
            return state;
        };

        let (from, to, progress) = if state.active {
            (state.from, state.to, state.move_progress)
        } else {
            (state.to, state.to, 1.0)
        };
        self.frame_queue.submit(FrameRenderRequest {
            mode,
            native,
            from_rect: from,
            to_rect: to,
            progress,
            overlays: OverlayFlags {
                ui: self.runtime.gui_visible(),
                debug: false,
                transition: state.active,
            },
        });
        state
    }

    /// One intercepted native viewport call.
    pub fn viewport_call(&self, call: ViewportCall) -> ViewportDecision {
        self.viewport.decide(call)
    }

    pub fn native_to_virtual(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        self.viewport.native_to_virtual(x, y)
    }

    pub fn virtual_to_native(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        self.viewport.virtual_to_native(x, y)
    }

    /// Route one captured host frame. Shared-texture frames go to the
    /// capture worker; framebuffer frames are handled on the host thread
    /// via [`crate::capture::mirror_host_frame`].
    pub fn submit_capture(&self, source: CaptureSource, width: i32, height: i32) {
        self.capture_router.note(source);
        if matches!(source, CaptureSource::SharedTexture(_)) {
            self.capture_queue.submit(CaptureRequest {
                source,
                width,
                height,
            });
        }
    }

    /// Texture a downstream adapter should sample for the named mirror.
    pub fn completed_obs_texture(&self, mirror: &str) -> Option<u32> {
        self.mirrors.get(mirror)?.completed_texture()
    }

    /// Blit the latest published overlay frame over the host backbuffer.
    /// Runs on the host thread with the host context current; returns false
    /// when no frame has been published yet.
    pub fn composite_into_backbuffer(
        &self,
        timeline: &GlTimeline,
        width: i32,
        height: i32,
    ) -> bool {
        let gl = Arc::clone(timeline.gl());
        composite_published_frame(timeline, &self.store, |frame| unsafe {
            gl.bind_framebuffer(
                glow::READ_FRAMEBUFFER,
                framebuffer_from_raw(frame.framebuffer),
            );
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, None);
            gl.blit_framebuffer(
                0,
                0,
                width,
                height,
                0,
                0,
                width,
                height,
                glow::COLOR_BUFFER_BIT,
                glow::NEAREST,
            );
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
        })
    }

    /// Cooperative teardown: set the flag, wake every worker, join with a
    /// bound. GPU objects are intentionally left to the driver; the host
    /// process is usually exiting anyway.
    pub fn shutdown(&mut self) {
        log::info!("[Engine] shutting down");
        self.runtime.request_shutdown();
        self.frame_queue.wake();
        self.capture_queue.wake();
        if let Some(watchdog) = &self.watchdog {
            watchdog.wake();
        }
        if let Some(worker) = self.render_worker.take() {
            worker.join();
        }
        if let Some(worker) = self.capture_worker.take() {
            worker.join();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.join();
        }
    }
}

impl Drop for PipEngine {
    fn drop(&mut self) {
        if !self.runtime.shutdown_requested() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MirrorTarget;
    use crate::config::test_mode;
    use crate::gpu::timeline::testing::TestTimeline;
    use crate::pipeline::{FrameScene, PaintTarget};
    use crate::store::SLOT_COUNT;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn engine_with_modes() -> PipEngine {
        let snapshot = ConfigSnapshot::default()
            .with_mode(test_mode("pip", (1920, 1080), RectI::new(0, 0, 960, 540)))
            .with_mode(test_mode("full", (1920, 1080), RectI::new(0, 0, 1920, 1080)));
        PipEngine::new(snapshot)
    }

    #[test]
    fn test_mode_switch_activates_and_animates() {
        let mut engine = engine_with_modes();
        let t0 = Instant::now();

        engine.request_mode_switch("pip", t0).expect("known mode");
        assert!(engine.runtime().virtual_mode_active());

        let state = engine.submit_frame(t0 + Duration::from_millis(100));
        assert!(state.active);
        // Letterboxed 960x540 in 1920x1080 is the target.
        assert_eq!(state.to, RectF::new(480.0, 270.0, 960.0, 540.0));

        let state = engine.submit_frame(t0 + Duration::from_secs(10));
        assert!(!state.active);
        assert_eq!(state.current, RectF::new(480.0, 270.0, 960.0, 540.0));
    }

    #[test]
    fn test_unknown_mode_is_an_error() {
        let mut engine = engine_with_modes();
        let err = engine
            .request_mode_switch("nope", Instant::now())
            .unwrap_err();
        assert!(matches!(err, GlPipError::UnknownMode(_)));
        assert!(!engine.runtime().virtual_mode_active());
    }

    #[test]
    fn test_exit_returns_to_full_native() {
        let mut engine = engine_with_modes();
        let t0 = Instant::now();
        engine.request_mode_switch("pip", t0).unwrap();
        engine.submit_frame(t0 + Duration::from_secs(10));

        engine.exit_virtual_mode(t0 + Duration::from_secs(11));
        assert!(!engine.runtime().virtual_mode_active());

        let state = engine.submit_frame(t0 + Duration::from_secs(20));
        assert!(!state.active);
        assert_eq!(state.current, RectF::new(0.0, 0.0, 1920.0, 1080.0));
    }

    #[test]
    fn test_mid_flight_switch_redirects_from_current_rect() {
        let mut engine = engine_with_modes();
        let t0 = Instant::now();
        engine.request_mode_switch("pip", t0).unwrap();
        let mid = engine.submit_frame(t0 + Duration::from_millis(125));
        assert!(mid.active);

        engine
            .request_mode_switch("full", t0 + Duration::from_millis(125))
            .unwrap();
        let state = engine.submit_frame(t0 + Duration::from_millis(126));
        assert_eq!(state.from, mid.current, "redirect starts where we are");
    }

    #[test]
    fn test_drag_commands_apply_on_next_frame() {
        let mut engine = engine_with_modes();
        let id = engine.config().load().resolve("pip").unwrap();
        let sender = engine.config_sender();
        sender.send(crate::config::ConfigCommand::NudgeVirtualRect {
            mode: id,
            dx: 7,
            dy: -3,
        });

        // Nothing moved yet; the queue is drained on the frame path.
        assert_eq!(engine.config().load().mode(id).unwrap().virtual_rect.x, 0);
        engine.submit_frame(Instant::now());
        let rect = engine.config().load().mode(id).unwrap().virtual_rect;
        assert_eq!((rect.x, rect.y), (7, -3));
    }

    #[test]
    fn test_obs_texture_surface() {
        let engine = engine_with_modes();
        assert_eq!(engine.completed_obs_texture("obs"), None);

        let output = engine.mirrors().register("obs", Duration::ZERO);
        output.set_target(0, 10, 20);
        output.set_target(1, 11, 21);
        assert_eq!(engine.completed_obs_texture("obs"), None);

        let timeline = TestTimeline::new();
        let (side, target) = output.acquire_back(&timeline);
        assert_eq!(target, MirrorTarget { texture: 11, framebuffer: 21 });
        output.publish(&timeline, side);
        assert_eq!(engine.completed_obs_texture("obs"), Some(11));
    }

    struct NullPainter;

    impl OverlayPainter for NullPainter {
        fn paint(&mut self, _target: PaintTarget, _scene: &FrameScene) -> GlPipResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_shutdown_joins_attached_workers() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut engine = engine_with_modes();
        engine
            .attach_render_worker(|store| {
                for i in 0..SLOT_COUNT {
                    store.set_slot_target(i, 1 + i as u32, 10 + i as u32);
                }
                Ok((TestTimeline::new(), NullPainter))
            })
            .unwrap();

        let blits: Arc<Mutex<Vec<CaptureSource>>> = Arc::default();
        struct VecBlitter(Arc<Mutex<Vec<CaptureSource>>>);
        impl MirrorBlitter for VecBlitter {
            fn blit(
                &mut self,
                source: CaptureSource,
                _target: MirrorTarget,
                _w: i32,
                _h: i32,
            ) -> GlPipResult<()> {
                self.0.lock().push(source);
                Ok(())
            }
        }
        let sink = Arc::clone(&blits);
        engine
            .attach_capture_worker(move |_| Ok((TestTimeline::new(), VecBlitter(sink))))
            .unwrap();
        engine
            .attach_watchdog(0xA, || 0xA, |_| {})
            .unwrap();

        let t0 = Instant::now();
        engine.request_mode_switch("pip", t0).unwrap();
        engine.submit_frame(t0 + Duration::from_millis(10));
        engine.submit_capture(CaptureSource::SharedTexture(5), 1920, 1080);

        // Must return promptly and leave no thread behind.
        engine.shutdown();
    }
}
