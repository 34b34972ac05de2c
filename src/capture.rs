//! Mirror outputs for downstream consumers (streaming/recording adapters).
//!
//! Each named mirror owns a front/back pair of render targets. The capture
//! side blits the host's frame into the back target, fences it, and flips;
//! readers only ever see the front target through a published snapshot.
//! Outputs capture at their own reduced rate via a per-output interval.
//!
//! Two mutually exclusive capture paths exist: reading the host's shared
//! frame texture directly (found by a best-effort scan) or blitting from
//! the default framebuffer on the host thread. Every switch between the
//! two is logged exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use glow::HasContext;
use parking_lot::{Mutex, RwLock};

use crate::error::{GlPipError, GlPipResult};
use crate::gpu::{framebuffer_from_raw, texture_from_raw, GpuTimeline, RawFence};
use crate::runtime::{SharedRuntimeState, WorkSignal};
use crate::snapshot::Snapshot;

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Highest texture name the frame-texture scan will probe. The scan is a
/// best-effort heuristic: hosts bind their frame texture early, so its name
/// is near the start of the namespace.
pub const TEXTURE_SCAN_LIMIT: u32 = 1000;

/// GL objects backing one side of a mirror's double buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorTarget {
    pub texture: u32,
    pub framebuffer: u32,
}

/// One published mirror frame, as the downstream reader sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorFrame {
    pub texture: u32,
    pub fence: RawFence,
    pub side: usize,
    pub sequence: u64,
}

#[derive(Default)]
struct TargetCell {
    texture: AtomicU32,
    framebuffer: AtomicU32,
    consumer_fence: AtomicU64,
}

/// Double-buffered mirror output with an atomic front index.
///
/// Writers touch only the back target; the flip is a single atomic store
/// after the producer fence is in place, so readers never observe a
/// half-written frame.
pub struct MirrorOutput {
    targets: [TargetCell; 2],
    front: AtomicUsize,
    interval: Duration,
    last_capture: Mutex<Option<Instant>>,
    published: Snapshot<MirrorFrame>,
    sequence: AtomicU64,
}

impl MirrorOutput {
    pub fn new(interval: Duration) -> Self {
        Self {
            targets: Default::default(),
            front: AtomicUsize::new(0),
            interval,
            last_capture: Mutex::new(None),
            published: Snapshot::new(MirrorFrame::default()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Record the GL objects backing side `side`. Called during capture
    /// setup, with a context current on the calling thread.
    pub fn set_target(&self, side: usize, texture: u32, framebuffer: u32) {
        let cell = &self.targets[side];
        cell.texture.store(texture, Ordering::Release);
        cell.framebuffer.store(framebuffer, Ordering::Release);
    }

    pub fn target(&self, side: usize) -> MirrorTarget {
        let cell = &self.targets[side];
        MirrorTarget {
            texture: cell.texture.load(Ordering::Acquire),
            framebuffer: cell.framebuffer.load(Ordering::Acquire),
        }
    }

    /// Whether this output wants a frame at `now`; records the capture
    /// time when it does.
    pub fn due(&self, now: Instant) -> bool {
        let mut last = self.last_capture.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Take the back target for writing, queueing the write behind any
    /// outstanding reader fence on that side.
    pub fn acquire_back(&self, timeline: &impl GpuTimeline) -> (usize, MirrorTarget) {
        let back = 1 - self.front.load(Ordering::Acquire);
        let consumer = self.targets[back].consumer_fence.swap(0, Ordering::AcqRel);
        if consumer != 0 {
            timeline.wait_gpu(consumer);
            timeline.delete_fence(consumer);
        }
        (back, self.target(back))
    }

    /// Fence the freshly written back target, flip it to front, and
    /// publish it for readers.
    pub fn publish(&self, timeline: &impl GpuTimeline, side: usize) {
        let fence = timeline.insert_fence();
        timeline.flush();
        self.front.store(side, Ordering::Release);
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.published.publish(MirrorFrame {
            texture: self.target(side).texture,
            fence,
            side,
            sequence,
        });
    }

    /// Latest published frame, or `None` before the first capture.
    pub fn published_frame(&self) -> Option<MirrorFrame> {
        let frame = self.published.read();
        (frame.sequence > 0).then_some(frame)
    }

    /// Texture the downstream adapter should sample right now.
    pub fn completed_texture(&self) -> Option<u32> {
        self.published_frame().map(|f| f.texture)
    }

    /// Bounded CPU-side wait for the latest published frame's contents.
    /// The fallback point for adapters that read the mirror texture back
    /// to system memory and so cannot queue a GPU-side wait. Returns false
    /// when nothing has been published yet; a stale fence counts as
    /// already complete.
    pub fn wait_published(&self, timeline: &impl GpuTimeline, timeout_ms: u64) -> bool {
        match self.published_frame() {
            Some(frame) => timeline.wait_cpu_bounded(frame.fence, timeout_ms),
            None => false,
        }
    }

    /// Reader acknowledgement: fence inserted after the reader's sampling
    /// commands on `side`.
    pub fn submit_consumer_fence(
        &self,
        timeline: &impl GpuTimeline,
        side: usize,
        fence: RawFence,
    ) {
        let previous = self.targets[side].consumer_fence.swap(fence, Ordering::AcqRel);
        if previous != 0 {
            timeline.delete_fence(previous);
        }
    }
}

/// Named mirror outputs, shared between the capture side and the adapters
/// that read them. Read lock on the frame path, write lock only at
/// register/remove.
#[derive(Default)]
pub struct MirrorSet {
    outputs: RwLock<HashMap<String, Arc<MirrorOutput>>>,
}

impl MirrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, interval: Duration) -> Arc<MirrorOutput> {
        let output = Arc::new(MirrorOutput::new(interval));
        self.outputs
            .write()
            .insert(name.to_string(), Arc::clone(&output));
        log::info!("[Capture] mirror '{name}' registered ({interval:?} interval)");
        output
    }

    pub fn get(&self, name: &str) -> Option<Arc<MirrorOutput>> {
        self.outputs.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.outputs.write().remove(name).is_some();
        if removed {
            log::info!("[Capture] mirror '{name}' removed");
        }
        removed
    }

    /// Outputs due for a frame at `now`.
    pub fn due_outputs(&self, now: Instant) -> Vec<Arc<MirrorOutput>> {
        self.outputs
            .read()
            .values()
            .filter(|o| o.due(now))
            .cloned()
            .collect()
    }
}

/// Size and filtering of an existing texture, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: i32,
    pub height: i32,
    pub min_filter: u32,
    pub mag_filter: u32,
}

/// Queries live texture objects. The GL implementation asks the driver;
/// tests substitute a fixed table.
pub trait TextureProbe {
    fn texture_info(&self, texture: u32) -> Option<TextureInfo>;
}

/// `glGetTexLevelParameteriv`; glow has no wrapper for it, so the probe
/// loads it straight from the host's proc loader.
type GetTexLevelParameterivFn =
    unsafe extern "system" fn(target: u32, level: i32, pname: u32, params: *mut i32);

const GL_TEXTURE_WIDTH: u32 = 0x1000;
const GL_TEXTURE_HEIGHT: u32 = 0x1001;

/// Driver-backed probe. Binds each candidate briefly; only used during
/// capture setup, never on the frame path.
pub struct GlTextureProbe {
    gl: Arc<glow::Context>,
    get_tex_level_parameter: Option<GetTexLevelParameterivFn>,
}

impl GlTextureProbe {
    /// `loader` is the same proc-address source the GL function table came
    /// from (`HostContext::gl_proc_address` or surfman's loader).
    pub fn new(
        gl: Arc<glow::Context>,
        loader: impl Fn(&str) -> *const core::ffi::c_void,
    ) -> Self {
        let ptr = loader("glGetTexLevelParameteriv");
        let get_tex_level_parameter = if ptr.is_null() {
            log::warn!("[Capture] glGetTexLevelParameteriv unavailable, texture scan disabled");
            None
        } else {
            Some(unsafe {
                std::mem::transmute::<*const core::ffi::c_void, GetTexLevelParameterivFn>(ptr)
            })
        };
        Self {
            gl,
            get_tex_level_parameter,
        }
    }
}

impl TextureProbe for GlTextureProbe {
    fn texture_info(&self, texture: u32) -> Option<TextureInfo> {
        let get_level = self.get_tex_level_parameter?;
        let handle = texture_from_raw(texture)?;
        unsafe {
            if !self.gl.is_texture(handle) {
                return None;
            }
            self.gl.bind_texture(glow::TEXTURE_2D, Some(handle));
            let mut width = 0i32;
            let mut height = 0i32;
            get_level(glow::TEXTURE_2D, 0, GL_TEXTURE_WIDTH, &mut width);
            get_level(glow::TEXTURE_2D, 0, GL_TEXTURE_HEIGHT, &mut height);
            let info = TextureInfo {
                width,
                height,
                min_filter: self
                    .gl
                    .get_tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER)
                    as u32,
                mag_filter: self
                    .gl
                    .get_tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER)
                    as u32,
            };
            self.gl.bind_texture(glow::TEXTURE_2D, None);
            Some(info)
        }
    }
}

/// Scan for the host's frame texture: the first live texture whose level-0
/// size matches the native output and whose min and mag filters are both
/// linear (presentation textures are sampled, never mipmapped).
///
/// Best-effort by nature; when it finds nothing the caller uses the
/// framebuffer fallback instead.
pub fn identify_frame_texture(
    probe: &dyn TextureProbe,
    width: i32,
    height: i32,
) -> Option<u32> {
    for candidate in 1..=TEXTURE_SCAN_LIMIT {
        let Some(info) = probe.texture_info(candidate) else {
            continue;
        };
        if info.width == width
            && info.height == height
            && info.min_filter == glow::LINEAR
            && info.mag_filter == glow::LINEAR
        {
            log::info!("[Capture] frame texture identified: {candidate} ({width}x{height})");
            return Some(candidate);
        }
    }
    None
}

/// Where a captured frame comes from. The two paths are mutually
/// exclusive per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// The host's frame texture, readable from the worker's shared context.
    SharedTexture(u32),
    /// The default framebuffer, readable only on the host thread.
    Framebuffer,
}

const PATH_UNSET: u8 = 0;
const PATH_TEXTURE: u8 = 1;
const PATH_FRAMEBUFFER: u8 = 2;

/// Tracks which capture path is in use and logs each switch exactly once.
#[derive(Default)]
pub struct CaptureRouter {
    last_path: AtomicU8,
}

impl CaptureRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the path taken this frame. Returns true when it differs from
    /// the previous frame's path (including the first frame).
    pub fn note(&self, source: CaptureSource) -> bool {
        let path = match source {
            CaptureSource::SharedTexture(_) => PATH_TEXTURE,
            CaptureSource::Framebuffer => PATH_FRAMEBUFFER,
        };
        let previous = self.last_path.swap(path, Ordering::AcqRel);
        let changed = previous != path;
        if changed {
            match source {
                CaptureSource::SharedTexture(texture) => {
                    log::info!("[Capture] using shared-texture path (texture {texture})");
                }
                CaptureSource::Framebuffer => {
                    log::info!("[Capture] using framebuffer fallback path");
                }
            }
        }
        changed
    }
}

/// One capture request posted by the host thread after it finishes a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub source: CaptureSource,
    pub width: i32,
    pub height: i32,
}

/// Single-pending-request queue for the capture worker; newer requests
/// replace older ones.
#[derive(Default)]
pub struct CaptureQueue {
    pending: Mutex<Option<CaptureRequest>>,
    signal: WorkSignal,
}

impl CaptureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, request: CaptureRequest) {
        *self.pending.lock() = Some(request);
        self.signal.notify();
    }

    pub fn take(&self) -> Option<CaptureRequest> {
        self.pending.lock().take()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout)
    }

    pub fn wake(&self) {
        self.signal.notify();
    }
}

/// Copies one frame from a capture source into a mirror target. GL
/// implementation blits; tests record.
pub trait MirrorBlitter {
    fn blit(
        &mut self,
        source: CaptureSource,
        target: MirrorTarget,
        width: i32,
        height: i32,
    ) -> GlPipResult<()>;
}

/// GL blitter over a scratch read framebuffer. The framebuffer path reads
/// from the default framebuffer and is only valid on the host thread.
pub struct GlMirrorBlitter {
    gl: Arc<glow::Context>,
    read_fbo: glow::NativeFramebuffer,
}

impl GlMirrorBlitter {
    pub fn new(gl: Arc<glow::Context>) -> GlPipResult<Self> {
        let read_fbo = unsafe { gl.create_framebuffer() }
            .map_err(|err| GlPipError::RenderTarget(format!("capture read fbo: {err}")))?;
        Ok(Self { gl, read_fbo })
    }
}

impl MirrorBlitter for GlMirrorBlitter {
    fn blit(
        &mut self,
        source: CaptureSource,
        target: MirrorTarget,
        width: i32,
        height: i32,
    ) -> GlPipResult<()> {
        let gl = &self.gl;
        unsafe {
            match source {
                CaptureSource::SharedTexture(texture) => {
                    gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(self.read_fbo));
                    gl.framebuffer_texture_2d(
                        glow::READ_FRAMEBUFFER,
                        glow::COLOR_ATTACHMENT0,
                        glow::TEXTURE_2D,
                        texture_from_raw(texture),
                        0,
                    );
                }
                CaptureSource::Framebuffer => {
                    gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
                }
            }
            gl.bind_framebuffer(
                glow::DRAW_FRAMEBUFFER,
                framebuffer_from_raw(target.framebuffer),
            );
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
            if let CaptureSource::SharedTexture(_) = source {
                gl.framebuffer_texture_2d(
                    glow::READ_FRAMEBUFFER,
                    glow::COLOR_ATTACHMENT0,
                    glow::TEXTURE_2D,
                    None,
                    0,
                );
            }
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, None);
        }
        Ok(())
    }
}

impl Drop for GlMirrorBlitter {
    fn drop(&mut self) {
        unsafe {
            self.gl.delete_framebuffer(self.read_fbo);
        }
    }
}

/// Background capture worker serving the shared-texture path.
///
/// Framebuffer-fallback frames never reach this thread; the host thread
/// runs [`mirror_host_frame`] for those instead.
pub struct CaptureWorker {
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub fn spawn<T, B, F>(
        runtime: Arc<SharedRuntimeState>,
        mirrors: Arc<MirrorSet>,
        queue: Arc<CaptureQueue>,
        init: F,
    ) -> GlPipResult<Self>
    where
        T: GpuTimeline + 'static,
        B: MirrorBlitter + 'static,
        F: FnOnce(&MirrorSet) -> GlPipResult<(T, B)> + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name("glpip-capture".to_string())
            .spawn(move || {
                let (timeline, mut blitter) = match init(&mirrors) {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::error!("[CaptureWorker] init failed, mirrors disabled: {err}");
                        return;
                    }
                };
                log::info!("[CaptureWorker] started");
                while !runtime.shutdown_requested() {
                    if !queue.wait_timeout(IDLE_POLL) {
                        continue;
                    }
                    let Some(request) = queue.take() else {
                        continue;
                    };
                    if matches!(request.source, CaptureSource::Framebuffer) {
                        continue;
                    }
                    for output in mirrors.due_outputs(Instant::now()) {
                        let (side, target) = output.acquire_back(&timeline);
                        match blitter.blit(request.source, target, request.width, request.height)
                        {
                            Ok(()) => output.publish(&timeline, side),
                            Err(err) => log::error!("[CaptureWorker] blit failed: {err}"),
                        }
                    }
                }
                log::info!("[CaptureWorker] stopped");
            })
            .map_err(|err| GlPipError::Other(format!("spawn capture worker: {err}")))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[CaptureWorker] worker thread panicked");
            }
        }
    }
}

/// Host-thread capture for the framebuffer fallback path: blit the default
/// framebuffer into every due mirror and publish. Returns how many mirrors
/// were updated.
pub fn mirror_host_frame<T: GpuTimeline, B: MirrorBlitter>(
    timeline: &T,
    blitter: &mut B,
    mirrors: &MirrorSet,
    width: i32,
    height: i32,
    now: Instant,
) -> usize {
    let mut updated = 0;
    for output in mirrors.due_outputs(now) {
        let (side, target) = output.acquire_back(timeline);
        match blitter.blit(CaptureSource::Framebuffer, target, width, height) {
            Ok(()) => {
                output.publish(timeline, side);
                updated += 1;
            }
            Err(err) => log::error!("[Capture] fallback blit failed: {err}"),
        }
    }
    updated
}
