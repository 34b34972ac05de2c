//! Shared GL context bootstrap and host-context replacement detection.
//!
//! Each worker thread gets its own surfman context bound to a small
//! dedicated offscreen surface (never the host's drawable), created in the
//! host context's share group so textures are valid on both sides. Sharing
//! is verified with a 1×1 probe texture before the worker is allowed to run;
//! object identity needs no further synchronization afterwards, contents
//! are ordered with fences (`gpu::timeline`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use euclid::default::Size2D;
use glow::HasContext;
use surfman::{
    Connection, Context, ContextAttributeFlags, ContextAttributes, Device, GLVersion,
    SurfaceAccess, SurfaceType,
};

use crate::error::{GlPipError, GlPipResult};

/// Surface format of the host's drawable. Worker surfaces must match it
/// exactly; mismatched formats are a classic cause of sharing that
/// "succeeds" but samples garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub alpha: bool,
    pub depth: bool,
    pub stencil: bool,
}

impl PixelFormat {
    fn attribute_flags(self) -> ContextAttributeFlags {
        let mut flags = ContextAttributeFlags::empty();
        if self.alpha {
            flags |= ContextAttributeFlags::ALPHA;
        }
        if self.depth {
            flags |= ContextAttributeFlags::DEPTH;
        }
        if self.stencil {
            flags |= ContextAttributeFlags::STENCIL;
        }
        flags
    }
}

/// The host application's live GL context, supplied by the interception
/// layer. Everything platform-specific (wrapping the foreign context for
/// surfman, proc lookup) stays behind this seam.
pub trait HostContext: Send + Sync {
    /// Identity of the underlying native context, for replacement detection.
    fn raw_id(&self) -> u64;

    /// Make the host context current on the calling thread.
    fn make_current(&self) -> bool;

    fn pixel_format(&self) -> PixelFormat;

    fn gl_proc_address(&self, name: &str) -> *const core::ffi::c_void;

    /// Wrap the host's native context as a surfman context on `device` so
    /// worker contexts can be created in its share group.
    fn to_surfman(&self, device: &mut Device) -> GlPipResult<Context>;
}

/// Offscreen worker surfaces never need to be larger than this; they exist
/// only because a context must own a drawable, all real rendering goes to
/// FBOs.
const WORKER_SURFACE_SIZE: i32 = 4;

/// One worker's share-group context plus its GL function table.
///
/// Not `Send`: lives and dies on the thread that created it.
pub struct WorkerGpu {
    device: Device,
    context: Context,
    gl: Arc<glow::Context>,
}

impl WorkerGpu {
    /// Create a context sharing GPU objects with `host`, bound to a
    /// dedicated invisible surface. Must run on the worker thread itself.
    pub fn new(host: &dyn HostContext) -> GlPipResult<Self> {
        let connection = Connection::new()
            .map_err(|err| GlPipError::ContextCreation(format!("connection: {err:?}")))?;
        let adapter = connection
            .create_adapter()
            .map_err(|err| GlPipError::ContextCreation(format!("adapter: {err:?}")))?;
        let mut device = connection
            .create_device(&adapter)
            .map_err(|err| GlPipError::ContextCreation(format!("device: {err:?}")))?;

        let host_context = host.to_surfman(&mut device)?;

        // Explicit-version creation first, legacy descriptor-of-the-host
        // fallback second.
        let attributes = ContextAttributes {
            version: GLVersion::new(3, 3),
            flags: host.pixel_format().attribute_flags(),
        };
        let context = match device
            .create_context_descriptor(&attributes)
            .and_then(|descriptor| device.create_context(&descriptor, Some(&host_context)))
        {
            Ok(context) => context,
            Err(err) => {
                log::info!(
                    "[Bootstrap] versioned context creation failed ({err:?}), trying legacy share path"
                );
                let legacy = device.context_descriptor(&host_context);
                device
                    .create_context(&legacy, Some(&host_context))
                    .map_err(|err| GlPipError::ContextCreation(format!("legacy share: {err:?}")))?
            }
        };
        let mut worker = Self::finish(device, context)?;
        worker.verify_sharing(host)?;
        Ok(worker)
    }

    fn finish(device: Device, mut context: Context) -> GlPipResult<Self> {
        let surface = device
            .create_surface(
                &context,
                SurfaceAccess::GPUOnly,
                SurfaceType::Generic {
                    size: Size2D::new(WORKER_SURFACE_SIZE, WORKER_SURFACE_SIZE),
                },
            )
            .map_err(|err| GlPipError::SurfaceCreation(format!("{err:?}")))?;
        device
            .bind_surface_to_context(&mut context, surface)
            .map_err(|(err, _)| GlPipError::SurfaceCreation(format!("bind: {err:?}")))?;
        device
            .make_context_current(&context)
            .map_err(|err| GlPipError::ContextCreation(format!("make current: {err:?}")))?;

        let gl = unsafe {
            glow::Context::from_loader_function(|name| device.get_proc_address(&context, name))
        };
        Ok(Self {
            device,
            context,
            gl: Arc::new(gl),
        })
    }

    /// Prove that objects created here are visible from the host context.
    /// A failed probe aborts bootstrap so callers fall back to the CPU blit
    /// path instead of running with silently broken sharing.
    fn verify_sharing(&mut self, host: &dyn HostContext) -> GlPipResult<()> {
        self.make_current()?;
        let probe = unsafe { self.gl.create_texture() }
            .map_err(|err| GlPipError::ShareVerification(format!("probe texture: {err}")))?;
        unsafe {
            self.gl.bind_texture(glow::TEXTURE_2D, Some(probe));
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA as i32,
                1,
                1,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(None),
            );
            self.gl.bind_texture(glow::TEXTURE_2D, None);
            self.gl.flush();
        }

        if !host.make_current() {
            return Err(GlPipError::ShareVerification(
                "host context not current".to_string(),
            ));
        }
        let host_gl = unsafe {
            glow::Context::from_loader_function(|name| host.gl_proc_address(name))
        };
        let visible = unsafe { host_gl.is_texture(probe) };

        self.make_current()?;
        unsafe {
            self.gl.delete_texture(probe);
        }

        if visible {
            log::info!("[Bootstrap] share verification ok (context {:#x})", host.raw_id());
            Ok(())
        } else {
            Err(GlPipError::ShareVerification(
                "probe texture not visible from host context".to_string(),
            ))
        }
    }

    pub fn make_current(&self) -> GlPipResult<()> {
        self.device
            .make_context_current(&self.context)
            .map_err(|err| GlPipError::ContextCreation(format!("make current: {err:?}")))
    }

    pub fn gl(&self) -> Arc<glow::Context> {
        Arc::clone(&self.gl)
    }
}

impl Drop for WorkerGpu {
    fn drop(&mut self) {
        // CPU-side teardown only; on abrupt host exit the driver reclaims
        // the GPU objects themselves.
        let _ = self.device.destroy_context(&mut self.context);
    }
}

/// Debounced detector for the host swapping its underlying GL context
/// (some drivers and third-party overlays do this transiently).
///
/// A replacement triggers a rebuild only after the new context has stayed
/// stable for `dwell`, and rebuilds are rate-limited to one per
/// `min_rebuild_interval` so jitter cannot cause restart storms.
#[derive(Debug)]
pub struct ContextWatch {
    current: u64,
    candidate: Option<(u64, Instant)>,
    last_rebuild: Option<Instant>,
    dwell: Duration,
    min_rebuild_interval: Duration,
}

/// Outcome of one watchdog observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchVerdict {
    /// Same context as before (or a transient flicker that went away).
    Stable,
    /// A different context was seen but has not dwelt long enough yet.
    Pending,
    /// The replacement is real; tear down and rebuild shared state.
    Rebuild(u64),
}

impl ContextWatch {
    pub fn new(initial: u64, dwell: Duration, min_rebuild_interval: Duration) -> Self {
        Self {
            current: initial,
            candidate: None,
            last_rebuild: None,
            dwell,
            min_rebuild_interval,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn observe(&mut self, context: u64, now: Instant) -> WatchVerdict {
        if context == self.current {
            self.candidate = None;
            return WatchVerdict::Stable;
        }

        let since = match self.candidate {
            Some((candidate, since)) if candidate == context => since,
            _ => {
                self.candidate = Some((context, now));
                return WatchVerdict::Pending;
            }
        };

        if now.duration_since(since) < self.dwell {
            return WatchVerdict::Pending;
        }
        if let Some(last) = self.last_rebuild {
            if now.duration_since(last) < self.min_rebuild_interval {
                return WatchVerdict::Pending;
            }
        }

        log::warn!(
            "[Bootstrap] host context changed {:#x} -> {:#x}, rebuilding shared state",
            self.current,
            context
        );
        self.current = context;
        self.candidate = None;
        self.last_rebuild = Some(now);
        WatchVerdict::Rebuild(context)
    }
}
