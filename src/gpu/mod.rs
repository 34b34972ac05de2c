//! GPU infrastructure: the fence timeline seam and the shared-context
//! bootstrap.

use std::num::NonZeroU32;

pub mod context;
pub mod timeline;

pub use context::{ContextWatch, HostContext, PixelFormat, WatchVerdict, WorkerGpu};
pub use timeline::{GlTimeline, GpuTimeline, RawFence};

/// Wrap a raw GL framebuffer name; 0 maps to the default framebuffer.
pub(crate) fn framebuffer_from_raw(raw: u32) -> Option<glow::NativeFramebuffer> {
    NonZeroU32::new(raw).map(glow::NativeFramebuffer)
}

/// Wrap a raw GL texture name; 0 maps to "no texture".
pub(crate) fn texture_from_raw(raw: u32) -> Option<glow::NativeTexture> {
    NonZeroU32::new(raw).map(glow::NativeTexture)
}
