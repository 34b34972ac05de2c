//! GPU picture-in-picture compositing for hooked 3D host applications.
//!
//! The crate virtualizes a host's presentation output: intercepted viewport
//! calls are redirected into an animated virtual rectangle, a background
//! worker composes overlay frames on its own shared GL context, mirror
//! outputs feed downstream capture adapters, and every cross-thread GPU
//! handoff is ordered with fences instead of CPU waits.
//!
//! [`PipEngine`] is the facade the interception layer talks to; everything
//! underneath is reachable for embedders that need finer control.

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod pipeline;
pub mod runtime;
pub mod snapshot;
pub mod store;
pub mod transition;
pub mod viewport;
pub mod watchdog;

pub use capture::{CaptureSource, MirrorOutput, MirrorSet};
pub use config::{
    ConfigCommand, ConfigCommandSender, ConfigSnapshot, ConfigStore, ModeConfig, ModeId,
    Placement, TransitionStyle,
};
pub use engine::PipEngine;
pub use error::{GlPipError, GlPipResult};
pub use geometry::{RectF, RectI};
pub use gpu::{GlTimeline, GpuTimeline, HostContext, PixelFormat, WorkerGpu};
pub use pipeline::{OverlayCategory, OverlayElement, OverlayFlags, OverlayRegistry};
pub use runtime::SharedRuntimeState;
pub use store::{CompletedRenderFrame, FrameStore};
pub use transition::{GeometryKind, ModeTransitionState, TransitionEngine, TransitionKind};
pub use viewport::{ViewportCall, ViewportCompositor, ViewportDecision};
