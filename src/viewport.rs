//! Viewport interception and coordinate translation.
//!
//! Decides, for every native "set output rectangle" call the host makes,
//! whether to pass it through untouched or substitute the animated virtual
//! rectangle, and answers the inverse question for pointer input: which
//! virtual-mode coordinate a native-space point corresponds to.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ConfigStore, ModeConfig, Placement};
use crate::geometry::{RectF, RectI};
use crate::runtime::SharedRuntimeState;
use crate::snapshot::Snapshot;
use crate::transition::ModeTransitionState;

/// Size slack when matching an intercepted call against the expected or
/// last-accepted viewport, covering transition in-betweens.
const SIZE_TOLERANCE_PX: i32 = 8;

/// One intercepted native viewport call, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportCall {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Outcome of [`ViewportCompositor::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportDecision {
    /// Forward the host's own arguments unmodified.
    PassThrough,
    /// Substitute this rectangle, already in the graphics API's
    /// bottom-left-origin convention.
    Substitute(RectI),
}

/// Currently active mapping between the host's native render-target size
/// and the virtual output rectangle (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GameViewportGeometry {
    pub native_w: i32,
    pub native_h: i32,
    pub virtual_x: f32,
    pub virtual_y: f32,
    pub virtual_w: f32,
    pub virtual_h: f32,
}

/// Steady-state placed rectangle for a mode inside a native output of the
/// given size.
pub fn steady_rect(mode: &ModeConfig, native_w: i32, native_h: i32) -> RectF {
    match mode.placement {
        Placement::Stretch(rect) => rect.to_f32(),
        Placement::Letterbox => {
            let vr = mode.virtual_rect;
            RectF {
                x: ((native_w - vr.w) / 2) as f32,
                y: ((native_h - vr.h) / 2) as f32,
                w: vr.w as f32,
                h: vr.h as f32,
            }
        }
    }
}

/// Substitutes the animated virtual geometry for the host's native viewport
/// and translates pointer coordinates between the two spaces.
///
/// `decide` is called once per frame by the main thread; the geometry
/// snapshot is read lock-free by input hit-testing on other threads.
pub struct ViewportCompositor {
    runtime: Arc<SharedRuntimeState>,
    config: Arc<ConfigStore>,
    transition: Arc<Snapshot<ModeTransitionState>>,
    geometry: Snapshot<GameViewportGeometry>,
    /// Size of the last call we substituted; written only by `decide`.
    last_accepted: Mutex<Option<(i32, i32)>>,
}

impl ViewportCompositor {
    pub fn new(
        runtime: Arc<SharedRuntimeState>,
        config: Arc<ConfigStore>,
        transition: Arc<Snapshot<ModeTransitionState>>,
    ) -> Self {
        Self {
            runtime,
            config,
            transition,
            geometry: Snapshot::new(GameViewportGeometry::default()),
            last_accepted: Mutex::new(None),
        }
    }

    /// The currently active native/virtual mapping.
    pub fn geometry(&self) -> GameViewportGeometry {
        self.geometry.read()
    }

    /// Decide whether to substitute the animated virtual rectangle for one
    /// intercepted viewport call. Completely inert unless a virtual mode is
    /// active; over-eager substitution is worse than a missed one, so every
    /// mismatch silently passes through.
    pub fn decide(&self, call: ViewportCall) -> ViewportDecision {
        if !self.runtime.virtual_mode_active() {
            return ViewportDecision::PassThrough;
        }

        let snapshot = self.config.load();
        let Some(mode) = snapshot.mode(self.runtime.current_mode()) else {
            return ViewportDecision::PassThrough;
        };

        // The presentation viewport is always set at the origin; anything
        // else is some other subsystem resizing an incidental target.
        if call.x != 0 || call.y != 0 {
            return ViewportDecision::PassThrough;
        }

        let expected = (mode.native_width as i32, mode.native_height as i32);
        let last = *self.last_accepted.lock();
        let matches_expected = size_matches((call.w, call.h), expected);
        let matches_last = last
            .map(|prev| size_matches((call.w, call.h), prev))
            .unwrap_or(false);
        if !matches_expected && !matches_last {
            return ViewportDecision::PassThrough;
        }
        *self.last_accepted.lock() = Some((call.w, call.h));

        // Animated geometry while a transition runs, the placed
        // steady-state rectangle otherwise. Input translation reads the
        // same sources, so pointer mapping never lags the drawn frame.
        let state = self.transition.read();
        let rect = if state.active {
            state.current
        } else {
            steady_rect(mode, call.w, call.h)
        };

        self.geometry.publish(GameViewportGeometry {
            native_w: call.w,
            native_h: call.h,
            virtual_x: rect.x,
            virtual_y: rect.y,
            virtual_w: rect.w,
            virtual_h: rect.h,
        });

        // Host coordinates are top-left origin; the GL viewport wants
        // bottom-left.
        let flipped = RectF {
            y: call.h as f32 - (rect.y + rect.h),
            ..rect
        };
        ViewportDecision::Substitute(flipped.round())
    }

    /// Live virtual rectangle, shared by substitution and translation.
    fn live_rect(&self) -> (GameViewportGeometry, RectF) {
        let geometry = self.geometry.read();
        let state = self.transition.read();
        let rect = if state.active {
            state.current
        } else {
            RectF {
                x: geometry.virtual_x,
                y: geometry.virtual_y,
                w: geometry.virtual_w,
                h: geometry.virtual_h,
            }
        };
        (geometry, rect)
    }

    /// Translate a native-space pointer coordinate into virtual-mode
    /// content coordinates. Returns `None` while no mapping is active.
    pub fn native_to_virtual(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let (geometry, rect) = self.live_rect();
        if rect.w <= 0.0 || rect.h <= 0.0 || geometry.native_w == 0 {
            return None;
        }
        Some((
            (x - rect.x) * geometry.native_w as f32 / rect.w,
            (y - rect.y) * geometry.native_h as f32 / rect.h,
        ))
    }

    /// Inverse of [`ViewportCompositor::native_to_virtual`].
    pub fn virtual_to_native(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let (geometry, rect) = self.live_rect();
        if geometry.native_w == 0 || geometry.native_h == 0 {
            return None;
        }
        Some((
            x * rect.w / geometry.native_w as f32 + rect.x,
            y * rect.h / geometry.native_h as f32 + rect.y,
        ))
    }
}

fn size_matches(call: (i32, i32), expected: (i32, i32)) -> bool {
    (call.0 - expected.0).abs() <= SIZE_TOLERANCE_PX
        && (call.1 - expected.1).abs() <= SIZE_TOLERANCE_PX
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_mode, ConfigSnapshot, ModeId};

    fn compositor_with_mode() -> (ViewportCompositor, Arc<SharedRuntimeState>, ModeId) {
        let runtime = Arc::new(SharedRuntimeState::new());
        let snapshot = ConfigSnapshot::default().with_mode(test_mode(
            "pip",
            (1920, 1080),
            RectI::new(0, 0, 960, 540),
        ));
        let id = snapshot.resolve("pip").unwrap();
        let config = Arc::new(ConfigStore::new(snapshot));
        let transition = Arc::new(Snapshot::new(ModeTransitionState::default()));
        let compositor =
            ViewportCompositor::new(Arc::clone(&runtime), config, Arc::clone(&transition));
        (compositor, runtime, id)
    }

    const MAIN_CALL: ViewportCall = ViewportCall {
        x: 0,
        y: 0,
        w: 1920,
        h: 1080,
    };

    #[test]
    fn test_inert_without_virtual_mode() {
        let (compositor, _runtime, _id) = compositor_with_mode();
        assert_eq!(compositor.decide(MAIN_CALL), ViewportDecision::PassThrough);
    }

    #[test]
    fn test_rejects_non_origin_calls() {
        let (compositor, runtime, id) = compositor_with_mode();
        runtime.set_current_mode(id);
        let call = ViewportCall {
            x: 16,
            y: 0,
            w: 1920,
            h: 1080,
        };
        assert_eq!(compositor.decide(call), ViewportDecision::PassThrough);
    }

    #[test]
    fn test_rejects_unrelated_sizes() {
        let (compositor, runtime, id) = compositor_with_mode();
        runtime.set_current_mode(id);
        // A shadow-map sized target must never be mistaken for the
        // presentation viewport.
        let call = ViewportCall {
            x: 0,
            y: 0,
            w: 512,
            h: 512,
        };
        assert_eq!(compositor.decide(call), ViewportDecision::PassThrough);
    }

    #[test]
    fn test_substitutes_letterboxed_rect_with_y_flip() {
        let (compositor, runtime, id) = compositor_with_mode();
        runtime.set_current_mode(id);

        let decision = compositor.decide(MAIN_CALL);
        // 960x540 centered in 1920x1080: top-left (480, 270); bottom-left
        // origin flips y to 1080 - (270 + 540) = 270.
        assert_eq!(
            decision,
            ViewportDecision::Substitute(RectI::new(480, 270, 960, 540))
        );

        let geometry = compositor.geometry();
        assert_eq!(geometry.native_w, 1920);
        assert_eq!(geometry.virtual_x, 480.0);
        assert_eq!(geometry.virtual_y, 270.0);
    }

    #[test]
    fn test_last_accepted_size_tolerated() {
        let (compositor, runtime, id) = compositor_with_mode();
        runtime.set_current_mode(id);
        assert!(matches!(
            compositor.decide(MAIN_CALL),
            ViewportDecision::Substitute(_)
        ));
        // Slightly off the native size but close to the last accepted one.
        let near = ViewportCall {
            x: 0,
            y: 0,
            w: 1916,
            h: 1076,
        };
        assert!(matches!(
            compositor.decide(near),
            ViewportDecision::Substitute(_)
        ));
    }

    #[test]
    fn test_animated_rect_wins_during_transition() {
        let (compositor, runtime, id) = compositor_with_mode();
        runtime.set_current_mode(id);

        let mut state = ModeTransitionState::default();
        state.active = true;
        state.current = RectF::new(100.0, 50.0, 400.0, 300.0);
        compositor.transition.publish(state);

        let decision = compositor.decide(MAIN_CALL);
        assert_eq!(
            decision,
            ViewportDecision::Substitute(RectI::new(100, 1080 - 350, 400, 300))
        );
    }

    #[test]
    fn test_coordinate_round_trip() {
        let (compositor, runtime, id) = compositor_with_mode();
        runtime.set_current_mode(id);
        compositor.decide(MAIN_CALL);

        let (vx, vy) = compositor.native_to_virtual(500.0, 300.0).unwrap();
        let (nx, ny) = compositor.virtual_to_native(vx, vy).unwrap();
        assert!((nx - 500.0).abs() < 1e-3, "x round trip drifted: {}", nx);
        assert!((ny - 300.0).abs() < 1e-3, "y round trip drifted: {}", ny);
    }

    #[test]
    fn test_translation_tracks_animation_source() {
        let (compositor, runtime, id) = compositor_with_mode();
        runtime.set_current_mode(id);
        compositor.decide(MAIN_CALL);

        // Publish an animated rect; translation must follow it immediately,
        // not the steady-state geometry of the last frame.
        let mut state = ModeTransitionState::default();
        state.active = true;
        state.current = RectF::new(0.0, 0.0, 1920.0, 1080.0);
        compositor.transition.publish(state);

        let (vx, vy) = compositor.native_to_virtual(960.0, 540.0).unwrap();
        assert!((vx - 960.0).abs() < 1e-3);
        assert!((vy - 540.0).abs() < 1e-3);
    }

    #[test]
    fn test_translation_none_without_mapping() {
        let (compositor, _runtime, _id) = compositor_with_mode();
        assert!(compositor.native_to_virtual(10.0, 10.0).is_none());
    }
}
