//! Mode-transition animation engine.
//!
//! A deterministic, time-driven state machine (Idle → Active → Idle) that
//! computes the animated virtual output rectangle every tick and publishes
//! it as an immutable [`ModeTransitionState`] snapshot. Up to three threads
//! (viewport interception, compositor, UI) read the snapshot concurrently
//! without locks.

pub mod ease;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::{AxisSkip, BounceParams, ModeId, TransitionStyle};
use crate::geometry::RectF;
use crate::snapshot::Snapshot;

/// How a non-geometry aspect (content, overlay layer, background layer)
/// changes over during a mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    Cut,
    Animated,
}

/// How the virtual output rectangle moves during a mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryKind {
    Cut,
    Ease,
    Bounce,
}

/// Minimum duration of a transition whose every aspect is `Cut`.
///
/// Guarantees at least one frame of the old content frozen on screen before
/// the new content's first frame is ready, so a slow mode switch never shows
/// a blank flash.
pub const MIN_CUT_DURATION: Duration = Duration::from_millis(50);

/// Immutable snapshot of the animation state, published every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeTransitionState {
    pub active: bool,
    /// Overall elapsed fraction of the transition, including bounces.
    pub progress: f32,
    /// Eased fraction of the geometry move, bounce phase pinned to 1.
    pub move_progress: f32,
    /// Relative overshoot applied on top of the finished move.
    pub bounce_offset: f32,
    pub current: RectF,
    pub from: RectF,
    pub to: RectF,
    pub from_mode: ModeId,
    pub to_mode: ModeId,
    pub content: TransitionKind,
    pub overlay: TransitionKind,
    pub background: TransitionKind,
    pub geometry: GeometryKind,
    pub ease_in_pow: f32,
    pub ease_out_pow: f32,
    pub bounce: BounceParams,
    pub skip: AxisSkip,
}

impl Default for ModeTransitionState {
    fn default() -> Self {
        Self {
            active: false,
            progress: 1.0,
            move_progress: 1.0,
            bounce_offset: 0.0,
            current: RectF::default(),
            from: RectF::default(),
            to: RectF::default(),
            from_mode: ModeId::NONE,
            to_mode: ModeId::NONE,
            content: TransitionKind::Cut,
            overlay: TransitionKind::Cut,
            background: TransitionKind::Cut,
            geometry: GeometryKind::Cut,
            ease_in_pow: 1.0,
            ease_out_pow: 1.0,
            bounce: BounceParams::default(),
            skip: AxisSkip::default(),
        }
    }
}

struct ActiveTransition {
    started: Instant,
    style: TransitionStyle,
    from: RectF,
    to: RectF,
    from_mode: ModeId,
    to_mode: ModeId,
    base: Duration,
    total: Duration,
}

/// The animation state machine. Ticked by exactly one thread; everyone else
/// reads through [`TransitionEngine::snapshot`].
pub struct TransitionEngine {
    snapshot: Arc<Snapshot<ModeTransitionState>>,
    active: Option<ActiveTransition>,
}

impl Default for TransitionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionEngine {
    pub fn new() -> Self {
        Self {
            snapshot: Arc::new(Snapshot::new(ModeTransitionState::default())),
            active: None,
        }
    }

    /// Shared read handle for the compositor, viewport interception and UI.
    pub fn snapshot(&self) -> Arc<Snapshot<ModeTransitionState>> {
        Arc::clone(&self.snapshot)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Begin a transition at `now`. Replaces any transition in flight.
    pub fn start(
        &mut self,
        from_mode: ModeId,
        to_mode: ModeId,
        from: RectF,
        to: RectF,
        style: TransitionStyle,
        now: Instant,
    ) {
        let base = Duration::from_millis(style.duration_ms);
        let mut total = match style.geometry {
            GeometryKind::Bounce => {
                base + Duration::from_millis(
                    u64::from(style.bounce.count) * style.bounce.duration_ms,
                )
            }
            GeometryKind::Cut | GeometryKind::Ease => base,
        };

        let all_cut = style.content == TransitionKind::Cut
            && style.overlay == TransitionKind::Cut
            && style.background == TransitionKind::Cut
            && style.geometry == GeometryKind::Cut;
        if all_cut {
            total = total.max(MIN_CUT_DURATION);
        }

        log::debug!(
            "[Transition] start {:?} -> {:?}, total {:?}",
            from_mode,
            to_mode,
            total
        );

        self.active = Some(ActiveTransition {
            started: now,
            style,
            from,
            to,
            from_mode,
            to_mode,
            base,
            total,
        });
        let state = self.compute(now);
        self.snapshot.publish(state);
    }

    /// Advance the state machine to `now` and publish the new snapshot.
    pub fn tick(&mut self, now: Instant) -> ModeTransitionState {
        let Some(active) = &self.active else {
            return self.snapshot.read();
        };

        let finished = now.duration_since(active.started) >= active.total;
        let state = self.compute(now);
        self.snapshot.publish(state);
        if finished {
            self.active = None;
        }
        state
    }

    fn compute(&self, now: Instant) -> ModeTransitionState {
        let active = self.active.as_ref().expect("compute without transition");
        let elapsed = now.duration_since(active.started);
        let style = &active.style;

        let progress = fraction(elapsed, active.total);
        let finished = progress >= 1.0;

        let (move_progress, bounce_offset) = match style.geometry {
            GeometryKind::Cut => (1.0, 0.0),
            GeometryKind::Ease => (
                ease::ease_in_out_pow(
                    fraction(elapsed, active.base),
                    style.ease_in_pow,
                    style.ease_out_pow,
                ),
                0.0,
            ),
            GeometryKind::Bounce => {
                if elapsed < active.base {
                    (
                        ease::ease_in_out_pow(
                            fraction(elapsed, active.base),
                            style.ease_in_pow,
                            style.ease_out_pow,
                        ),
                        0.0,
                    )
                } else if finished || style.bounce.count == 0 {
                    (1.0, 0.0)
                } else {
                    let bounce_len = Duration::from_millis(style.bounce.duration_ms.max(1));
                    let into = elapsed - active.base;
                    let index = ((into.as_nanos() / bounce_len.as_nanos()) as u32)
                        .min(style.bounce.count - 1);
                    let phase_start = bounce_len * index;
                    let phase = fraction(into - phase_start, bounce_len);
                    (
                        1.0,
                        ease::bounce_offset(
                            phase,
                            index,
                            style.bounce.count,
                            style.bounce.intensity,
                        ),
                    )
                }
            }
        };

        let current = if finished {
            // Pin exactly to the target; no residual float drift.
            active.to
        } else {
            interpolate(
                active.from,
                active.to,
                move_progress,
                bounce_offset,
                style.skip,
            )
        };

        ModeTransitionState {
            active: !finished,
            progress,
            move_progress: if finished { 1.0 } else { move_progress },
            bounce_offset: if finished { 0.0 } else { bounce_offset },
            current,
            from: active.from,
            to: active.to,
            from_mode: active.from_mode,
            to_mode: active.to_mode,
            content: style.content,
            overlay: style.overlay,
            background: style.background,
            geometry: style.geometry,
            ease_in_pow: style.ease_in_pow,
            ease_out_pow: style.ease_out_pow,
            bounce: style.bounce,
            skip: style.skip,
        }
    }
}

fn fraction(elapsed: Duration, total: Duration) -> f32 {
    if total.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0) as f32
}

/// Per-axis interpolation with bounce overshoot; skipped axes stay pinned
/// to their final value for the whole transition.
fn interpolate(from: RectF, to: RectF, t: f32, bounce: f32, skip: AxisSkip) -> RectF {
    let axis = |from: f32, to: f32, skipped: bool| -> f32 {
        if skipped {
            to
        } else {
            from + (to - from) * t + (to - from) * bounce
        }
    };
    RectF {
        x: axis(from.x, to.x, skip.x),
        y: axis(from.y, to.y, skip.y),
        w: axis(from.w, to.w, skip.w),
        h: axis(from.h, to.h, skip.h),
    }
}
