//! Configuration snapshots and the single-writer mutation queue.
//!
//! The core never edits configuration in place. Readers take an immutable
//! `Arc<ConfigSnapshot>` (RCU style: whole-object replacement, no locks held
//! across use). All mutations — including drag/resize deltas arriving from
//! the render path — are posted as [`ConfigCommand`] values on a channel and
//! applied only by the thread that owns the snapshot's source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::geometry::RectI;
use crate::transition::{GeometryKind, TransitionKind};

/// Interned mode identifier, usable inside `Copy` lock-free snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModeId(u32);

impl ModeId {
    /// Sentinel for "no virtual mode active".
    pub const NONE: ModeId = ModeId(0);

    pub fn from_raw(raw: u32) -> Self {
        ModeId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// How the virtual rectangle is placed inside the host's native output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Center the fixed-aspect virtual rectangle inside the native output.
    Letterbox,
    /// Fill an explicitly configured rectangle.
    Stretch(RectI),
}

/// Background styling for the letterbox/border area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundStyle {
    pub color: [f32; 4],
}

impl Default for BackgroundStyle {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Border styling drawn around the virtual rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BorderStyle {
    pub enabled: bool,
    pub width_px: i32,
    pub color: [f32; 4],
}

impl Default for BorderStyle {
    fn default() -> Self {
        Self {
            enabled: false,
            width_px: 2,
            color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// Per-axis flags pinning an axis to its final value for the whole
/// transition (used when only one axis should visibly move).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisSkip {
    pub x: bool,
    pub y: bool,
    pub w: bool,
    pub h: bool,
}

/// Bounce parameters for the `Bounce` geometry kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BounceParams {
    /// Number of bounces after the base move completes.
    pub count: u32,
    /// Duration of one bounce, milliseconds.
    pub duration_ms: u64,
    /// Relative overshoot amplitude of the first bounce.
    pub intensity: f32,
}

impl Default for BounceParams {
    fn default() -> Self {
        Self {
            count: 2,
            duration_ms: 120,
            intensity: 0.04,
        }
    }
}

/// Transition selection and timing for one mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransitionStyle {
    pub content: TransitionKind,
    pub overlay: TransitionKind,
    pub background: TransitionKind,
    pub geometry: GeometryKind,
    /// Base move duration, milliseconds.
    pub duration_ms: u64,
    pub ease_in_pow: f32,
    pub ease_out_pow: f32,
    pub bounce: BounceParams,
    pub skip: AxisSkip,
}

impl Default for TransitionStyle {
    fn default() -> Self {
        Self {
            content: TransitionKind::Animated,
            overlay: TransitionKind::Animated,
            background: TransitionKind::Animated,
            geometry: GeometryKind::Ease,
            duration_ms: 250,
            ease_in_pow: 2.0,
            ease_out_pow: 2.0,
            bounce: BounceParams::default(),
            skip: AxisSkip::default(),
        }
    }
}

/// Complete configuration of one virtual mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub name: String,
    /// Size of the host's native render target while this mode is active.
    pub native_width: u32,
    pub native_height: u32,
    /// Steady-state virtual output rectangle in native coordinates.
    pub virtual_rect: RectI,
    pub placement: Placement,
    pub background: BackgroundStyle,
    pub border: BorderStyle,
    pub transition: TransitionStyle,
}

/// Immutable, versioned configuration snapshot.
///
/// Replaced wholesale on every change; never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    version: u64,
    modes: HashMap<ModeId, ModeConfig>,
    names: HashMap<String, ModeId>,
    next_id: u32,
}

impl ConfigSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn mode(&self, id: ModeId) -> Option<&ModeConfig> {
        self.modes.get(&id)
    }

    /// Resolve a string identifier from the input subsystem to a mode id.
    pub fn resolve(&self, name: &str) -> Option<ModeId> {
        self.names.get(name).copied()
    }

    /// Return a copy with `mode` inserted (or replaced by name), version
    /// bumped. Ids are stable across versions for surviving modes.
    pub fn with_mode(&self, mode: ModeConfig) -> ConfigSnapshot {
        let mut next = self.clone();
        let id = match next.names.get(&mode.name) {
            Some(id) => *id,
            None => {
                next.next_id += 1;
                let id = ModeId(next.next_id);
                next.names.insert(mode.name.clone(), id);
                id
            }
        };
        next.modes.insert(id, mode);
        next.version += 1;
        next
    }

    fn with_edit(&self, id: ModeId, edit: impl FnOnce(&mut ModeConfig)) -> ConfigSnapshot {
        let mut next = self.clone();
        if let Some(mode) = next.modes.get_mut(&id) {
            edit(mode);
            next.version += 1;
        }
        next
    }
}

/// RCU-style holder for the live configuration snapshot.
///
/// `load` hands out the current `Arc` (cheap clone); `store` swaps the whole
/// snapshot. Readers never hold the lock across use of the snapshot.
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigStore {
    pub fn new(initial: ConfigSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn store(&self, next: ConfigSnapshot) {
        *self.current.write() = Arc::new(next);
    }
}

/// Mutation requests posted by the render/input threads.
///
/// The render thread never applies a change itself; it only requests one.
#[derive(Debug, Clone)]
pub enum ConfigCommand {
    /// Replace or insert a whole mode definition.
    UpsertMode(ModeConfig),
    /// Drag delta for a mode's virtual rectangle, native pixels.
    NudgeVirtualRect { mode: ModeId, dx: i32, dy: i32 },
    /// Resize delta for a mode's virtual rectangle, native pixels.
    ResizeVirtualRect { mode: ModeId, dw: i32, dh: i32 },
}

/// Cloneable sender half handed to the render and input threads.
#[derive(Debug, Clone)]
pub struct ConfigCommandSender {
    tx: Sender<ConfigCommand>,
}

impl ConfigCommandSender {
    pub fn send(&self, command: ConfigCommand) {
        // A full/disconnected queue means the owner is gone; dropping the
        // request is the defined fallback.
        let _ = self.tx.send(command);
    }
}

/// Consumer half owned by the thread that owns the configuration's source
/// of truth. Only this thread ever calls [`ConfigEditor::apply_pending`].
pub struct ConfigEditor {
    store: Arc<ConfigStore>,
    rx: Receiver<ConfigCommand>,
}

impl ConfigEditor {
    /// Create the editor plus the sender half of its command queue.
    pub fn new(store: Arc<ConfigStore>) -> (Self, ConfigCommandSender) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { store, rx }, ConfigCommandSender { tx })
    }

    /// Drain and apply all queued commands. Returns how many were applied.
    pub fn apply_pending(&self) -> usize {
        let mut applied = 0;
        loop {
            let command = match self.rx.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };

            let current = self.store.load();
            let next = match command {
                ConfigCommand::UpsertMode(mode) => current.with_mode(mode),
                ConfigCommand::NudgeVirtualRect { mode, dx, dy } => {
                    current.with_edit(mode, |m| {
                        m.virtual_rect.x += dx;
                        m.virtual_rect.y += dy;
                    })
                }
                ConfigCommand::ResizeVirtualRect { mode, dw, dh } => {
                    current.with_edit(mode, |m| {
                        m.virtual_rect.w = (m.virtual_rect.w + dw).max(1);
                        m.virtual_rect.h = (m.virtual_rect.h + dh).max(1);
                    })
                }
            };
            self.store.store(next);
            applied += 1;
        }
        applied
    }
}

#[cfg(test)]
pub(crate) fn test_mode(name: &str, native: (u32, u32), rect: RectI) -> ModeConfig {
    ModeConfig {
        name: name.to_string(),
        native_width: native.0,
        native_height: native.1,
        virtual_rect: rect,
        placement: Placement::Letterbox,
        background: BackgroundStyle::default(),
        border: BorderStyle::default(),
        transition: TransitionStyle::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_interning_is_stable() {
        let snap = ConfigSnapshot::default()
            .with_mode(test_mode("pip", (1920, 1080), RectI::new(0, 0, 960, 540)));
        let id = snap.resolve("pip").expect("mode registered");

        // Re-upserting the same name keeps the id.
        let snap2 = snap.with_mode(test_mode("pip", (1920, 1080), RectI::new(10, 10, 960, 540)));
        assert_eq!(snap2.resolve("pip"), Some(id));
        assert_eq!(snap2.mode(id).unwrap().virtual_rect.x, 10);
        assert!(snap2.version() > snap.version());
    }

    #[test]
    fn test_none_id_never_resolves() {
        let snap = ConfigSnapshot::default()
            .with_mode(test_mode("a", (800, 600), RectI::new(0, 0, 800, 600)));
        assert!(snap.mode(ModeId::NONE).is_none());
    }

    #[test]
    fn test_store_swaps_whole_snapshot() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        let before = store.load();
        store.store(
            ConfigSnapshot::default()
                .with_mode(test_mode("a", (800, 600), RectI::new(0, 0, 800, 600))),
        );
        let after = store.load();
        assert_eq!(before.version(), 0);
        assert_eq!(after.version(), 1);
        // The old Arc is still valid for readers that grabbed it earlier.
        assert!(before.resolve("a").is_none());
        assert!(after.resolve("a").is_some());
    }

    #[test]
    fn test_command_queue_single_writer() {
        let store = Arc::new(ConfigStore::new(ConfigSnapshot::default().with_mode(
            test_mode("pip", (1920, 1080), RectI::new(100, 100, 960, 540)),
        )));
        let (editor, sender) = ConfigEditor::new(Arc::clone(&store));
        let id = store.load().resolve("pip").unwrap();

        // Simulated render-thread drag: request only, never apply.
        let render_side = sender.clone();
        render_side.send(ConfigCommand::NudgeVirtualRect {
            mode: id,
            dx: 5,
            dy: -5,
        });
        render_side.send(ConfigCommand::ResizeVirtualRect {
            mode: id,
            dw: 10,
            dh: 10,
        });

        // Nothing changes until the owning thread applies.
        assert_eq!(store.load().mode(id).unwrap().virtual_rect.x, 100);

        assert_eq!(editor.apply_pending(), 2);
        let rect = store.load().mode(id).unwrap().virtual_rect;
        assert_eq!((rect.x, rect.y, rect.w, rect.h), (105, 95, 970, 550));
    }

    #[test]
    fn test_resize_clamps_to_positive() {
        let store = Arc::new(ConfigStore::new(ConfigSnapshot::default().with_mode(
            test_mode("pip", (1920, 1080), RectI::new(0, 0, 4, 4)),
        )));
        let (editor, sender) = ConfigEditor::new(Arc::clone(&store));
        let id = store.load().resolve("pip").unwrap();

        sender.send(ConfigCommand::ResizeVirtualRect {
            mode: id,
            dw: -100,
            dh: -100,
        });
        editor.apply_pending();

        let rect = store.load().mode(id).unwrap().virtual_rect;
        assert_eq!((rect.w, rect.h), (1, 1));
    }
}
