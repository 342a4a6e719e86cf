//! # Strokes
//!
//! A stroke is an ordered container of [`StrokeJob`](crate::jobs::StrokeJob)s with a single creator. How the stroke
//! behaves towards its neighbors, and what happens when it starts, finishes, or gets cancelled, is described by its
//! [`StrokeStrategy`].

use crate::jobs::Exclusivity;

pub struct StrokeMarker;
pub type StrokeID = crate::FuzzID<StrokeMarker>;

bitflags::bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    /// Static properties of a stroke, as read from its strategy when it starts.
    pub struct StrokeFlags : u8 {
        /// Starting this stroke asks every open stroke to wrap up.
        const REQUESTS_OTHER_STROKES_TO_END = 0b0001;
        /// Starting this stroke throws away the redo history.
        const CLEARS_REDO_ON_START =          0b0010;
        /// The stroke may be silently cancelled when another one starts.
        const CAN_FORGET_ABOUT_ME =           0b0100;
        /// Init, finish and cancel callbacks run with nothing else alongside.
        const EXCLUSIVE =                     0b1000;
    }
}

/// Describes a stroke's lifecycle. Callbacks run on a worker, as barrier jobs of the stroke itself.
///
/// A cancelled stroke may have lost its creator long before `cancel_stroke` runs - it must manage without.
pub trait StrokeStrategy: Send + Sync + 'static {
    /// For logs and timing probes.
    fn name(&self) -> &str;
    fn requests_other_strokes_to_end(&self) -> bool {
        true
    }
    fn clears_redo_on_start(&self) -> bool {
        true
    }
    fn can_forget_about_me(&self) -> bool {
        false
    }
    fn exclusivity(&self) -> Exclusivity {
        Exclusivity::Normal
    }
    fn init_stroke(&self) {}
    fn finish_stroke(&self) {}
    fn cancel_stroke(&self) {}

    fn flags(&self) -> StrokeFlags {
        let mut flags = StrokeFlags::empty();
        flags.set(
            StrokeFlags::REQUESTS_OTHER_STROKES_TO_END,
            self.requests_other_strokes_to_end(),
        );
        flags.set(StrokeFlags::CLEARS_REDO_ON_START, self.clears_redo_on_start());
        flags.set(StrokeFlags::CAN_FORGET_ABOUT_ME, self.can_forget_about_me());
        flags.set(
            StrokeFlags::EXCLUSIVE,
            self.exclusivity() == Exclusivity::Exclusive,
        );
        flags
    }
}

type Callback = Box<dyn Fn() + Send + Sync>;

/// A strategy assembled from flags and optional closures, for strokes that don't need a type of their own.
pub struct SimpleStrokeStrategy {
    name: String,
    flags: StrokeFlags,
    on_init: Option<Callback>,
    on_finish: Option<Callback>,
    on_cancel: Option<Callback>,
}
impl SimpleStrokeStrategy {
    /// A normal, unforgettable stroke that ends others and clears redo.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: StrokeFlags::REQUESTS_OTHER_STROKES_TO_END | StrokeFlags::CLEARS_REDO_ON_START,
            on_init: None,
            on_finish: None,
            on_cancel: None,
        }
    }
    #[must_use]
    pub fn with_flags(mut self, flags: StrokeFlags) -> Self {
        self.flags = flags;
        self
    }
    #[must_use]
    pub fn on_init(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_init = Some(Box::new(f));
        self
    }
    #[must_use]
    pub fn on_finish(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }
    #[must_use]
    pub fn on_cancel(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }
}
impl StrokeStrategy for SimpleStrokeStrategy {
    fn name(&self) -> &str {
        &self.name
    }
    fn requests_other_strokes_to_end(&self) -> bool {
        self.flags.contains(StrokeFlags::REQUESTS_OTHER_STROKES_TO_END)
    }
    fn clears_redo_on_start(&self) -> bool {
        self.flags.contains(StrokeFlags::CLEARS_REDO_ON_START)
    }
    fn can_forget_about_me(&self) -> bool {
        self.flags.contains(StrokeFlags::CAN_FORGET_ABOUT_ME)
    }
    fn exclusivity(&self) -> Exclusivity {
        if self.flags.contains(StrokeFlags::EXCLUSIVE) {
            Exclusivity::Exclusive
        } else {
            Exclusivity::Normal
        }
    }
    fn init_stroke(&self) {
        if let Some(f) = &self.on_init {
            f();
        }
    }
    fn finish_stroke(&self) {
        if let Some(f) = &self.on_finish {
            f();
        }
    }
    fn cancel_stroke(&self) {
        if let Some(f) = &self.on_cancel {
            f();
        }
    }
    fn flags(&self) -> StrokeFlags {
        self.flags
    }
}

#[cfg(test)]
mod test {
    use super::{SimpleStrokeStrategy, StrokeFlags, StrokeStrategy};
    use crate::jobs::Exclusivity;

    #[test]
    fn flags_roundtrip_through_accessors() {
        let strategy = SimpleStrokeStrategy::new("fill")
            .with_flags(StrokeFlags::CAN_FORGET_ABOUT_ME | StrokeFlags::EXCLUSIVE);
        assert!(!strategy.requests_other_strokes_to_end());
        assert!(!strategy.clears_redo_on_start());
        assert!(strategy.can_forget_about_me());
        assert_eq!(strategy.exclusivity(), Exclusivity::Exclusive);
    }
    #[test]
    fn default_flags() {
        struct Bare;
        impl StrokeStrategy for Bare {
            fn name(&self) -> &str {
                "bare"
            }
        }
        assert_eq!(
            Bare.flags(),
            StrokeFlags::REQUESTS_OTHER_STROKES_TO_END | StrokeFlags::CLEARS_REDO_ON_START
        );
        assert_eq!(Bare.flags(), SimpleStrokeStrategy::new("x").flags());
    }
}
