//! Projection-update suppression: a LIFO stack of filters that may swallow update requests before they are
//! scheduled, and a gate that holds back already-computed updates from observers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::DocumentID;
use crate::util::Rect;

pub struct FilterMarker;
/// Handle to an installed filter, needed to remove it again.
pub type FilterCookie = crate::FuzzID<FilterMarker>;

pub trait ProjectionUpdatesFilter: Send + Sync + 'static {
    /// Return true to swallow the request. Outer filters are not consulted after that.
    fn filter(&self, document: DocumentID, rects: &[Rect]) -> bool;
}

/// Swallows everything.
pub struct DropAllUpdatesFilter;
impl ProjectionUpdatesFilter for DropAllUpdatesFilter {
    fn filter(&self, _: DocumentID, _: &[Rect]) -> bool {
        true
    }
}

type Filters = smallvec::SmallVec<[Arc<dyn ProjectionUpdatesFilter>; 2]>;

#[derive(Default)]
pub(super) struct FilterStack {
    filters: Vec<(FilterCookie, Arc<dyn ProjectionUpdatesFilter>)>,
}
impl FilterStack {
    pub(super) fn push(&mut self, filter: Arc<dyn ProjectionUpdatesFilter>) -> FilterCookie {
        let cookie = FilterCookie::next();
        self.filters.push((cookie, filter));
        cookie
    }
    /// Remove the top filter, which must be the one named by `cookie`.
    ///
    /// # Panics
    /// If it isn't - filters are strictly nested.
    pub(super) fn pop(&mut self, cookie: FilterCookie) -> Arc<dyn ProjectionUpdatesFilter> {
        match self.filters.pop() {
            Some((top, filter)) if top == cookie => filter,
            Some((top, _)) => panic!("removing {cookie} while {top} is on top of the filter stack"),
            None => panic!("removing {cookie} from an empty filter stack"),
        }
    }
    pub(super) fn top(&self) -> Option<FilterCookie> {
        self.filters.last().map(|(cookie, _)| *cookie)
    }
    /// Most nested first. Cloned out, so the filters run without the stack locked.
    pub(super) fn innermost_first(&self) -> Filters {
        self.filters
            .iter()
            .rev()
            .map(|(_, filter)| filter.clone())
            .collect()
    }
}

/// Holds back updates from observers while disabled. Nestable.
#[derive(Default)]
pub(super) struct UiUpdateGate {
    disabled: AtomicUsize,
    postponed: crossbeam::queue::SegQueue<Rect>,
}
impl UiUpdateGate {
    pub(super) fn disable(&self) {
        self.disabled.fetch_add(1, Ordering::AcqRel);
    }
    /// Re-enable one level, taking whatever was postponed so far.
    pub(super) fn enable(&self) -> Vec<Rect> {
        let previous = self
            .disabled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        assert!(previous.is_ok(), "UI updates enabled more times than disabled");
        std::iter::from_fn(|| self.postponed.pop()).collect()
    }
    /// Returns `rect` back if the gate is open.
    pub(super) fn pass_or_postpone(&self, rect: Rect) -> Option<Rect> {
        if self.disabled.load(Ordering::Acquire) == 0 {
            Some(rect)
        } else {
            self.postponed.push(rect);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::{DropAllUpdatesFilter, FilterStack, UiUpdateGate};
    use crate::util::Rect;
    use std::sync::Arc;

    #[test]
    fn lifo() {
        let mut stack = FilterStack::default();
        let a = stack.push(Arc::new(DropAllUpdatesFilter));
        let b = stack.push(Arc::new(DropAllUpdatesFilter));
        assert_eq!(stack.top(), Some(b));
        stack.pop(b);
        assert_eq!(stack.top(), Some(a));
        stack.pop(a);
        assert_eq!(stack.top(), None);
    }
    #[test]
    #[should_panic(expected = "on top of the filter stack")]
    fn out_of_order_removal() {
        let mut stack = FilterStack::default();
        let a = stack.push(Arc::new(DropAllUpdatesFilter));
        stack.push(Arc::new(DropAllUpdatesFilter));
        stack.pop(a);
    }
    #[test]
    fn gate_collects_while_closed() {
        let gate = UiUpdateGate::default();
        let rect = Rect::new(1, 2, 3, 4);
        assert_eq!(gate.pass_or_postpone(rect), Some(rect));
        gate.disable();
        gate.disable();
        assert_eq!(gate.pass_or_postpone(rect), None);
        assert_eq!(gate.enable(), vec![rect]);
        // Still closed one level.
        assert_eq!(gate.pass_or_postpone(rect), None);
        assert_eq!(gate.enable(), vec![rect]);
        assert_eq!(gate.pass_or_postpone(rect), Some(rect));
    }
    #[test]
    #[should_panic(expected = "more times than disabled")]
    fn unbalanced_enable() {
        UiUpdateGate::default().enable();
    }
}
