//! Delivery of projection updates that survived the document's filter stack.

use crate::document::WeakDocument;
use crate::util::Rect;

const INLINE_RECTS: usize = 4;
type Rects = smallvec::SmallVec<[Rect; INLINE_RECTS]>;

/// Add `rect`, absorbing every rect it overlaps or touches. Past [`INLINE_RECTS`], everything collapses into
/// the bounding rect, so a flood of updates never grows the payload.
fn merge_rect(rects: &mut Rects, mut rect: Rect) {
    if rect.is_empty() {
        return;
    }
    // The union grows as it absorbs, so look again after each one.
    while let Some(idx) = rects.iter().position(|other| other.touches(&rect)) {
        rect = rect.union(&rects.swap_remove(idx));
    }
    rects.push(rect);
    if rects.len() > INLINE_RECTS {
        let bounds = rects.drain(..).fold(Rect::EMPTY, |bounds, rect| bounds.union(&rect));
        rects.push(bounds);
    }
}

pub struct ProjectionUpdate {
    document: WeakDocument,
    rects: Rects,
}
impl ProjectionUpdate {
    #[must_use]
    pub fn new(document: WeakDocument, rects: &[Rect]) -> Self {
        let mut merged = Rects::new();
        for rect in rects {
            merge_rect(&mut merged, *rect);
        }
        Self {
            document,
            rects: merged,
        }
    }
    #[must_use]
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }
}
impl super::BackgroundJob for ProjectionUpdate {
    fn name(&self) -> &'static str {
        "projection-update"
    }
    fn overrides(&mut self, older: &dyn super::BackgroundJob) -> bool {
        let Some(older) = older.as_any().downcast_ref::<Self>() else {
            return false;
        };
        if !older.document.ptr_eq(&self.document) {
            return false;
        }
        // Older rects first, so disjoint updates reach observers in request order.
        let mut rects = older.rects.clone();
        for rect in self.rects.drain(..) {
            merge_rect(&mut rects, rect);
        }
        self.rects = rects;
        true
    }
    fn run(self: Box<Self>) {
        let Some(document) = self.document.upgrade() else {
            return;
        };
        for rect in &self.rects {
            document.notify_projection_updated(*rect);
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
