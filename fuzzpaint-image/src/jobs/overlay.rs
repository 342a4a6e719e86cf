//! Recomputation of an overlay subject (e.g. a selection's outline or mask preview) for an accumulated region.

use std::sync::Weak;

use crate::compressor::{OverlaySubject, SubjectID};
use crate::util::UpdateRegion;

pub struct RecomputeOverlay {
    subject_id: SubjectID,
    subject: Weak<dyn OverlaySubject>,
    region: UpdateRegion,
}
impl RecomputeOverlay {
    #[must_use]
    pub fn new(
        subject_id: SubjectID,
        subject: Weak<dyn OverlaySubject>,
        region: UpdateRegion,
    ) -> Self {
        Self {
            subject_id,
            subject,
            region,
        }
    }
    #[must_use]
    pub fn subject_id(&self) -> SubjectID {
        self.subject_id
    }
    #[must_use]
    pub fn region(&self) -> UpdateRegion {
        self.region
    }
}
impl super::BackgroundJob for RecomputeOverlay {
    fn name(&self) -> &'static str {
        "recompute-overlay"
    }
    fn overrides(&mut self, older: &dyn super::BackgroundJob) -> bool {
        let Some(older) = older.as_any().downcast_ref::<Self>() else {
            return false;
        };
        if older.subject_id != self.subject_id {
            return false;
        }
        // Take over the older job's area too, it will never run.
        self.region.merge(older.region);
        true
    }
    fn run(self: Box<Self>) {
        if let Some(subject) = self.subject.upgrade() {
            subject.recompute_overlay(self.region);
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod test {
    use super::RecomputeOverlay;
    use crate::compressor::{OverlaySubject, SubjectID};
    use crate::jobs::{BackgroundJob, ProjectionUpdate};
    use crate::util::{Rect, UpdateRegion};
    use std::sync::{Arc, Weak};

    struct Nobody;
    impl OverlaySubject for Nobody {
        fn document(&self) -> Option<crate::document::Document> {
            None
        }
        fn recompute_overlay(&self, _: UpdateRegion) {}
    }
    fn dangling() -> Weak<dyn OverlaySubject> {
        let arc: Arc<dyn OverlaySubject> = Arc::new(Nobody);
        Arc::downgrade(&arc)
    }

    #[test]
    fn merges_same_subject() {
        let subject = SubjectID::next();
        let older = RecomputeOverlay::new(
            subject,
            dangling(),
            UpdateRegion::Area(Rect::new(0, 0, 2, 2)),
        );
        let mut newer = RecomputeOverlay::new(
            subject,
            dangling(),
            UpdateRegion::Area(Rect::new(4, 4, 2, 2)),
        );
        assert!(newer.overrides(&older));
        assert_eq!(newer.region(), UpdateRegion::Area(Rect::new(0, 0, 6, 6)));
    }
    #[test]
    fn ignores_other_subjects_and_kinds() {
        let older = RecomputeOverlay::new(SubjectID::next(), dangling(), UpdateRegion::Full);
        let mut newer = RecomputeOverlay::new(
            SubjectID::next(),
            dangling(),
            UpdateRegion::Area(Rect::new(0, 0, 1, 1)),
        );
        assert!(!newer.overrides(&older));
        assert_eq!(newer.region(), UpdateRegion::Area(Rect::new(0, 0, 1, 1)));

        let other_kind = ProjectionUpdate::new(
            crate::document::WeakDocument::new(),
            &[Rect::new(0, 0, 1, 1)],
        );
        assert!(!newer.overrides(&other_kind));
    }
}
