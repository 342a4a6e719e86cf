//! Utility types, used throughout the crate.

/// An integer, axis-aligned pixel rectangle. Half-open: covers `x..x+width`, `y..y+height`.
///
/// A rectangle with zero width or height is *empty*, and all empty rectangles compare equal to [`Rect::EMPTY`]
/// for the purposes of [`Rect::is_empty`], regardless of their origin.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}
impl Rect {
    pub const EMPTY: Self = Self {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
    /// One-past-the-end corner, widened so that huge rects don't overflow.
    fn far(&self) -> (i64, i64) {
        (
            i64::from(self.x) + i64::from(self.width),
            i64::from(self.y) + i64::from(self.height),
        )
    }
    /// Smallest rectangle containing both. Empty rectangles do not contribute.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Self::EMPTY,
            (true, false) => *other,
            (false, true) => *self,
            (false, false) => {
                let x = self.x.min(other.x);
                let y = self.y.min(other.y);
                let (sx, sy) = self.far();
                let (ox, oy) = other.far();
                // Saturate - a union spanning more than u32 pixels is already nonsense.
                let width = u32::try_from(sx.max(ox) - i64::from(x)).unwrap_or(u32::MAX);
                let height = u32::try_from(sy.max(oy) - i64::from(y)).unwrap_or(u32::MAX);
                Self::new(x, y, width, height)
            }
        }
    }
    /// Do the two overlap, or share an edge? Empty rectangles touch nothing.
    #[must_use]
    pub fn touches(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let (sx, sy) = self.far();
        let (ox, oy) = other.far();
        i64::from(self.x) <= ox
            && i64::from(other.x) <= sx
            && i64::from(self.y) <= oy
            && i64::from(other.y) <= sy
    }
    /// Scale a rect from a reduced level of detail back up to full resolution.
    /// Each level halves the resolution.
    #[must_use]
    pub fn upscaled(&self, level_of_detail: u8) -> Self {
        if level_of_detail == 0 || self.is_empty() {
            return *self;
        }
        let shift = u32::from(level_of_detail.min(30));
        Self::new(
            self.x.saturating_mul(1 << shift),
            self.y.saturating_mul(1 << shift),
            self.width.saturating_mul(1 << shift),
            self.height.saturating_mul(1 << shift),
        )
    }
}

/// A pending dirty region. Either some area, or the whole subject.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum UpdateRegion {
    /// Nothing requested yet.
    #[default]
    Nothing,
    Area(Rect),
    /// Everything, regardless of bounds. Absorbs anything merged into it.
    Full,
}
impl UpdateRegion {
    /// Interpret a request rect, where an empty rect means "everything".
    #[must_use]
    pub fn from_request(rect: Rect) -> Self {
        if rect.is_empty() {
            Self::Full
        } else {
            Self::Area(rect)
        }
    }
    #[must_use]
    pub fn merged(self, other: Self) -> Self {
        match (self, other) {
            (Self::Full, _) | (_, Self::Full) => Self::Full,
            (Self::Nothing, other) | (other, Self::Nothing) => other,
            (Self::Area(a), Self::Area(b)) => Self::Area(a.union(&b)),
        }
    }
    pub fn merge(&mut self, other: Self) {
        *self = self.merged(other);
    }
    #[must_use]
    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }
}

#[cfg(test)]
mod test {
    use super::{Rect, UpdateRegion};
    #[test]
    fn union_ignores_empty() {
        let a = Rect::new(10, 10, 5, 5);
        assert_eq!(a.union(&Rect::EMPTY), a);
        assert_eq!(Rect::new(-100, 4, 0, 9).union(&a), a);
        assert_eq!(
            a.union(&Rect::new(0, 12, 2, 10)),
            Rect::new(0, 10, 15, 12)
        );
    }
    #[test]
    fn touching() {
        let a = Rect::new(0, 0, 10, 10);
        assert!(a.touches(&Rect::new(5, 5, 10, 10)));
        // Shared edge.
        assert!(a.touches(&Rect::new(10, 0, 5, 5)));
        assert!(!a.touches(&Rect::new(11, 0, 5, 5)));
        assert!(!a.touches(&Rect::new(0, 0, 0, 5)));
    }
    #[test]
    fn full_absorbs() {
        let mut region = UpdateRegion::from_request(Rect::EMPTY);
        region.merge(UpdateRegion::from_request(Rect::new(0, 0, 4, 4)));
        assert!(region.is_full());

        let mut region = UpdateRegion::Nothing;
        region.merge(UpdateRegion::from_request(Rect::new(0, 0, 4, 4)));
        region.merge(UpdateRegion::from_request(Rect::new(4, 4, 4, 4)));
        assert_eq!(region, UpdateRegion::Area(Rect::new(0, 0, 8, 8)));
    }
    #[test]
    fn upscale() {
        assert_eq!(
            Rect::new(1, 2, 3, 4).upscaled(2),
            Rect::new(4, 8, 12, 16)
        );
    }
}
