// Copyright 2026 the welkin authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pixel-region algebra. A region is a set of pixels kept as a list of
//! non-overlapping rectangles. The rectangle decomposition of a given pixel
//! set is not canonical; only coverage is meaningful, and all operations and
//! comparisons are defined in terms of it.

use crate::geometry::Point;
use crate::geometry::Rectangle;

/// Stand-in for an unbounded region (the default input region). Large enough
/// that no real surface or screen geometry reaches the edges, small enough
/// that the half-open arithmetic cannot overflow i32.
pub const INFINITE_RECT: Rectangle = Rectangle {
    x: -(1 << 29),
    y: -(1 << 29),
    width: 1 << 30,
    height: 1 << 30,
};

#[derive(Clone, Debug, Default)]
pub struct Region {
    rects: Vec<Rectangle>,
}

/// The parts of `a` not covered by `b`, as up to four disjoint rectangles.
fn split_outside(a: &Rectangle, b: &Rectangle, out: &mut Vec<Rectangle>) {
    let Some(overlap) = a.intersection(b) else {
        out.push(*a);
        return;
    };

    // Top band.
    if overlap.y > a.y {
        out.push(Rectangle::new(a.x, a.y, a.width, (overlap.y - a.y) as u32));
    }
    // Bottom band.
    if overlap.bottom() < a.bottom() {
        out.push(Rectangle::new(
            a.x,
            overlap.bottom(),
            a.width,
            (a.bottom() - overlap.bottom()) as u32,
        ));
    }
    // Left and right slivers of the middle band.
    if overlap.x > a.x {
        out.push(Rectangle::new(
            a.x,
            overlap.y,
            (overlap.x - a.x) as u32,
            overlap.height,
        ));
    }
    if overlap.right() < a.right() {
        out.push(Rectangle::new(
            overlap.right(),
            overlap.y,
            (a.right() - overlap.right()) as u32,
            overlap.height,
        ));
    }
}

impl Region {
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: Rectangle) -> Self {
        let mut region = Self::new();
        region.add_rect(rect);
        region
    }

    pub fn infinite() -> Self {
        Self::from_rect(INFINITE_RECT)
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rectangle] {
        &self.rects
    }

    /// Bounding box of the region, or None when empty.
    pub fn extents(&self) -> Option<Rectangle> {
        let first = self.rects.first()?;
        let mut x1 = first.x;
        let mut y1 = first.y;
        let mut x2 = first.right();
        let mut y2 = first.bottom();
        for r in &self.rects[1..] {
            x1 = x1.min(r.x);
            y1 = y1.min(r.y);
            x2 = x2.max(r.right());
            y2 = y2.max(r.bottom());
        }
        Some(Rectangle::new(x1, y1, (x2 - x1) as u32, (y2 - y1) as u32))
    }

    pub fn contains_point(&self, p: Point) -> bool {
        self.rects.iter().any(|r| r.contains(p))
    }

    /// The rectangle of the decomposition containing `p`. Pointer clipping
    /// confines motion to the box the cursor was last inside.
    pub fn containing_rect(&self, p: Point) -> Option<Rectangle> {
        self.rects.iter().find(|r| r.contains(p)).copied()
    }

    pub fn add_rect(&mut self, rect: Rectangle) {
        if rect.is_empty() {
            return;
        }
        // Insert only the parts not already covered, keeping rectangles
        // disjoint.
        let mut pieces = vec![rect];
        let mut next = Vec::new();
        for existing in &self.rects {
            for piece in &pieces {
                split_outside(piece, existing, &mut next);
            }
            std::mem::swap(&mut pieces, &mut next);
            next.clear();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    pub fn union(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    pub fn subtract_rect(&mut self, rect: Rectangle) {
        if rect.is_empty() || self.rects.is_empty() {
            return;
        }
        let mut remaining = Vec::with_capacity(self.rects.len());
        for r in &self.rects {
            split_outside(r, &rect, &mut remaining);
        }
        self.rects = remaining;
    }

    pub fn subtract(&mut self, other: &Region) {
        for rect in &other.rects {
            self.subtract_rect(*rect);
        }
    }

    pub fn intersect_rect(&mut self, rect: Rectangle) {
        self.rects = self
            .rects
            .iter()
            .filter_map(|r| r.intersection(&rect))
            .collect();
    }

    pub fn intersect(&mut self, other: &Region) {
        let mut result = Vec::new();
        for a in &self.rects {
            for b in &other.rects {
                if let Some(i) = a.intersection(b) {
                    result.push(i);
                }
            }
        }
        self.rects = result;
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        for r in &mut self.rects {
            r.x += dx;
            r.y += dy;
        }
    }

    pub fn translated(mut self, dx: i32, dy: i32) -> Region {
        self.translate(dx, dy);
        self
    }

    /// Number of pixels covered.
    pub fn area(&self) -> u64 {
        self.rects
            .iter()
            .map(|r| r.width as u64 * r.height as u64)
            .sum()
    }

    /// Coverage equality, independent of decomposition.
    pub fn same_coverage(&self, other: &Region) -> bool {
        let mut diff = self.clone();
        diff.subtract(other);
        if !diff.is_empty() {
            return false;
        }
        let mut diff = other.clone();
        diff.subtract(self);
        diff.is_empty()
    }
}

impl From<Rectangle> for Region {
    fn from(rect: Rectangle) -> Self {
        Region::from_rect(rect)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn rect(x: i32, y: i32, w: u32, h: u32) -> Rectangle {
        Rectangle::new(x, y, w, h)
    }

    /// Brute-force pixel membership over a small grid, the reference
    /// semantics the rectangle algebra must agree with.
    fn pixels(region: &Region, bound: i32) -> Vec<(i32, i32)> {
        let mut out = Vec::new();
        for y in -bound..bound {
            for x in -bound..bound {
                if region.contains_point(Point::new(x, y)) {
                    out.push((x, y));
                }
            }
        }
        out
    }

    #[test]
    fn test_disjoint_invariant_after_union() {
        let mut region = Region::new();
        region.add_rect(rect(0, 0, 10, 10));
        region.add_rect(rect(5, 5, 10, 10));
        region.add_rect(rect(0, 0, 10, 10));
        let rects = region.rects();
        for (i, a) in rects.iter().enumerate() {
            for b in &rects[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
        assert_eq!(region.area(), 100 + 100 - 25);
    }

    #[test]
    fn test_subtract_splits() {
        let mut region = Region::from_rect(rect(0, 0, 10, 10));
        region.subtract_rect(rect(2, 2, 6, 6));
        assert_eq!(region.area(), 100 - 36);
        assert!(region.contains_point(Point::new(1, 5)));
        assert!(!region.contains_point(Point::new(5, 5)));
    }

    #[test]
    fn test_intersect_rect() {
        let mut region = Region::from_rect(rect(0, 0, 10, 10));
        region.add_rect(rect(20, 0, 10, 10));
        region.intersect_rect(rect(5, 0, 20, 5));
        assert_eq!(region.area(), 25 + 25);
    }

    #[test]
    fn test_extents() {
        let mut region = Region::from_rect(rect(-5, -5, 5, 5));
        region.add_rect(rect(10, 10, 5, 5));
        assert_eq!(region.extents(), Some(rect(-5, -5, 20, 20)));
        assert_eq!(Region::new().extents(), None);
    }

    #[test]
    fn test_infinite_contains_far_points() {
        let region = Region::infinite();
        assert!(region.contains_point(Point::new(100_000_000, -100_000_000)));
    }

    fn arb_rect() -> impl Strategy<Value = Rectangle> {
        (-8i32..8, -8i32..8, 0u32..10, 0u32..10).prop_map(|(x, y, w, h)| rect(x, y, w, h))
    }

    proptest! {
        #[test]
        fn union_matches_pixel_union(rects in prop::collection::vec(arb_rect(), 0..6)) {
            let mut region = Region::new();
            for r in &rects {
                region.add_rect(*r);
            }
            for y in -20i32..20 {
                for x in -20i32..20 {
                    let p = Point::new(x, y);
                    let expected = rects.iter().any(|r| r.contains(p));
                    prop_assert_eq!(region.contains_point(p), expected);
                }
            }
        }

        #[test]
        fn subtract_matches_pixel_subtraction(
            base in prop::collection::vec(arb_rect(), 0..4),
            minus in prop::collection::vec(arb_rect(), 0..4),
        ) {
            let mut region = Region::new();
            for r in &base {
                region.add_rect(*r);
            }
            let mut sub = Region::new();
            for r in &minus {
                sub.add_rect(*r);
            }
            region.subtract(&sub);
            for y in -20i32..20 {
                for x in -20i32..20 {
                    let p = Point::new(x, y);
                    let expected = base.iter().any(|r| r.contains(p))
                        && !minus.iter().any(|r| r.contains(p));
                    prop_assert_eq!(region.contains_point(p), expected);
                }
            }
        }

        #[test]
        fn intersect_matches_pixel_intersection(
            a in prop::collection::vec(arb_rect(), 0..4),
            b in prop::collection::vec(arb_rect(), 0..4),
        ) {
            let mut ra = Region::new();
            for r in &a {
                ra.add_rect(*r);
            }
            let mut rb = Region::new();
            for r in &b {
                rb.add_rect(*r);
            }
            let mut isect = ra.clone();
            isect.intersect(&rb);
            let pa = pixels(&ra, 20);
            let expected: Vec<_> = pa
                .into_iter()
                .filter(|&(x, y)| rb.contains_point(Point::new(x, y)))
                .collect();
            prop_assert_eq!(pixels(&isect, 20), expected);
        }

        #[test]
        fn translate_preserves_area(rects in prop::collection::vec(arb_rect(), 0..5), dx in -10i32..10, dy in -10i32..10) {
            let mut region = Region::new();
            for r in &rects {
                region.add_rect(*r);
            }
            let area = region.area();
            region.translate(dx, dy);
            prop_assert_eq!(region.area(), area);
        }
    }
}
