//! TEAM_513: Half-open integer intervals.
//!
//! `Region` is the bookkeeping unit for page ranges inside buffers and for
//! GPU virtual address windows. All operations are pure; a region with
//! `start == end` is empty and is treated as contained in every region.

use core::fmt;

/// Half-open interval `[start, end)`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Region {
    start: u64,
    end: u64,
}

impl Region {
    /// Empty region at offset 0.
    pub const EMPTY: Region = Region { start: 0, end: 0 };

    /// Build from `[start, end)`. An inverted pair collapses to an empty
    /// region at `start`.
    pub const fn from_start_and_end(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        if end < start {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Build from a start and a length, saturating at `u64::MAX`.
    pub const fn from_start_and_length(start: u64, length: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(length),
        }
    }

    #[inline]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    pub const fn length(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Grow to cover `other` and any gap between the two.
    pub fn union(&mut self, other: &Region) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = *other;
            return;
        }
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }

    /// Shrink to the overlap with `other`. Disjoint regions leave `self` empty.
    pub fn intersect(&mut self, other: &Region) {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start >= end {
            self.end = self.start;
        } else {
            self.start = start;
            self.end = end;
        }
    }

    /// Remove `other` from `self` without splitting.
    ///
    /// Returns false (and leaves `self` untouched) when `other` lies strictly
    /// inside `self`, since the result would be two pieces.
    pub fn subtract(&mut self, other: &Region) -> bool {
        let [left, right] = self.subtract_with_split(other);
        match (left.is_empty(), right.is_empty()) {
            (false, false) => false,
            (true, true) => {
                self.end = self.start;
                true
            }
            (false, true) => {
                *self = left;
                true
            }
            (true, false) => {
                *self = right;
                true
            }
        }
    }

    /// Remove `other` from `self`, returning the pieces below and above it.
    /// Either piece may be empty.
    pub fn subtract_with_split(&self, other: &Region) -> [Region; 2] {
        if other.is_empty() || !self.overlaps(other) {
            return [*self, Region::from_start_and_end(self.end, self.end)];
        }
        let left = if other.start > self.start {
            Region::from_start_and_end(self.start, other.start)
        } else {
            Region::from_start_and_end(self.start, self.start)
        };
        let right = if other.end < self.end {
            Region::from_start_and_end(other.end, self.end)
        } else {
            Region::from_start_and_end(self.end, self.end)
        };
        [left, right]
    }

    /// True when every point of `other` lies in `self`.
    pub fn contains(&self, other: &Region) -> bool {
        other.is_empty() || (other.start >= self.start && other.end <= self.end)
    }

    /// True when the two regions share at least one point.
    pub fn overlaps(&self, other: &Region) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    /// True when one region ends exactly where the other begins.
    pub fn is_adjacent_to(&self, other: &Region) -> bool {
        self.end == other.start || other.end == self.start
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}
