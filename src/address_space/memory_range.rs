use serde::Serialize;
use std::{
    cmp::{max, min},
    fmt::{Display, Formatter, Result},
};

/// A half-open range of addresses in this process.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
pub struct MemoryRange {
    start_: usize,
    end_: usize,
}

/// Note: The end point (end_) is implicitly NOT included in the MemoryRange
impl MemoryRange {
    pub fn new_range(addr: usize, num_bytes: usize) -> MemoryRange {
        // Overflow panics in debug mode, so no need for debug_assert!(start_ <= end_).
        MemoryRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    pub fn from_range(addr: usize, end: usize) -> MemoryRange {
        let result = MemoryRange {
            start_: addr,
            end_: end,
        };
        debug_assert!(result.start_ <= result.end_);
        result
    }

    /// Return true iff `other` is an address range fully contained by self.
    pub fn contains(&self, other: &Self) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    /// Note that we have p < self.end_ and not p <= self.end here.
    pub fn contains_ptr(&self, p: usize) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn intersect(&self, other: &MemoryRange) -> MemoryRange {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        MemoryRange {
            start_: s,
            end_: max(s, e),
        }
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        s < e
    }

    /// What is left of `self` once `other` is cut out of it: zero, one or two
    /// non-empty pieces, in address order.
    pub fn subtract(&self, other: &MemoryRange) -> Vec<MemoryRange> {
        if !self.intersects(other) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(2);
        if self.start_ < other.start_ {
            pieces.push(MemoryRange::from_range(self.start_, other.start_));
        }
        if other.end_ < self.end_ {
            pieces.push(MemoryRange::from_range(other.end_, self.end_));
        }
        pieces
    }

    pub fn is_empty(&self) -> bool {
        self.start_ == self.end_
    }

    pub fn start(&self) -> usize {
        self.start_
    }

    pub fn end(&self) -> usize {
        self.end_
    }

    pub fn size(&self) -> usize {
        self.end_ - self.start_
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.start_ as *mut u8
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}-{:#x}", self.start_, self.end_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_test() {
        let r = MemoryRange::from_range(0x1000, 0x3000);
        assert!(r.contains_ptr(0x1000));
        assert!(r.contains_ptr(0x2fff));
        assert!(!r.contains_ptr(0x3000));
        assert!(r.contains(&MemoryRange::new_range(0x2000, 0x1000)));
        assert!(!r.contains(&MemoryRange::new_range(0x2000, 0x2000)));
    }

    #[test]
    fn intersect_test() {
        let a = MemoryRange::from_range(0x1000, 0x3000);
        let b = MemoryRange::from_range(0x2000, 0x5000);
        let c = MemoryRange::from_range(0x3000, 0x4000);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.intersect(&b), MemoryRange::from_range(0x2000, 0x3000));
        assert!(a.intersect(&c).is_empty());
    }

    #[test]
    fn subtract_test() {
        let r = MemoryRange::from_range(0x1000, 0x5000);
        // Disjoint: untouched.
        assert_eq!(r.subtract(&MemoryRange::from_range(0x6000, 0x7000)), vec![r]);
        // Hole in the middle: two pieces.
        assert_eq!(
            r.subtract(&MemoryRange::from_range(0x2000, 0x3000)),
            vec![
                MemoryRange::from_range(0x1000, 0x2000),
                MemoryRange::from_range(0x3000, 0x5000)
            ]
        );
        // Overlapping the head.
        assert_eq!(
            r.subtract(&MemoryRange::from_range(0x0, 0x2000)),
            vec![MemoryRange::from_range(0x2000, 0x5000)]
        );
        // Overlapping the tail.
        assert_eq!(
            r.subtract(&MemoryRange::from_range(0x4000, 0x9000)),
            vec![MemoryRange::from_range(0x1000, 0x4000)]
        );
        // Fully covered.
        assert!(r.subtract(&MemoryRange::from_range(0x0, 0x9000)).is_empty());
    }

    #[test]
    fn display_test() {
        let r = MemoryRange::from_range(0x1000, 0x2000);
        assert_eq!(r.to_string(), "0x1000-0x2000");
        assert_eq!(r.size(), 0x1000);
    }
}
