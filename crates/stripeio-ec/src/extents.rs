//! Interval containers over one byte address space
//!
//! `ExtentSet` is an ordered set of disjoint, maximally coalesced half-open
//! intervals. `ExtentMap` associates intervals with immutable buffers; a
//! later insert wins over whatever it overlaps. Both are the working
//! vocabulary of the geometry, cache and shard-map layers.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered, disjoint, maximally coalesced set of half-open byte intervals.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ExtentSet {
    // start -> length; invariant: disjoint and never abutting
    map: BTreeMap<u64, u64>,
}

impl ExtentSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the set holds no intervals
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of disjoint intervals
    #[must_use]
    pub fn interval_count(&self) -> usize {
        self.map.len()
    }

    /// Total bytes covered
    #[must_use]
    pub fn size(&self) -> u64 {
        self.map.values().sum()
    }

    /// Lowest covered offset. Empty sets have no range.
    #[must_use]
    pub fn range_start(&self) -> Option<u64> {
        self.map.keys().next().copied()
    }

    /// One past the highest covered offset
    #[must_use]
    pub fn range_end(&self) -> Option<u64> {
        self.map.iter().next_back().map(|(s, l)| s + l)
    }

    /// Insert `[offset, offset + length)`, coalescing with any interval it
    /// touches or overlaps.
    pub fn insert(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + length;

        let absorbed: Vec<u64> = self
            .map
            .range(..=end)
            .rev()
            .take_while(|(&s, &l)| s + l >= start)
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            let l = self.map.remove(&s).unwrap();
            start = start.min(s);
            end = end.max(s + l);
        }
        self.map.insert(start, end - start);
    }

    /// Remove `[offset, offset + length)`, splitting intervals as needed
    pub fn erase(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = offset + length;
        let overlapping: Vec<(u64, u64)> = self
            .map
            .range(..end)
            .rev()
            .take_while(|(&s, &l)| s + l > offset)
            .map(|(&s, &l)| (s, l))
            .collect();
        for (s, l) in overlapping {
            self.map.remove(&s);
            if s < offset {
                self.map.insert(s, offset - s);
            }
            if s + l > end {
                self.map.insert(end, s + l - end);
            }
        }
    }

    /// Union another set into this one
    pub fn union_with(&mut self, other: &ExtentSet) {
        for (offset, length) in other.iter() {
            self.insert(offset, length);
        }
    }

    /// Subtract another set from this one
    pub fn subtract(&mut self, other: &ExtentSet) {
        for (offset, length) in other.iter() {
            self.erase(offset, length);
        }
    }

    /// Intersection with another set
    #[must_use]
    pub fn intersect(&self, other: &ExtentSet) -> ExtentSet {
        let mut out = ExtentSet::new();
        for (offset, length) in other.iter() {
            for (start, len) in self.intersect_range(offset, length) {
                out.insert(start, len);
            }
        }
        out
    }

    /// Portions of this set overlapping `[offset, offset + length)`
    pub fn intersect_range(&self, offset: u64, length: u64) -> Vec<(u64, u64)> {
        if length == 0 {
            return Vec::new();
        }
        let end = offset + length;
        let mut out: Vec<(u64, u64)> = self
            .map
            .range(..end)
            .rev()
            .take_while(|(&s, &l)| s + l > offset)
            .map(|(&s, &l)| {
                let lo = s.max(offset);
                let hi = (s + l).min(end);
                (lo, hi - lo)
            })
            .collect();
        out.reverse();
        out
    }

    /// Whether `[offset, offset + length)` is fully covered
    #[must_use]
    pub fn contains(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        // Coalesced invariant: containment means one interval covers it all
        match self.map.range(..=offset).next_back() {
            Some((&s, &l)) => s + l >= offset + length,
            None => false,
        }
    }

    /// Whether every interval of `other` is fully covered
    #[must_use]
    pub fn contains_set(&self, other: &ExtentSet) -> bool {
        other.iter().all(|(off, len)| self.contains(off, len))
    }

    /// Round every interval outward to `granularity` boundaries
    pub fn align(&mut self, granularity: u64) {
        debug_assert!(granularity.is_power_of_two());
        let mask = granularity - 1;
        let mut aligned = ExtentSet::new();
        for (offset, length) in self.iter() {
            let start = offset & !mask;
            let end = (offset + length + mask) & !mask;
            aligned.insert(start, end - start);
        }
        *self = aligned;
    }

    /// Iterate (offset, length) pairs in address order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.map.iter().map(|(&s, &l)| (s, l))
    }
}

impl FromIterator<(u64, u64)> for ExtentSet {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        let mut set = ExtentSet::new();
        for (offset, length) in iter {
            set.insert(offset, length);
        }
        set
    }
}

impl fmt::Debug for ExtentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (offset, length)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{offset}~{length}")?;
        }
        write!(f, "]")
    }
}

/// Interval map from byte offsets to immutable buffers.
///
/// Entries never overlap; each buffer's length equals its interval's
/// length. Buffers are not coalesced on insert, so a covered byte is owned
/// by exactly one buffer.
#[derive(Clone, Default)]
pub struct ExtentMap {
    map: BTreeMap<u64, Bytes>,
}

impl ExtentMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the map holds no buffers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total buffered bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.map.values().map(|b| b.len() as u64).sum()
    }

    /// Lowest buffered offset
    #[must_use]
    pub fn range_start(&self) -> Option<u64> {
        self.map.keys().next().copied()
    }

    /// One past the highest buffered offset
    #[must_use]
    pub fn range_end(&self) -> Option<u64> {
        self.map
            .iter()
            .next_back()
            .map(|(s, b)| s + b.len() as u64)
    }

    /// Insert a buffer at `offset`, punching out whatever it overlaps
    pub fn insert(&mut self, offset: u64, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.erase(offset, data.len() as u64);
        self.map.insert(offset, data);
    }

    /// Union another map into this one; `other`'s buffers win overlaps
    pub fn insert_map(&mut self, other: &ExtentMap) {
        for (offset, data) in other.iter() {
            self.insert(offset, data.clone());
        }
    }

    /// Remove `[offset, offset + length)`, slicing buffers that straddle
    /// the boundary
    pub fn erase(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = offset + length;
        let overlapping: Vec<u64> = self
            .map
            .range(..end)
            .rev()
            .take_while(|(&s, b)| s + b.len() as u64 > offset)
            .map(|(&s, _)| s)
            .collect();
        for s in overlapping {
            let buf = self.map.remove(&s).unwrap();
            let buf_end = s + buf.len() as u64;
            if s < offset {
                self.map.insert(s, buf.slice(..(offset - s) as usize));
            }
            if buf_end > end {
                self.map.insert(end, buf.slice((end - s) as usize..));
            }
        }
    }

    /// Whether `[offset, offset + length)` is fully buffered
    #[must_use]
    pub fn covers(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        let mut cursor = offset;
        let end = offset + length;
        // Find the entry containing `cursor`, then walk forward while
        // coverage stays contiguous.
        let mut range = match self.map.range(..=cursor).next_back() {
            Some((&s, b)) if s + b.len() as u64 > cursor => self.map.range(s..),
            _ => return false,
        };
        for (&s, b) in &mut range {
            if s > cursor {
                return false;
            }
            cursor = s + b.len() as u64;
            if cursor >= end {
                return true;
            }
        }
        false
    }

    /// Assemble `[offset, offset + length)` into one buffer.
    ///
    /// Zero-copy when a single entry covers the range. Returns `None` when
    /// the range is not fully buffered.
    #[must_use]
    pub fn get(&self, offset: u64, length: u64) -> Option<Bytes> {
        if length == 0 {
            return Some(Bytes::new());
        }
        let end = offset + length;
        let (&first_start, first) = self.map.range(..=offset).next_back()?;
        let first_end = first_start + first.len() as u64;
        if first_end >= end {
            let lo = (offset - first_start) as usize;
            return Some(first.slice(lo..lo + length as usize));
        }
        if first_end <= offset {
            return None;
        }

        let mut out = BytesMut::with_capacity(length as usize);
        out.extend_from_slice(&first[(offset - first_start) as usize..]);
        let mut cursor = first_end;
        for (&s, b) in self.map.range(first_end..) {
            if s != cursor {
                return None;
            }
            let take = ((end - s) as usize).min(b.len());
            out.extend_from_slice(&b[..take]);
            cursor = s + take as u64;
            if cursor >= end {
                break;
            }
        }
        (cursor >= end).then(|| out.freeze())
    }

    /// Buffered portions overlapping `[offset, offset + length)`
    #[must_use]
    pub fn intersect(&self, offset: u64, length: u64) -> ExtentMap {
        let mut out = ExtentMap::new();
        if length == 0 {
            return out;
        }
        let end = offset + length;
        for (&s, b) in self.map.range(..end).rev() {
            let buf_end = s + b.len() as u64;
            if buf_end <= offset {
                break;
            }
            let lo = s.max(offset);
            let hi = buf_end.min(end);
            out.map
                .insert(lo, b.slice((lo - s) as usize..(hi - s) as usize));
        }
        out
    }

    /// Project to the set of buffered intervals
    #[must_use]
    pub fn interval_set(&self) -> ExtentSet {
        self.iter().map(|(s, b)| (s, b.len() as u64)).collect()
    }

    /// Iterate (offset, buffer) pairs in address order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Bytes)> + '_ {
        self.map.iter().map(|(&s, b)| (s, b))
    }
}

impl fmt::Debug for ExtentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (offset, data)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{offset}~{}", data.len())?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(intervals: &[(u64, u64)]) -> ExtentSet {
        intervals.iter().copied().collect()
    }

    #[test]
    fn test_insert_coalesces() {
        let mut s = ExtentSet::new();
        s.insert(0, 10);
        s.insert(20, 10);
        assert_eq!(s.interval_count(), 2);
        // Bridge the gap; all three fuse
        s.insert(10, 10);
        assert_eq!(s.interval_count(), 1);
        assert_eq!(s.range_start(), Some(0));
        assert_eq!(s.range_end(), Some(30));
    }

    #[test]
    fn test_insert_abutting_coalesces() {
        let mut s = set(&[(0, 4096)]);
        s.insert(4096, 4096);
        assert_eq!(s.interval_count(), 1);
        assert_eq!(s.size(), 8192);
    }

    #[test]
    fn test_erase_splits() {
        let mut s = set(&[(0, 100)]);
        s.erase(40, 20);
        assert_eq!(s, set(&[(0, 40), (60, 40)]));
        assert!(!s.contains(40, 1));
        assert!(s.contains(0, 40));
    }

    #[test]
    fn test_subtract_and_intersect() {
        let a = set(&[(0, 100), (200, 50)]);
        let b = set(&[(50, 200)]);

        let mut diff = a.clone();
        diff.subtract(&b);
        assert_eq!(diff, set(&[(0, 50)]));

        assert_eq!(a.intersect(&b), set(&[(50, 50), (200, 50)]));
    }

    #[test]
    fn test_contains() {
        let s = set(&[(4096, 8192)]);
        assert!(s.contains(4096, 8192));
        assert!(s.contains(8000, 100));
        assert!(!s.contains(0, 1));
        assert!(!s.contains(12287, 2));
        assert!(s.contains_set(&set(&[(5000, 1000)])));
        assert!(!s.contains_set(&set(&[(5000, 10000)])));
    }

    #[test]
    fn test_align_outward() {
        let mut s = set(&[(100, 50), (5000, 100)]);
        s.align(4096);
        assert_eq!(s, set(&[(0, 4096), (4096, 4096)]));
        assert_eq!(s.interval_count(), 1); // abutting intervals fuse
    }

    #[test]
    fn test_map_insert_overwrites() {
        let mut m = ExtentMap::new();
        m.insert(0, Bytes::from(vec![1u8; 100]));
        m.insert(40, Bytes::from(vec![2u8; 20]));

        let assembled = m.get(0, 100).unwrap();
        assert_eq!(&assembled[..40], &[1u8; 40][..]);
        assert_eq!(&assembled[40..60], &[2u8; 20][..]);
        assert_eq!(&assembled[60..], &[1u8; 40][..]);
        // Split buffers, not coalesced: 3 entries
        assert_eq!(m.iter().count(), 3);
    }

    #[test]
    fn test_map_get_missing_range() {
        let mut m = ExtentMap::new();
        m.insert(0, Bytes::from(vec![1u8; 10]));
        m.insert(20, Bytes::from(vec![2u8; 10]));
        assert!(m.get(5, 20).is_none());
        assert!(!m.covers(0, 30));
        assert!(m.covers(0, 10));
    }

    #[test]
    fn test_map_get_contiguous_across_entries() {
        let mut m = ExtentMap::new();
        m.insert(0, Bytes::from(vec![1u8; 10]));
        m.insert(10, Bytes::from(vec![2u8; 10]));
        let out = m.get(5, 10).unwrap();
        assert_eq!(&out[..5], &[1u8; 5][..]);
        assert_eq!(&out[5..], &[2u8; 5][..]);
        assert!(m.covers(0, 20));
    }

    #[test]
    fn test_map_erase_slices_buffers() {
        let mut m = ExtentMap::new();
        m.insert(0, Bytes::from((0u8..100).collect::<Vec<_>>()));
        m.erase(10, 80);
        assert_eq!(m.size(), 20);
        assert_eq!(m.get(0, 10).unwrap()[9], 9);
        assert_eq!(m.get(90, 10).unwrap()[0], 90);
        assert!(m.get(10, 1).is_none());
    }

    #[test]
    fn test_map_intersect_and_interval_set() {
        let mut m = ExtentMap::new();
        m.insert(0, Bytes::from(vec![7u8; 50]));
        m.insert(100, Bytes::from(vec![8u8; 50]));

        let cut = m.intersect(25, 100);
        assert_eq!(cut.interval_set(), set(&[(25, 25), (100, 25)]));
        assert_eq!(cut.get(100, 25).unwrap(), Bytes::from(vec![8u8; 25]));
    }
}
