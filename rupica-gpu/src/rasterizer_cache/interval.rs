// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Interval algebra over guest physical addresses.
//!
//! All intervals are right-exclusive byte ranges. `IntervalSet` keeps a
//! sorted, coalesced run of disjoint intervals; `IntervalMap` additionally
//! carries a value per run and only coalesces neighbours with equal values.
//! Both are sorted-vector sweeps; the cache touches a handful of segments
//! per operation, so no tree is needed.

use rupica_common::types::PAddr;

/// A right-exclusive `[start, end)` byte range in guest physical memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceInterval {
    pub start: PAddr,
    pub end: PAddr,
}

impl SurfaceInterval {
    pub const fn new(start: PAddr, end: PAddr) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    pub fn overlaps(&self, other: SurfaceInterval) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[inline]
    pub fn contains(&self, other: SurfaceInterval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Clips this interval against `other`. The result may be empty.
    #[inline]
    pub fn intersect(&self, other: SurfaceInterval) -> SurfaceInterval {
        SurfaceInterval {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        }
    }
}

/// A set of disjoint, coalesced intervals.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntervalSet {
    segments: Vec<SurfaceInterval>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_interval(interval: SurfaceInterval) -> Self {
        let mut set = Self::new();
        set.insert(interval);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = SurfaceInterval> + '_ {
        self.segments.iter().copied()
    }

    pub fn first(&self) -> Option<SurfaceInterval> {
        self.segments.first().copied()
    }

    pub fn insert(&mut self, interval: SurfaceInterval) {
        if interval.is_empty() {
            return;
        }
        // Find the window of segments that overlap or touch the new interval.
        let lo = self
            .segments
            .partition_point(|seg| seg.end < interval.start);
        let hi = self.segments.partition_point(|seg| seg.start <= interval.end);
        let mut merged = interval;
        if lo < hi {
            merged.start = merged.start.min(self.segments[lo].start);
            merged.end = merged.end.max(self.segments[hi - 1].end);
        }
        self.segments.splice(lo..hi, std::iter::once(merged));
    }

    pub fn erase(&mut self, interval: SurfaceInterval) {
        if interval.is_empty() {
            return;
        }
        let lo = self
            .segments
            .partition_point(|seg| seg.end <= interval.start);
        let hi = self.segments.partition_point(|seg| seg.start < interval.end);
        if lo >= hi {
            return;
        }
        let mut keep = Vec::with_capacity(2);
        let first = self.segments[lo];
        let last = self.segments[hi - 1];
        if first.start < interval.start {
            keep.push(SurfaceInterval::new(first.start, interval.start));
        }
        if last.end > interval.end {
            keep.push(SurfaceInterval::new(interval.end, last.end));
        }
        self.segments.splice(lo..hi, keep);
    }

    /// True when any part of `interval` is in the set.
    pub fn intersects(&self, interval: SurfaceInterval) -> bool {
        if interval.is_empty() {
            return false;
        }
        let lo = self
            .segments
            .partition_point(|seg| seg.end <= interval.start);
        self.segments
            .get(lo)
            .is_some_and(|seg| seg.start < interval.end)
    }

    /// True when `interval` is entirely in the set. Segments are coalesced,
    /// so a covered interval always sits inside a single segment.
    pub fn covers(&self, interval: SurfaceInterval) -> bool {
        if interval.is_empty() {
            return true;
        }
        let lo = self
            .segments
            .partition_point(|seg| seg.end <= interval.start);
        self.segments
            .get(lo)
            .is_some_and(|seg| seg.contains(interval))
    }

    /// The subset of the set lying within `interval`, clipped to it.
    pub fn intersection(&self, interval: SurfaceInterval) -> IntervalSet {
        let mut out = IntervalSet::new();
        if interval.is_empty() {
            return out;
        }
        for seg in &self.segments {
            let clipped = seg.intersect(interval);
            if !clipped.is_empty() {
                out.segments.push(clipped);
            }
        }
        out
    }

    pub fn union_with(&mut self, other: &IntervalSet) {
        for seg in &other.segments {
            self.insert(*seg);
        }
    }

    pub fn subtract(&mut self, other: &IntervalSet) {
        for seg in &other.segments {
            self.erase(*seg);
        }
    }
}

/// An interval map: disjoint segments each carrying a value. Neighbouring
/// segments with equal values are merged.
#[derive(Debug, Clone, Default)]
pub struct IntervalMap<V> {
    segments: Vec<(SurfaceInterval, V)>,
}

impl<V: Clone + PartialEq> IntervalMap<V> {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (SurfaceInterval, &V)> + '_ {
        self.segments.iter().map(|(seg, val)| (*seg, val))
    }

    /// Segments overlapping `interval`. Yields the full stored segment, not
    /// the clipped part; callers clip when they need to.
    pub fn overlapping(
        &self,
        interval: SurfaceInterval,
    ) -> impl Iterator<Item = (SurfaceInterval, &V)> + '_ {
        let lo = self
            .segments
            .partition_point(|(seg, _)| seg.end <= interval.start);
        self.segments[lo..]
            .iter()
            .take_while(move |(seg, _)| seg.start < interval.end)
            .map(|(seg, val)| (*seg, val))
    }

    /// True when `interval` is entirely covered by stored segments.
    pub fn covers(&self, interval: SurfaceInterval) -> bool {
        if interval.is_empty() {
            return true;
        }
        let mut cursor = interval.start;
        for (seg, _) in self.overlapping(interval) {
            if seg.start > cursor {
                return false;
            }
            cursor = cursor.max(seg.end);
            if cursor >= interval.end {
                return true;
            }
        }
        false
    }

    /// Rewrites the mapping over `interval`: `f` receives the current value
    /// (or `None` for gaps) of each piece and returns the replacement.
    pub fn update(&mut self, interval: SurfaceInterval, f: impl Fn(Option<&V>) -> Option<V>) {
        if interval.is_empty() {
            return;
        }
        let old = std::mem::take(&mut self.segments);
        let mut out: Vec<(SurfaceInterval, V)> = Vec::with_capacity(old.len() + 2);
        let mut tail: Vec<(SurfaceInterval, V)> = Vec::new();
        let mut cursor = interval.start;

        let mut push = |out: &mut Vec<(SurfaceInterval, V)>, seg: SurfaceInterval, val: V| {
            if let Some((prev, prev_val)) = out.last_mut() {
                if prev.end == seg.start && *prev_val == val {
                    prev.end = seg.end;
                    return;
                }
            }
            out.push((seg, val));
        };

        for (seg, val) in old {
            if seg.end <= interval.start {
                push(&mut out, seg, val);
                continue;
            }
            if seg.start >= interval.end {
                tail.push((seg, val));
                continue;
            }
            if seg.start < interval.start {
                push(
                    &mut out,
                    SurfaceInterval::new(seg.start, interval.start),
                    val.clone(),
                );
            }
            let overlap = seg.intersect(interval);
            if cursor < overlap.start {
                if let Some(new_val) = f(None) {
                    push(&mut out, SurfaceInterval::new(cursor, overlap.start), new_val);
                }
            }
            if let Some(new_val) = f(Some(&val)) {
                push(&mut out, overlap, new_val);
            }
            cursor = overlap.end;
            if seg.end > interval.end {
                tail.push((SurfaceInterval::new(interval.end, seg.end), val));
            }
        }
        if cursor < interval.end {
            if let Some(new_val) = f(None) {
                push(&mut out, SurfaceInterval::new(cursor, interval.end), new_val);
            }
        }
        for (seg, val) in tail {
            push(&mut out, seg, val);
        }
        self.segments = out;
    }

    /// Assigns `value` over `interval`, splitting whatever was there.
    pub fn set(&mut self, interval: SurfaceInterval, value: V) {
        self.update(interval, |_| Some(value.clone()));
    }

    /// Removes all values over `interval`.
    pub fn erase(&mut self, interval: SurfaceInterval) {
        self.update(interval, |_| None);
    }
}

impl IntervalMap<i32> {
    /// Adds `delta` over `interval`; segments reaching zero are dropped.
    pub fn add(&mut self, interval: SurfaceInterval, delta: i32) {
        self.update(interval, |old| {
            let count = old.copied().unwrap_or(0) + delta;
            (count != 0).then_some(count)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(start: PAddr, end: PAddr) -> SurfaceInterval {
        SurfaceInterval::new(start, end)
    }

    #[test]
    fn test_set_insert_coalesces() {
        let mut set = IntervalSet::new();
        set.insert(iv(0, 4));
        set.insert(iv(8, 12));
        set.insert(iv(4, 8));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![iv(0, 12)]);
    }

    #[test]
    fn test_set_insert_overlapping() {
        let mut set = IntervalSet::new();
        set.insert(iv(0, 10));
        set.insert(iv(5, 20));
        set.insert(iv(30, 40));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![iv(0, 20), iv(30, 40)]);
    }

    #[test]
    fn test_set_erase_splits() {
        let mut set = IntervalSet::from_interval(iv(0, 100));
        set.erase(iv(40, 60));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![iv(0, 40), iv(60, 100)]);
        set.erase(iv(0, 40));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![iv(60, 100)]);
    }

    #[test]
    fn test_set_erase_across_segments() {
        let mut set = IntervalSet::new();
        set.insert(iv(0, 10));
        set.insert(iv(20, 30));
        set.insert(iv(40, 50));
        set.erase(iv(5, 45));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![iv(0, 5), iv(45, 50)]);
    }

    #[test]
    fn test_set_queries() {
        let mut set = IntervalSet::new();
        set.insert(iv(10, 20));
        assert!(set.intersects(iv(15, 25)));
        assert!(!set.intersects(iv(20, 25)));
        assert!(set.covers(iv(12, 18)));
        assert!(!set.covers(iv(12, 22)));
        assert!(set.covers(iv(5, 5)));
    }

    #[test]
    fn test_set_intersection_and_subtract() {
        let mut set = IntervalSet::new();
        set.insert(iv(0, 10));
        set.insert(iv(20, 30));
        let clipped = set.intersection(iv(5, 25));
        assert_eq!(clipped.iter().collect::<Vec<_>>(), vec![iv(5, 10), iv(20, 25)]);

        let mut other = IntervalSet::from_interval(iv(8, 22));
        set.subtract(&other);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![iv(0, 8), iv(22, 30)]);

        other.union_with(&set);
        assert_eq!(other.iter().collect::<Vec<_>>(), vec![iv(0, 30)]);
    }

    #[test]
    fn test_map_set_and_erase() {
        let mut map: IntervalMap<u32> = IntervalMap::new();
        map.set(iv(0, 10), 1);
        map.set(iv(5, 15), 2);
        let segs: Vec<_> = map.iter().map(|(s, v)| (s, *v)).collect();
        assert_eq!(segs, vec![(iv(0, 5), 1), (iv(5, 15), 2)]);

        map.erase(iv(2, 7));
        let segs: Vec<_> = map.iter().map(|(s, v)| (s, *v)).collect();
        assert_eq!(segs, vec![(iv(0, 2), 1), (iv(7, 15), 2)]);
    }

    #[test]
    fn test_map_equal_values_coalesce() {
        let mut map: IntervalMap<u32> = IntervalMap::new();
        map.set(iv(0, 10), 7);
        map.set(iv(10, 20), 7);
        assert_eq!(map.iter().count(), 1);
    }

    #[test]
    fn test_map_overlapping_returns_full_segments() {
        let mut map: IntervalMap<u32> = IntervalMap::new();
        map.set(iv(0, 100), 1);
        let hits: Vec<_> = map.overlapping(iv(40, 60)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, iv(0, 100));
    }

    #[test]
    fn test_map_covers() {
        let mut map: IntervalMap<u32> = IntervalMap::new();
        map.set(iv(0, 10), 1);
        map.set(iv(10, 20), 2);
        assert!(map.covers(iv(5, 15)));
        map.erase(iv(10, 12));
        assert!(!map.covers(iv(5, 15)));
    }

    #[test]
    fn test_counter_add_and_drop_zero() {
        let mut pages: IntervalMap<i32> = IntervalMap::new();
        pages.add(iv(0, 4), 1);
        pages.add(iv(2, 6), 1);
        let segs: Vec<_> = pages.iter().map(|(s, v)| (s, *v)).collect();
        assert_eq!(segs, vec![(iv(0, 2), 1), (iv(2, 4), 2), (iv(4, 6), 1)]);

        pages.add(iv(0, 4), -1);
        pages.add(iv(2, 6), -1);
        assert!(pages.is_empty());
    }
}
