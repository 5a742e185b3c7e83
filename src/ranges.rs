//! Half-open interval math used to track which parts of a recording are
//! resident in a cache.

use serde::{Deserialize, Serialize};

/// Half-open interval `[start, end)` over block indexes or byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value < self.end
    }

    /// Overlap with `other`, or `None` when they are disjoint.
    pub fn intersect(&self, other: Range) -> Option<Range> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Range { start, end })
    }
}

/// Sort and merge overlapping or touching ranges; empty ranges are dropped.
pub fn simplify(ranges: &[Range]) -> Vec<Range> {
    let mut sorted: Vec<Range> = ranges.iter().copied().filter(|r| !r.is_empty()).collect();
    sorted.sort_by_key(|r| (r.start, r.end));

    let mut out: Vec<Range> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match out.last_mut() {
            Some(last) if range.start <= last.end => {
                last.end = last.end.max(range.end);
            }
            _ => out.push(range),
        }
    }
    out
}

/// Complement of `loaded` within `bounds`: the sub-ranges that still need to
/// be fetched. Loaded ranges outside the bounds are clipped, never extended.
pub fn missing_ranges(bounds: Range, loaded: &[Range]) -> Vec<Range> {
    if bounds.is_empty() {
        return Vec::new();
    }

    let clipped: Vec<Range> =
        loaded.iter().filter_map(|range| range.intersect(bounds)).collect();
    let resident = simplify(&clipped);

    let mut missing = Vec::new();
    let mut cursor = bounds.start;
    for range in resident {
        if range.start > cursor {
            missing.push(Range::new(cursor, range.start));
        }
        cursor = cursor.max(range.end);
    }
    if cursor < bounds.end {
        missing.push(Range::new(cursor, bounds.end));
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn missing_of_empty_loaded_set_is_the_bounds() {
        assert_eq!(missing_ranges(Range::new(0, 10), &[]), vec![Range::new(0, 10)]);
    }

    #[test]
    fn missing_subtracts_loaded_subranges() {
        assert_eq!(
            missing_ranges(Range::new(0, 10), &[Range::new(1, 2), Range::new(7, 9)]),
            vec![Range::new(0, 1), Range::new(2, 7), Range::new(9, 10)]
        );
    }

    #[test]
    fn loaded_ranges_outside_bounds_are_clipped() {
        // Ranges reaching past the bounds must be clipped, not extended.
        assert_eq!(
            missing_ranges(Range::new(2, 8), &[Range::new(0, 3), Range::new(7, 20)]),
            vec![Range::new(3, 7)]
        );
        assert_eq!(missing_ranges(Range::new(2, 8), &[Range::new(0, 20)]), Vec::<Range>::new());
    }

    #[test]
    fn fully_loaded_bounds_have_no_missing_ranges() {
        assert_eq!(
            missing_ranges(Range::new(0, 10), &[Range::new(0, 5), Range::new(5, 10)]),
            Vec::<Range>::new()
        );
    }

    #[test]
    fn simplify_merges_touching_and_overlapping() {
        let merged = simplify(&[
            Range::new(5, 7),
            Range::new(0, 2),
            Range::new(2, 4),
            Range::new(6, 9),
            Range::new(3, 3),
        ]);
        assert_eq!(merged, vec![Range::new(0, 4), Range::new(5, 9)]);
    }

    proptest! {
        #[test]
        fn missing_and_loaded_partition_the_bounds(
            bounds_start in 0u64..100,
            bounds_len in 1u64..100,
            loaded in prop::collection::vec((0u64..200, 0u64..50), 0..10)
        ) {
            let bounds = Range::new(bounds_start, bounds_start + bounds_len);
            let loaded: Vec<Range> =
                loaded.into_iter().map(|(s, l)| Range::new(s, s + l)).collect();

            let missing = missing_ranges(bounds, &loaded);

            // Missing ranges are disjoint, ordered, non-empty, inside bounds.
            let mut prev_end = bounds.start;
            for range in &missing {
                prop_assert!(!range.is_empty());
                prop_assert!(range.start >= prev_end);
                prop_assert!(range.end <= bounds.end);
                prev_end = range.end;
            }

            // Every point in the bounds is either loaded or missing, never both.
            for point in bounds.start..bounds.end {
                let in_loaded = loaded.iter().any(|r| r.contains(point));
                let in_missing = missing.iter().any(|r| r.contains(point));
                prop_assert_eq!(in_loaded, !in_missing);
            }
        }
    }
}
