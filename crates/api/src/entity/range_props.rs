//! Property tests for range parsing.

use proptest::prelude::*;

use super::range::{parse_range, RangeError};

proptest! {
    #[test]
    fn parsed_ranges_stay_inside_content(size in 1u64..1_000_000, start in 0u64..2_000_000, len in 0u64..2_000_000) {
        let header = format!("bytes={start}-{}", start + len);
        match parse_range(&header, size) {
            Ok(ranges) => {
                prop_assert_eq!(ranges.len(), 1);
                let r = ranges[0];
                prop_assert_eq!(r.start, start);
                prop_assert!(r.length >= 1);
                prop_assert!(r.start + r.length <= size);
            }
            Err(err) => {
                prop_assert_eq!(err, RangeError::NoOverlap);
                prop_assert!(start >= size);
            }
        }
    }

    #[test]
    fn suffix_ranges_end_at_content_end(size in 0u64..1_000_000, suffix in 1u64..2_000_000) {
        let ranges = parse_range(&format!("bytes=-{suffix}"), size).unwrap();
        prop_assert_eq!(ranges.len(), 1);
        prop_assert_eq!(ranges[0].start + ranges[0].length, size);
        prop_assert_eq!(ranges[0].length, suffix.min(size));
    }
}
