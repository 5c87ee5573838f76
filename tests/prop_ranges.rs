// Property tests for the byte-range algebra
//
// The delta between wanted and cached ranges must hold exactly the wanted
// bytes the cache lacks, and compression must keep the covered bytes while
// leaving a sorted list of disjoint ranges.

use object_proxy_cache::{ByteRange, ByteRanges};
use proptest::prelude::*;

const FULL_LENGTH: i64 = 256;

fn closed_range() -> impl Strategy<Value = ByteRange> {
    (0i64..FULL_LENGTH, 0i64..FULL_LENGTH).prop_map(|(a, b)| ByteRange::new(a.min(b), a.max(b)))
}

fn range_list() -> impl Strategy<Value = ByteRanges> {
    prop::collection::vec(closed_range(), 1..6).prop_map(ByteRanges)
}

fn coverage(ranges: &ByteRanges) -> Vec<bool> {
    let mut covered = vec![false; FULL_LENGTH as usize];
    for r in ranges.iter() {
        for b in r.start..=r.end {
            covered[b as usize] = true;
        }
    }
    covered
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Every wanted byte is either cached or in the delta, never both
    #[test]
    fn prop_delta_partitions_wants(wants in range_list(), haves in range_list()) {
        let delta = wants.calculate_delta(&haves, FULL_LENGTH);
        let want_bytes = coverage(&wants);
        let have_bytes = coverage(&haves);
        let delta_bytes = coverage(&delta);

        for b in 0..FULL_LENGTH as usize {
            if want_bytes[b] && !have_bytes[b] {
                prop_assert!(delta_bytes[b], "byte {} missing from delta {}", b, delta);
            }
            if delta_bytes[b] {
                prop_assert!(want_bytes[b], "byte {} in delta {} was not wanted", b, delta);
                prop_assert!(!have_bytes[b], "byte {} in delta {} is already cached", b, delta);
            }
        }
    }

    /// The delta is sorted and has no touching or overlapping ranges
    #[test]
    fn prop_delta_is_minimal(wants in range_list(), haves in range_list()) {
        let delta = wants.calculate_delta(&haves, FULL_LENGTH);
        for pair in delta.windows(2) {
            prop_assert!(pair[0].end + 1 < pair[1].start, "delta {} not minimal", delta);
        }
    }

    /// Fetching the delta completes the cached ranges
    #[test]
    fn prop_delta_fill_completes(wants in range_list(), haves in range_list()) {
        let delta = wants.calculate_delta(&haves, FULL_LENGTH);
        let mut filled = haves.0.clone();
        filled.extend(delta.iter().copied());
        let filled = ByteRanges(filled);

        prop_assert!(wants.calculate_delta(&filled, FULL_LENGTH).is_empty());
    }

    /// Asking again for what is still missing yields the same delta
    #[test]
    fn prop_delta_idempotent(wants in range_list(), haves in range_list()) {
        let delta = wants.calculate_delta(&haves, FULL_LENGTH);
        prop_assume!(!delta.is_empty());
        prop_assert_eq!(delta.calculate_delta(&haves, FULL_LENGTH), delta);
    }

    /// Compression keeps the covered bytes and leaves disjoint sorted ranges
    #[test]
    fn prop_compress_preserves_coverage(ranges in range_list()) {
        let compressed = ranges.compress();
        prop_assert_eq!(coverage(&compressed), coverage(&ranges));
        for pair in compressed.windows(2) {
            prop_assert!(pair[0].end + 1 < pair[1].start);
        }
    }

    /// A request header built from closed ranges parses back to them
    #[test]
    fn prop_request_header_parses(ranges in range_list()) {
        let sorted = ByteRanges({
            let mut v = ranges.0.clone();
            v.sort();
            v
        });
        let header = ranges.to_request_header();
        prop_assert!(!header.contains(' '));
        prop_assert_eq!(ByteRanges::parse_range_header(&header), Some(sorted));
    }
}

#[test]
fn test_delta_past_end_is_full_miss() {
    let wants = ByteRanges(vec![ByteRange::new(10, 300)]);
    let haves = ByteRanges(vec![ByteRange::new(0, 99)]);
    assert_eq!(wants.calculate_delta(&haves, FULL_LENGTH), wants);
}

#[test]
fn test_delta_resolves_suffix() {
    // last 10 bytes of a 100 byte object, first 95 cached
    let wants = ByteRanges::parse_range_header("bytes=-10").unwrap();
    let haves = ByteRanges(vec![ByteRange::new(0, 94)]);
    assert_eq!(
        wants.calculate_delta(&haves, 100),
        ByteRanges(vec![ByteRange::new(95, 99)])
    );
}
