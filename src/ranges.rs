//! Byte-range interval algebra for HTTP Range requests
//!
//! Ranges are inclusive on both ends. A negative bound is open: a negative
//! `start` is a suffix range ("the last `end` bytes") and a negative `end`
//! runs from `start` to the end of the object. Open ranges only become
//! concrete once [`ByteRange::resolve`] is given the full content length.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};

const REQUEST_PREFIX: &str = "bytes=";
const RESPONSE_PREFIX: &str = "bytes ";

/// Represents a byte range for HTTP Range requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive), negative for a suffix range
    pub start: i64,
    /// Ending byte position (inclusive), negative for an open-ended range
    pub end: i64,
}

impl ByteRange {
    /// Create a new ByteRange
    pub fn new(start: i64, end: i64) -> Self {
        ByteRange { start, end }
    }

    /// True when either bound is unknown until the full length is known
    pub fn is_open(&self) -> bool {
        self.start < 0 || self.end < 0
    }

    /// Number of bytes covered by a closed range
    pub fn size(&self) -> i64 {
        self.end - self.start + 1
    }

    /// Whether `other` lies entirely within this range. Open ranges contain nothing.
    pub fn contains(&self, other: &ByteRange) -> bool {
        !self.is_open()
            && !other.is_open()
            && other.start >= self.start
            && other.end <= self.end
    }

    /// Turn open bounds into closed ones against a known full content length
    ///
    /// `-N` becomes the last `N` bytes, `N-` becomes `N` through the last byte,
    /// and a range open on both sides becomes the whole object.
    pub fn resolve(&self, full_length: i64) -> ByteRange {
        match (self.start < 0, self.end < 0) {
            (false, false) => *self,
            (true, true) => ByteRange::new(0, full_length - 1),
            (true, false) => ByteRange::new((full_length - self.end).max(0), full_length - 1),
            (false, true) => ByteRange::new(self.start, full_length - 1),
        }
    }

    /// Build a `Content-Range` header value for this range
    ///
    /// An unknown (zero or negative) full length is rendered as `*`.
    pub fn content_range_header(&self, full_length: i64) -> String {
        if full_length > 0 {
            format!("{}{}/{}", RESPONSE_PREFIX, self, full_length)
        } else {
            format!("{}{}/*", RESPONSE_PREFIX, self)
        }
    }

    /// Crop a byte slice to this range
    ///
    /// Equivalent to `data[start..=end]`, except that an end beyond the slice is
    /// pulled back to the last available byte. Returns the cropped slice and the
    /// range it actually covers.
    pub fn crop<'a>(&self, data: &'a [u8]) -> (&'a [u8], ByteRange) {
        let len = data.len() as i64;
        let start = self.start.clamp(0, len);
        let end = (self.end + 1).clamp(start, len);
        (
            &data[start as usize..end as usize],
            ByteRange::new(start, end - 1),
        )
    }

    /// Copy `src`, whose content is described by this range, into `dst` at the
    /// range offset. A short `src` shortens the copy instead of failing.
    pub fn copy_into(&self, dst: &mut [u8], src: &[u8]) -> usize {
        if self.start < 0 || self.start as usize >= dst.len() {
            return 0;
        }
        let offset = self.start as usize;
        let n = (self.size().max(0) as usize)
            .min(src.len())
            .min(dst.len() - offset);
        dst[offset..offset + n].copy_from_slice(&src[..n]);
        n
    }

    fn parse_bound(input: &str) -> Option<i64> {
        if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        input.parse::<i64>().ok()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start >= 0 {
            write!(f, "{}", self.start)?;
        }
        f.write_str("-")?;
        if self.end >= 0 {
            write!(f, "{}", self.end)?;
        }
        Ok(())
    }
}

/// Parse a `Content-Range` response header value
///
/// # Arguments
/// * `input` - A header value such as `bytes 0-99/1000`
///
/// # Returns
/// * `Ok((range, full_length))`, with `full_length == -1` when the header says `*`
/// * `Err(CacheError)` if the header format is invalid
pub fn parse_content_range_header(input: &str) -> Result<(ByteRange, i64)> {
    let invalid = || CacheError::ParseError(format!("invalid Content-Range header: {}", input));

    let rest = input.trim().strip_prefix(RESPONSE_PREFIX).ok_or_else(invalid)?;
    let (range, total) = rest.split_once('/').ok_or_else(invalid)?;
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;

    let start = ByteRange::parse_bound(start).ok_or_else(invalid)?;
    let end = ByteRange::parse_bound(end).ok_or_else(invalid)?;
    if start > end {
        return Err(CacheError::InvalidRange(format!(
            "start ({}) must be <= end ({})",
            start, end
        )));
    }

    let full_length = if total == "*" {
        -1
    } else {
        ByteRange::parse_bound(total).ok_or_else(invalid)?
    };

    Ok((ByteRange::new(start, end), full_length))
}

/// An ordered list of byte ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRanges(pub Vec<ByteRange>);

impl Deref for ByteRanges {
    type Target = Vec<ByteRange>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ByteRanges {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<ByteRange>> for ByteRanges {
    fn from(ranges: Vec<ByteRange>) -> Self {
        ByteRanges(ranges)
    }
}

impl FromIterator<ByteRange> for ByteRanges {
    fn from_iter<I: IntoIterator<Item = ByteRange>>(iter: I) -> Self {
        ByteRanges(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ByteRanges {
    type Item = &'a ByteRange;
    type IntoIter = std::slice::Iter<'a, ByteRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl ByteRanges {
    /// Parse a `Range` request header value such as `bytes=0-99, 200-`
    ///
    /// Spaces are ignored and the result is sorted. Returns `None` for empty,
    /// malformed or prefix-only input.
    pub fn parse_range_header(input: &str) -> Option<ByteRanges> {
        let input = input.strip_prefix(REQUEST_PREFIX)?;
        let input: String = input.chars().filter(|c| *c != ' ').collect();
        if input.is_empty() {
            return None;
        }

        let mut ranges = Vec::new();
        for part in input.split(',') {
            let (start, end) = part.split_once('-')?;
            let start = if start.is_empty() {
                -1
            } else {
                ByteRange::parse_bound(start)?
            };
            let end = if end.is_empty() {
                -1
            } else {
                ByteRange::parse_bound(end)?
            };
            if start >= 0 && end >= 0 && start > end {
                return None;
            }
            ranges.push(ByteRange::new(start, end));
        }

        ranges.sort();
        Some(ByteRanges(ranges))
    }

    /// Compare two lists irrespective of their current order
    pub fn same_as(&self, other: &ByteRanges) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut a = self.0.clone();
        let mut b = other.0.clone();
        a.sort();
        b.sort();
        a == b
    }

    /// Resolve every open bound against the full content length
    pub fn resolve(&self, full_length: i64) -> ByteRanges {
        let mut out: ByteRanges = self.iter().map(|r| r.resolve(full_length)).collect();
        out.sort();
        out
    }

    /// Merge touching and overlapping closed ranges
    ///
    /// The result is sorted. Ranges with an open bound cannot be compared
    /// positionally, so they are kept as distinct entries.
    pub fn compress(&self) -> ByteRanges {
        let mut sorted = self.0.clone();
        sorted.sort();

        let mut out: Vec<ByteRange> = Vec::with_capacity(sorted.len());
        for r in sorted {
            if r.is_open() {
                out.push(r);
                continue;
            }
            match out.last_mut() {
                Some(prev) if !prev.is_open() && r.start <= prev.end + 1 => {
                    prev.end = prev.end.max(r.end);
                }
                _ => out.push(r),
            }
        }
        ByteRanges(out)
    }

    /// Calculate the ranges of `self` (the wanted ranges) not covered by `haves`
    ///
    /// Open bounds of the wanted ranges are resolved against `full_length`
    /// first. The result is sorted and minimal:
    /// - an empty want returns `haves`
    /// - no haves, or an unknown length, returns the wants unchanged
    /// - full coverage returns an empty list
    /// - a want that ends past the last byte is a full miss
    pub fn calculate_delta(&self, haves: &ByteRanges, full_length: i64) -> ByteRanges {
        if self.is_empty() {
            return haves.clone();
        }
        if haves.is_empty() || full_length < 1 {
            return self.clone();
        }
        if self.same_as(haves) {
            return ByteRanges::default();
        }

        let wants = self.resolve(full_length);
        if wants.iter().any(|w| w.end >= full_length) {
            return wants;
        }

        let haves: Vec<ByteRange> = haves
            .compress()
            .iter()
            .filter(|h| !h.is_open())
            .copied()
            .collect();

        let mut need = Vec::new();
        for want in wants.iter() {
            let mut cursor = want.start;
            for have in &haves {
                if have.end < cursor {
                    continue;
                }
                if have.start > want.end {
                    break;
                }
                if have.start > cursor {
                    need.push(ByteRange::new(cursor, have.start - 1));
                }
                cursor = have.end + 1;
                if cursor > want.end {
                    break;
                }
            }
            if cursor <= want.end {
                need.push(ByteRange::new(cursor, want.end));
            }
        }

        ByteRanges(need).compress()
    }

    /// Render the list as a `Range` request header value without spaces
    pub fn to_request_header(&self) -> String {
        let parts: Vec<String> = self.iter().map(|r| r.to_string()).collect();
        format!("{}{}", REQUEST_PREFIX, parts.join(","))
    }
}

impl fmt::Display for ByteRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        f.write_str(REQUEST_PREFIX)?;
        for (i, r) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(list: &[(i64, i64)]) -> ByteRanges {
        list.iter().map(|(s, e)| ByteRange::new(*s, *e)).collect()
    }

    #[test]
    fn test_display() {
        assert_eq!(ByteRange::new(0, 99).to_string(), "0-99");
        assert_eq!(ByteRange::new(-1, 500).to_string(), "-500");
        assert_eq!(ByteRange::new(9500, -1).to_string(), "9500-");
        assert_eq!(ranges(&[(0, 9), (20, 29)]).to_string(), "bytes=0-9, 20-29");
        assert_eq!(ByteRanges::default().to_string(), "");
        assert_eq!(ranges(&[(0, 9), (20, -1)]).to_request_header(), "bytes=0-9,20-");
    }

    #[test]
    fn test_content_range_header() {
        let r = ByteRange::new(0, 99);
        assert_eq!(r.content_range_header(1000), "bytes 0-99/1000");
        assert_eq!(r.content_range_header(0), "bytes 0-99/*");
        assert_eq!(r.content_range_header(-1), "bytes 0-99/*");
    }

    #[test]
    fn test_parse_range_header() {
        let r = ByteRanges::parse_range_header("bytes=0-50, 100-150").unwrap();
        assert_eq!(r, ranges(&[(0, 50), (100, 150)]));

        let r = ByteRanges::parse_range_header("bytes=100-150,0-50").unwrap();
        assert_eq!(r, ranges(&[(0, 50), (100, 150)]));

        let r = ByteRanges::parse_range_header("bytes=-500").unwrap();
        assert_eq!(r, ranges(&[(-1, 500)]));

        let r = ByteRanges::parse_range_header("bytes=9500-").unwrap();
        assert_eq!(r, ranges(&[(9500, -1)]));
    }

    #[test]
    fn test_parse_range_header_invalid() {
        assert!(ByteRanges::parse_range_header("").is_none());
        assert!(ByteRanges::parse_range_header("bytes=").is_none());
        assert!(ByteRanges::parse_range_header("0-50").is_none());
        assert!(ByteRanges::parse_range_header("bytes=0-50,abc").is_none());
        assert!(ByteRanges::parse_range_header("bytes=a-5").is_none());
        assert!(ByteRanges::parse_range_header("bytes=50-10").is_none());
        assert!(ByteRanges::parse_range_header("items=0-5").is_none());
    }

    #[test]
    fn test_parse_content_range_header() {
        let (r, cl) = parse_content_range_header("bytes 0-99/1000").unwrap();
        assert_eq!(r, ByteRange::new(0, 99));
        assert_eq!(cl, 1000);

        let (r, cl) = parse_content_range_header("bytes 10-19/*").unwrap();
        assert_eq!(r, ByteRange::new(10, 19));
        assert_eq!(cl, -1);

        assert!(parse_content_range_header("bytes */1000").is_err());
        assert!(parse_content_range_header("0-99/1000").is_err());
        assert!(parse_content_range_header("bytes 0-99").is_err());
        assert!(parse_content_range_header("bytes 99-0/1000").is_err());
    }

    #[test]
    fn test_resolve_open_bounds() {
        assert_eq!(ByteRange::new(-1, 10).resolve(100), ByteRange::new(90, 99));
        assert_eq!(ByteRange::new(-1, 500).resolve(100), ByteRange::new(0, 99));
        assert_eq!(ByteRange::new(90, -1).resolve(100), ByteRange::new(90, 99));
        assert_eq!(ByteRange::new(-1, -1).resolve(100), ByteRange::new(0, 99));
        assert_eq!(ByteRange::new(5, 10).resolve(100), ByteRange::new(5, 10));
    }

    #[test]
    fn test_delta_full_hit() {
        let want = ranges(&[(5, 10)]);
        let have = ranges(&[(0, 61)]);
        assert!(want.calculate_delta(&have, 62).is_empty());
    }

    #[test]
    fn test_delta_identical() {
        let want = ranges(&[(0, 10), (20, 30)]);
        assert!(want.calculate_delta(&want.clone(), 100).is_empty());
    }

    #[test]
    fn test_delta_full_miss() {
        let want = ranges(&[(50, 60)]);
        let have = ranges(&[(0, 10)]);
        assert_eq!(want.calculate_delta(&have, 100), ranges(&[(50, 60)]));
    }

    #[test]
    fn test_delta_partial() {
        let want = ranges(&[(0, 20)]);
        let have = ranges(&[(0, 9)]);
        assert_eq!(want.calculate_delta(&have, 100), ranges(&[(10, 20)]));

        let want = ranges(&[(0, 20)]);
        let have = ranges(&[(10, 30)]);
        assert_eq!(want.calculate_delta(&have, 100), ranges(&[(0, 9)]));
    }

    #[test]
    fn test_delta_multiple_gaps() {
        let want = ranges(&[(0, 99)]);
        let have = ranges(&[(10, 19), (40, 49)]);
        assert_eq!(
            want.calculate_delta(&have, 100),
            ranges(&[(0, 9), (20, 39), (50, 99)])
        );
    }

    #[test]
    fn test_delta_suffix_and_prefix() {
        let have = ranges(&[(0, 89)]);
        assert_eq!(
            ranges(&[(-1, 20)]).calculate_delta(&have, 100),
            ranges(&[(90, 99)])
        );
        assert_eq!(
            ranges(&[(80, -1)]).calculate_delta(&have, 100),
            ranges(&[(90, 99)])
        );
        assert!(ranges(&[(-1, 5)])
            .calculate_delta(&ranges(&[(0, 99)]), 100)
            .is_empty());
    }

    #[test]
    fn test_delta_out_of_bounds_is_full_miss() {
        let want = ranges(&[(0, 200)]);
        let have = ranges(&[(0, 99)]);
        assert_eq!(want.calculate_delta(&have, 100), ranges(&[(0, 200)]));
    }

    #[test]
    fn test_delta_degenerate_inputs() {
        let have = ranges(&[(0, 9)]);
        assert_eq!(ByteRanges::default().calculate_delta(&have, 100), have);

        let want = ranges(&[(0, 9)]);
        assert_eq!(want.calculate_delta(&ByteRanges::default(), 100), want);
        assert_eq!(want.calculate_delta(&ranges(&[(50, 60)]), 0), want);
    }

    #[test]
    fn test_compress() {
        let r = ranges(&[(10, 19), (0, 9), (30, 39), (35, 50)]);
        assert_eq!(r.compress(), ranges(&[(0, 19), (30, 50)]));

        let r = ranges(&[(0, 9), (-1, 5), (10, -1)]);
        let c = r.compress();
        assert_eq!(c.len(), 3);
        assert!(c.contains(&ByteRange::new(-1, 5)));
        assert!(c.contains(&ByteRange::new(10, -1)));
    }

    #[test]
    fn test_crop() {
        let data = b"0123456789";
        let (c, r) = ByteRange::new(2, 4).crop(data);
        assert_eq!(c, b"234");
        assert_eq!(r, ByteRange::new(2, 4));

        let (c, r) = ByteRange::new(8, 20).crop(data);
        assert_eq!(c, b"89");
        assert_eq!(r, ByteRange::new(8, 9));

        let (c, _) = ByteRange::new(20, 30).crop(data);
        assert!(c.is_empty());
    }

    #[test]
    fn test_copy_into() {
        let mut dst = vec![0u8; 10];
        assert_eq!(ByteRange::new(2, 4).copy_into(&mut dst, b"abc"), 3);
        assert_eq!(&dst[2..5], b"abc");

        assert_eq!(ByteRange::new(8, 12).copy_into(&mut dst, b"wxyz!"), 2);
        assert_eq!(&dst[8..], b"wx");

        assert_eq!(ByteRange::new(0, 9).copy_into(&mut dst, b"q"), 1);
        assert_eq!(dst[0], b'q');

        assert_eq!(ByteRange::new(10, 12).copy_into(&mut dst, b"abc"), 0);
    }

    #[test]
    fn test_contains() {
        let r = ByteRange::new(0, 99);
        assert!(r.contains(&ByteRange::new(5, 10)));
        assert!(!r.contains(&ByteRange::new(90, 100)));
        assert!(!r.contains(&ByteRange::new(-1, 5)));
    }
}
