//! Multipart reconstruction of partial content
//!
//! A cached object may hold several disjoint pieces of the same origin
//! resource. [`RangeParts`] keeps those pieces keyed by their byte range,
//! merges new pieces in, and renders any subset of them as a single-part or
//! `multipart/byteranges` response body.

use crate::error::{CacheError, Result};
use crate::headers::{CONTENT_RANGE, CONTENT_TYPE, MULTIPART_BYTERANGES};
use crate::ranges::{parse_content_range_header, ByteRange, ByteRanges};
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// One contiguous piece of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangePart {
    pub range: ByteRange,
    pub content: Bytes,
}

impl RangePart {
    pub fn new(range: ByteRange, content: impl Into<Bytes>) -> Self {
        RangePart {
            range,
            content: content.into(),
        }
    }

    /// Whether the content fills the range exactly
    pub fn is_complete(&self) -> bool {
        !self.range.is_open() && self.content.len() as i64 == self.range.size()
    }
}

/// Pieces of one object, keyed and ordered by their exact range
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeParts(BTreeMap<ByteRange, RangePart>);

impl RangeParts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, range: &ByteRange) -> Option<&RangePart> {
        self.0.get(range)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RangePart> {
        self.0.values()
    }

    /// Insert a part, replacing any part with the exact same range
    pub fn insert(&mut self, part: RangePart) {
        self.0.insert(part.range, part);
    }

    /// Sorted list of the ranges held
    pub fn ranges(&self) -> ByteRanges {
        self.0.keys().copied().collect()
    }

    /// Fold `other` into this set and compress the result
    pub fn merge(&mut self, other: RangeParts) {
        if other.is_empty() {
            return;
        }
        for (range, part) in other.0 {
            self.0.insert(range, part);
        }
        self.compress();
    }

    /// Merge adjacent and overlapping parts so that no two parts touch
    ///
    /// Parts whose content does not fill their range are dropped first, so
    /// no byte ever lands at the wrong offset.
    pub fn compress(&mut self) {
        self.0.retain(|range, part| {
            let complete = part.is_complete();
            if !complete {
                warn!(
                    "Dropping incomplete range part: range={}, expected={}, actual={}",
                    range,
                    range.size(),
                    part.content.len()
                );
            }
            complete
        });
        if self.0.len() < 2 {
            return;
        }

        let mut merged: Vec<RangePart> = Vec::with_capacity(self.0.len());
        for part in std::mem::take(&mut self.0).into_values() {
            match merged.last_mut() {
                Some(prev) if part.range.start <= prev.range.end + 1 => {
                    if part.range.end <= prev.range.end {
                        continue;
                    }
                    let skip = (prev.range.end + 1 - part.range.start) as usize;
                    let mut content = BytesMut::with_capacity(
                        (part.range.end - prev.range.start + 1).max(0) as usize,
                    );
                    content.extend_from_slice(&prev.content);
                    content.extend_from_slice(part.content.get(skip..).unwrap_or_default());
                    prev.range.end = part.range.end;
                    prev.content = content.freeze();
                }
                _ => merged.push(part),
            }
        }

        self.0 = merged.into_iter().map(|p| (p.range, p)).collect();
    }

    /// Convert to the string-keyed form used by serializers
    pub fn packable(&self) -> BTreeMap<String, RangePart> {
        self.0
            .iter()
            .map(|(r, p)| (r.to_string(), p.clone()))
            .collect()
    }

    /// Rebuild from the string-keyed stored form
    pub fn from_packable(stored: &BTreeMap<String, RangePart>) -> Self {
        RangeParts(stored.values().map(|p| (p.range, p.clone())).collect())
    }

    /// Render the parts as a response body
    ///
    /// One part produces its raw content with `Content-Type` and
    /// `Content-Range` headers. Several parts produce a
    /// `multipart/byteranges` body whose boundary is the md5 of the range list.
    pub fn body(&self, full_length: i64, content_type: &str) -> (HeaderMap, Bytes) {
        let mut headers = HeaderMap::new();
        if self.is_empty() {
            return (headers, Bytes::new());
        }

        if self.len() == 1 {
            if let Some(part) = self.iter().next() {
                insert_header(&mut headers, CONTENT_TYPE, content_type);
                insert_header(
                    &mut headers,
                    CONTENT_RANGE,
                    &part.range.content_range_header(full_length),
                );
                return (headers, part.content.clone());
            }
        }

        let boundary = format!("{:x}", md5::compute(self.ranges().to_string()));
        let size: usize = self.iter().map(|p| p.content.len() + 128).sum();
        let mut out = BytesMut::with_capacity(size);

        for (i, part) in self.iter().enumerate() {
            if i > 0 {
                out.put_slice(b"\r\n");
            }
            out.put_slice(format!("--{}\r\n", boundary).as_bytes());
            out.put_slice(
                format!(
                    "Content-Range: {}\r\n",
                    part.range.content_range_header(full_length)
                )
                .as_bytes(),
            );
            out.put_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
            out.put_slice(&part.content);
        }
        out.put_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        insert_header(
            &mut headers,
            CONTENT_TYPE,
            &format!("{}; boundary={}", MULTIPART_BYTERANGES, boundary),
        );
        (headers, out.freeze())
    }

    /// Cut the wanted ranges out of the held parts and render them
    ///
    /// With no parts, `fallback` is treated as the complete object and its
    /// length replaces `full_length`. Each wanted range must be covered by a
    /// single part; otherwise the cached content cannot answer the request.
    pub fn extract_response_range(
        &self,
        wanted: &ByteRanges,
        full_length: i64,
        content_type: &str,
        fallback: &Bytes,
    ) -> Result<(HeaderMap, Bytes)> {
        if wanted.is_empty() {
            return Ok((HeaderMap::new(), fallback.clone()));
        }

        let use_body = self.is_empty();
        let full_length = if use_body {
            fallback.len() as i64
        } else {
            full_length
        };

        let mut out = RangeParts::new();
        for r in wanted.resolve(full_length).iter() {
            let content = if use_body {
                if r.start < 0 || r.start > r.end || r.end >= full_length {
                    return Err(CacheError::InvalidRange(format!(
                        "range {} is outside of content length {}",
                        r, full_length
                    )));
                }
                fallback.slice(r.start as usize..(r.end + 1) as usize)
            } else {
                let part = self
                    .iter()
                    .find(|p| p.range.contains(r))
                    .ok_or_else(|| {
                        CacheError::ReconstructionError(format!(
                            "no cached part covers range {}",
                            r
                        ))
                    })?;
                let start = (r.start - part.range.start) as usize;
                let end = (r.end - part.range.start + 1) as usize;
                part.content.get(start..end).map(|_| part.content.slice(start..end)).ok_or_else(|| {
                    CacheError::ReconstructionError(format!(
                        "cached part {} holds {} bytes, too short for {}",
                        part.range,
                        part.content.len(),
                        r
                    ))
                })?
            };
            out.insert(RangePart::new(*r, content));
        }

        Ok(out.body(full_length, content_type))
    }
}

impl FromIterator<RangePart> for RangeParts {
    fn from_iter<I: IntoIterator<Item = RangePart>>(iter: I) -> Self {
        RangeParts(iter.into_iter().map(|p| (p.range, p)).collect())
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

/// A single part of a multipart body
#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub headers: HeaderMap,
    pub content: Bytes,
}

/// Extract the `boundary` parameter from a multipart content type
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Split a multipart body into its parts
pub fn parse_multipart(body: &Bytes, boundary: &str) -> Result<Vec<MultipartPart>> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let malformed = |what: &str| CacheError::ParseError(format!("malformed multipart body: {}", what));

    let mut parts = Vec::new();
    let mut pos = find(body, delimiter, 0).ok_or_else(|| malformed("missing boundary"))?;

    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            break;
        }
        let line_end = find(body, b"\n", pos).ok_or_else(|| malformed("truncated boundary line"))?;
        let header_start = line_end + 1;

        let (header_end, content_start) = if body[header_start..].starts_with(b"\r\n") {
            (header_start, header_start + 2)
        } else if body[header_start..].starts_with(b"\n") {
            (header_start, header_start + 1)
        } else {
            match find(body, b"\r\n\r\n", header_start) {
                Some(i) => (i, i + 4),
                None => {
                    let i = find(body, b"\n\n", header_start)
                        .ok_or_else(|| malformed("unterminated part headers"))?;
                    (i, i + 2)
                }
            }
        };

        let mut headers = HeaderMap::new();
        let raw_headers = String::from_utf8_lossy(&body[header_start..header_end]);
        for line in raw_headers.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| malformed("invalid part header"))?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| malformed("invalid part header name"))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|_| malformed("invalid part header value"))?;
            headers.append(name, value);
        }

        let next = find(body, delimiter, content_start)
            .ok_or_else(|| malformed("missing closing boundary"))?;
        let mut content_end = next;
        if content_end >= 2 && &body[content_end - 2..content_end] == b"\r\n" {
            content_end -= 2;
        } else if content_end >= 1 && body[content_end - 1] == b'\n' {
            content_end -= 1;
        }
        let content_end = content_end.max(content_start);

        parts.push(MultipartPart {
            headers,
            content: body.slice(content_start..content_end),
        });
        pos = next;
    }

    Ok(parts)
}

/// Parse a `multipart/byteranges` response body
///
/// # Returns
/// The parts, the content type declared by the parts, their ranges, and the
/// full content length taken from their `Content-Range` headers. A content
/// type that is not `multipart/byteranges` yields an empty result.
pub fn parse_multipart_range_response_body(
    body: &Bytes,
    content_type: &str,
) -> Result<(RangeParts, String, ByteRanges, i64)> {
    let mut parts = RangeParts::new();
    let mut ranges = ByteRanges::default();
    let mut full_length = -1;
    let mut part_type = String::new();

    if !content_type.starts_with(MULTIPART_BYTERANGES) {
        return Ok((parts, part_type, ranges, full_length));
    }
    let boundary = match boundary_from_content_type(content_type) {
        Some(b) => b,
        None => return Ok((parts, part_type, ranges, full_length)),
    };

    for part in parse_multipart(body, &boundary)? {
        let content_range = match part.headers.get(CONTENT_RANGE) {
            Some(v) => v
                .to_str()
                .map_err(|e| CacheError::ParseError(format!("invalid Content-Range: {}", e)))?,
            None => continue,
        };
        let (range, total) = parse_content_range_header(content_range)?;
        if part.content.len() as i64 != range.size() {
            return Err(CacheError::ParseError(format!(
                "part {} holds {} bytes",
                range,
                part.content.len()
            )));
        }
        if part_type.is_empty() {
            if let Some(ct) = part.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
                part_type = ct.to_string();
            }
        }
        full_length = total;
        ranges.push(range);
        parts.insert(RangePart::new(range, part.content));
    }

    Ok((parts, part_type, ranges, full_length))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(start: i64, end: i64, content: &str) -> RangePart {
        RangePart::new(ByteRange::new(start, end), Bytes::copy_from_slice(content.as_bytes()))
    }

    #[test]
    fn test_compress_adjacent() {
        let mut parts: RangeParts = vec![part(0, 4, "01234"), part(5, 9, "56789"), part(20, 22, "klm")]
            .into_iter()
            .collect();
        parts.compress();

        assert_eq!(parts.len(), 2);
        let first = parts.get(&ByteRange::new(0, 9)).unwrap();
        assert_eq!(first.content.as_ref(), b"0123456789");
        assert!(parts.get(&ByteRange::new(20, 22)).is_some());
    }

    #[test]
    fn test_compress_overlapping() {
        let mut parts: RangeParts = vec![part(0, 5, "012345"), part(3, 8, "345678"), part(4, 5, "45")]
            .into_iter()
            .collect();
        parts.compress();

        assert_eq!(parts.len(), 1);
        assert_eq!(
            parts.get(&ByteRange::new(0, 8)).unwrap().content.as_ref(),
            b"012345678"
        );
    }

    #[test]
    fn test_merge() {
        let mut a: RangeParts = vec![part(0, 4, "abcde")].into_iter().collect();
        let b: RangeParts = vec![part(5, 6, "fg"), part(10, 11, "kl")].into_iter().collect();
        a.merge(b);
        assert_eq!(
            a.ranges(),
            ByteRanges(vec![ByteRange::new(0, 6), ByteRange::new(10, 11)])
        );
    }

    #[test]
    fn test_body_single_part() {
        let parts: RangeParts = vec![part(10, 14, "hello")].into_iter().collect();
        let (headers, body) = parts.body(100, "text/plain");
        assert_eq!(body.as_ref(), b"hello");
        assert_eq!(headers.get(CONTENT_RANGE).unwrap(), "bytes 10-14/100");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn test_body_multipart_roundtrip() {
        let parts: RangeParts = vec![part(0, 4, "hello"), part(10, 14, "world")]
            .into_iter()
            .collect();
        let (headers, body) = parts.body(100, "text/plain");

        let ct = headers.get(CONTENT_TYPE).unwrap().to_str().unwrap().to_string();
        assert!(ct.starts_with(MULTIPART_BYTERANGES));
        let expected = format!("{:x}", md5::compute("bytes=0-4, 10-14"));
        assert_eq!(boundary_from_content_type(&ct).unwrap(), expected);

        let (parsed, part_type, ranges, cl) = parse_multipart_range_response_body(&body, &ct).unwrap();
        assert_eq!(parsed, parts);
        assert_eq!(part_type, "text/plain");
        assert_eq!(ranges.len(), 2);
        assert_eq!(cl, 100);
    }

    #[test]
    fn test_extract_from_parts() {
        let parts: RangeParts = vec![part(0, 9, "0123456789"), part(20, 29, "abcdefghij")]
            .into_iter()
            .collect();

        let wanted = ByteRanges(vec![ByteRange::new(2, 4)]);
        let (headers, body) = parts
            .extract_response_range(&wanted, 30, "text/plain", &Bytes::new())
            .unwrap();
        assert_eq!(body.as_ref(), b"234");
        assert_eq!(headers.get(CONTENT_RANGE).unwrap(), "bytes 2-4/30");

        let wanted = ByteRanges(vec![ByteRange::new(5, 25)]);
        assert!(parts
            .extract_response_range(&wanted, 30, "text/plain", &Bytes::new())
            .is_err());
    }

    #[test]
    fn test_extract_from_fallback_body() {
        let body = Bytes::from_static(b"0123456789");
        let wanted = ByteRanges(vec![ByteRange::new(-1, 3)]);
        let (headers, out) = RangeParts::new()
            .extract_response_range(&wanted, -1, "text/plain", &body)
            .unwrap();
        assert_eq!(out.as_ref(), b"789");
        assert_eq!(headers.get(CONTENT_RANGE).unwrap(), "bytes 7-9/10");

        let (headers, out) = RangeParts::new()
            .extract_response_range(&ByteRanges::default(), -1, "text/plain", &body)
            .unwrap();
        assert!(headers.is_empty());
        assert_eq!(out, body);
    }

    #[test]
    fn test_packable_roundtrip() {
        let parts: RangeParts = vec![part(0, 1, "ab"), part(5, 6, "fg")].into_iter().collect();
        let stored = parts.packable();
        assert!(stored.contains_key("0-1"));
        assert_eq!(RangeParts::from_packable(&stored), parts);
    }

    #[test]
    fn test_parse_multipart_lf_only() {
        let body = Bytes::from_static(
            b"--xyz\nContent-Range: bytes 0-2/10\nContent-Type: text/plain\n\nabc\n--xyz--\n",
        );
        let (parts, _, ranges, cl) =
            parse_multipart_range_response_body(&body, "multipart/byteranges;boundary=xyz").unwrap();
        assert_eq!(ranges, ByteRanges(vec![ByteRange::new(0, 2)]));
        assert_eq!(cl, 10);
        assert_eq!(
            parts.get(&ByteRange::new(0, 2)).unwrap().content.as_ref(),
            b"abc"
        );
    }

    #[test]
    fn test_parse_multipart_malformed() {
        let body = Bytes::from_static(b"--xyz\r\nContent-Range: bytes 0-2/10\r\n\r\nabc");
        assert!(
            parse_multipart_range_response_body(&body, "multipart/byteranges; boundary=xyz").is_err()
        );
    }

    #[test]
    fn test_non_multipart_content_type() {
        let (parts, ct, ranges, cl) =
            parse_multipart_range_response_body(&Bytes::from_static(b"abc"), "text/plain").unwrap();
        assert!(parts.is_empty());
        assert!(ct.is_empty());
        assert!(ranges.is_empty());
        assert_eq!(cl, -1);
    }

    #[test]
    fn test_compress_drops_incomplete_parts() {
        let mut parts: RangeParts = vec![part(0, 9, "AAAAA"), part(10, 19, "BBBBBBBBBB")]
            .into_iter()
            .collect();
        parts.compress();

        assert_eq!(parts.ranges(), ByteRanges(vec![ByteRange::new(10, 19)]));
        assert_eq!(
            parts.get(&ByteRange::new(10, 19)).unwrap().content.as_ref(),
            b"BBBBBBBBBB"
        );
    }

    #[test]
    fn test_parse_multipart_short_part() {
        let body = Bytes::from_static(
            b"--xyz\r\nContent-Range: bytes 0-9/20\r\nContent-Type: text/plain\r\n\r\nabc\r\n--xyz--\r\n",
        );
        assert!(
            parse_multipart_range_response_body(&body, "multipart/byteranges; boundary=xyz").is_err()
        );
    }
}
