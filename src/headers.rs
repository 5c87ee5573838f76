//! Header names and helpers shared by the engine

use chrono::{DateTime, NaiveDateTime, Utc};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

pub const AUTHORIZATION: &str = "authorization";
pub const CACHE_CONTROL: &str = "cache-control";
pub const CONTENT_ENCODING: &str = "content-encoding";
pub const CONTENT_LENGTH: &str = "content-length";
pub const CONTENT_RANGE: &str = "content-range";
pub const CONTENT_TYPE: &str = "content-type";
pub const DATE: &str = "date";
pub const ETAG: &str = "etag";
pub const EXPIRES: &str = "expires";
pub const IF_MODIFIED_SINCE: &str = "if-modified-since";
pub const IF_NONE_MATCH: &str = "if-none-match";
pub const IF_UNMODIFIED_SINCE: &str = "if-unmodified-since";
pub const LAST_MODIFIED: &str = "last-modified";
pub const PRAGMA: &str = "pragma";
pub const RANGE: &str = "range";
pub const SET_COOKIE: &str = "set-cookie";
pub const TRANSFER_ENCODING: &str = "transfer-encoding";

/// Response header summarizing how the cache handled a request
pub const RESULT_HEADER: &str = "x-cache-result";

pub const MULTIPART_BYTERANGES: &str = "multipart/byteranges";
pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const APPLICATION_JSON: &str = "application/json";

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// First value of a header as a string, if present and valid
pub fn get_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Replace a header, silently skipping values that are not valid header text
pub fn set_str(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

/// Overwrite headers in `dst` with every header in `src`
pub fn merge(dst: &mut HeaderMap, src: &HeaderMap) {
    for name in src.keys() {
        dst.remove(name);
        for value in src.get_all(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Remove the client's conditional headers so the origin returns full content
pub fn strip_conditionals(headers: &mut HeaderMap) {
    headers.remove(IF_NONE_MATCH);
    headers.remove(IF_MODIFIED_SINCE);
    headers.remove(IF_UNMODIFIED_SINCE);
}

/// Format a timestamp as an RFC 7231 IMF-fixdate
pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an HTTP date, accepting IMF-fixdate and RFC 2822 forms
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, HTTP_DATE_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Serde adapter storing a `HeaderMap` as an ordered list of name/value pairs
pub mod serde_header_map {
    use http::header::{HeaderName, HeaderValue};
    use http::HeaderMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&str, &[u8])> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_bytes()))
            .collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HeaderMap, D::Error> {
        let pairs: Vec<(String, Vec<u8>)> = Vec::deserialize(deserializer)?;
        let mut headers = HeaderMap::with_capacity(pairs.len());
        for (name, value) in pairs {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(serde::de::Error::custom)?;
            let value = HeaderValue::from_bytes(&value).map_err(serde::de::Error::custom)?;
            headers.append(name, value);
        }
        Ok(headers)
    }
}
