//! Lookup status of a request and the result header that reports it

use crate::headers::{self, RESULT_HEADER};
use crate::ranges::{ByteRange, ByteRanges};
use http::HeaderMap;
use std::fmt;
use std::str::FromStr;

/// Engine name reported in the result header
pub const ENGINE_NAME: &str = "ObjectProxyCache";

/// Outcome of consulting the cache for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LookupStatus {
    Hit,
    PartialHit,
    Revalidated,
    RangeMiss,
    #[default]
    KeyMiss,
    Purge,
    ProxyError,
    ProxyOnly,
    NegativeCacheHit,
    ProxyHit,
    Error,
}

impl LookupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStatus::Hit => "hit",
            LookupStatus::PartialHit => "phit",
            LookupStatus::Revalidated => "rhit",
            LookupStatus::RangeMiss => "rmiss",
            LookupStatus::KeyMiss => "kmiss",
            LookupStatus::Purge => "purge",
            LookupStatus::ProxyError => "proxy-error",
            LookupStatus::ProxyOnly => "proxy-only",
            LookupStatus::NegativeCacheHit => "nchit",
            LookupStatus::ProxyHit => "proxy-hit",
            LookupStatus::Error => "error",
        }
    }

    /// Whether cached content was used to answer the request
    pub fn is_hit(&self) -> bool {
        matches!(
            self,
            LookupStatus::Hit
                | LookupStatus::Revalidated
                | LookupStatus::NegativeCacheHit
                | LookupStatus::ProxyHit
        )
    }
}

impl fmt::Display for LookupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LookupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "hit" => LookupStatus::Hit,
            "phit" => LookupStatus::PartialHit,
            "rhit" => LookupStatus::Revalidated,
            "rmiss" => LookupStatus::RangeMiss,
            "kmiss" => LookupStatus::KeyMiss,
            "purge" => LookupStatus::Purge,
            "proxy-error" => LookupStatus::ProxyError,
            "proxy-only" => LookupStatus::ProxyOnly,
            "nchit" => LookupStatus::NegativeCacheHit,
            "proxy-hit" => LookupStatus::ProxyHit,
            "error" => LookupStatus::Error,
            other => return Err(format!("unknown lookup status: {}", other)),
        })
    }
}

/// Parsed form of the result header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultHeaderParts {
    pub engine: String,
    pub status: String,
    pub fetched: ByteRanges,
    pub ff_status: String,
}

impl ResultHeaderParts {
    pub fn parse(value: &str) -> Self {
        let mut parts = ResultHeaderParts::default();
        for field in value.split("; ") {
            let Some((key, val)) = field.split_once('=') else {
                continue;
            };
            if key.is_empty() || val.is_empty() {
                continue;
            }
            match key {
                "engine" => parts.engine = val.to_string(),
                "status" => parts.status = val.to_string(),
                "ffstatus" => parts.ff_status = val.to_string(),
                "fetched" => {
                    parts.fetched = val
                        .trim_matches(|c| c == '[' || c == ']')
                        .split(';')
                        .filter_map(|r| {
                            let (s, e) = r.split_once('-')?;
                            Some(ByteRange::new(s.parse().ok()?, e.parse().ok()?))
                        })
                        .collect();
                }
                _ => {}
            }
        }
        parts
    }
}

impl fmt::Display for ResultHeaderParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine={}", self.engine)?;
        if !self.status.is_empty() {
            write!(f, "; status={}", self.status)?;
        }
        if !self.fetched.is_empty() {
            let fetched: Vec<String> = self.fetched.iter().map(|r| r.to_string()).collect();
            write!(f, "; fetched=[{}]", fetched.join(";"))?;
        }
        if !self.ff_status.is_empty() {
            write!(f, "; ffstatus={}", self.ff_status)?;
        }
        Ok(())
    }
}

/// Build a result header value
pub fn make_result_header(status: LookupStatus, ff_status: &str, fetched: &ByteRanges) -> String {
    ResultHeaderParts {
        engine: ENGINE_NAME.to_string(),
        status: status.as_str().to_string(),
        fetched: fetched.clone(),
        ff_status: ff_status.to_string(),
    }
    .to_string()
}

/// Set the result header on a response
pub fn set_result_header(headers: &mut HeaderMap, status: LookupStatus, ff_status: &str, fetched: &ByteRanges) {
    headers::set_str(headers, RESULT_HEADER, &make_result_header(status, ff_status, fetched));
}

/// Merge two result header values describing parts of one response
///
/// Differing statuses collapse to `phit` and fetched ranges are unioned.
pub fn merge_result_header_vals(h1: &str, h2: &str) -> String {
    if h1.is_empty() {
        return h2.to_string();
    }
    let mut r1 = ResultHeaderParts::parse(h1);
    let r2 = ResultHeaderParts::parse(h2);

    if r1.engine.is_empty() {
        r1.engine = r2.engine;
    }
    if r1.status.is_empty() {
        r1.status = r2.status;
    } else if !r2.status.is_empty() && r1.status != r2.status {
        r1.status = LookupStatus::PartialHit.as_str().to_string();
    }
    if r1.ff_status.is_empty() {
        r1.ff_status = r2.ff_status;
    } else if !r2.ff_status.is_empty() && r1.ff_status != r2.ff_status {
        r1.ff_status = LookupStatus::PartialHit.as_str().to_string();
    }
    if r1.fetched.is_empty() {
        r1.fetched = r2.fetched;
    } else {
        r1.fetched.extend(r2.fetched.iter().copied());
        r1.fetched = r1.fetched.compress();
    }
    r1.to_string()
}
