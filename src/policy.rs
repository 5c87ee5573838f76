//! HTTP caching policy (RFC 7234 freshness and validation)
//!
//! A [`CachingPolicy`] is derived from an origin response to decide whether
//! and for how long an object may be cached, and from a client request to
//! capture `no-cache` directives and conditional headers. The client
//! conditional fields are transient: they are never serialized with a
//! cached document.

use crate::headers::{
    self, CACHE_CONTROL, DATE, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    IF_UNMODIFIED_SINCE, LAST_MODIFIED, PRAGMA, SET_COOKIE,
};
use crate::status::LookupStatus;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Freshness and validation state of a cached object or client request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachingPolicy {
    pub is_fresh: bool,
    pub no_cache: bool,
    pub no_transform: bool,
    pub can_revalidate: bool,
    pub must_revalidate: bool,
    pub is_negative_cache: bool,

    /// Seconds the object stays fresh; negative means do not cache
    pub freshness_lifetime: i64,

    pub last_modified: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub date: Option<DateTime<Utc>>,
    pub local_date: Option<DateTime<Utc>>,
    pub etag: String,

    #[serde(skip)]
    pub if_none_match_value: String,
    #[serde(skip)]
    pub if_modified_since: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub if_unmodified_since: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub has_if_none_match: bool,
    #[serde(skip)]
    pub has_if_modified_since: bool,
    #[serde(skip)]
    pub has_if_unmodified_since: bool,
    #[serde(skip)]
    pub is_client_conditional: bool,
    #[serde(skip)]
    pub is_client_fresh: bool,
    #[serde(skip)]
    pub if_none_match_result: bool,
}

impl CachingPolicy {
    /// Derive the caching policy of an origin response
    ///
    /// A missing or unparseable `Date` header is replaced in `headers` with
    /// the local time.
    ///
    /// # Arguments
    /// * `status` - Response status code
    /// * `negative_cache` - Lifetimes for status codes that are cached regardless of headers
    /// * `headers` - Response headers
    pub fn from_response(
        status: u16,
        negative_cache: &HashMap<u16, Duration>,
        headers: &mut HeaderMap,
    ) -> Self {
        let now = Utc::now();
        let mut cp = CachingPolicy {
            local_date: Some(now),
            ..Default::default()
        };

        if let Some(ttl) = negative_cache.get(&status) {
            cp.freshness_lifetime = ttl.as_secs() as i64;
            cp.expires = chrono::Duration::from_std(*ttl).ok().map(|d| now + d);
            cp.is_negative_cache = true;
            return cp;
        }

        if headers.contains_key(SET_COOKIE) {
            cp.no_cache = true;
            cp.freshness_lifetime = -1;
            return cp;
        }

        if let Some(cc) = headers::get_str(headers, CACHE_CONTROL) {
            cp.parse_cache_control_directives(cc);
        }
        if cp.no_cache {
            cp.freshness_lifetime = -1;
            return cp;
        }

        let last_modified = headers::get_str(headers, LAST_MODIFIED).map(str::to_string);
        let expires = headers::get_str(headers, EXPIRES).map(str::to_string);
        let etag = headers::get_str(headers, ETAG).map(str::to_string);

        if last_modified.is_none() && expires.is_none() && etag.is_none() && cp.freshness_lifetime == 0 {
            cp.no_cache = true;
            cp.freshness_lifetime = -1;
            return cp;
        }

        let date = match headers::get_str(headers, DATE).and_then(headers::parse_http_date) {
            Some(d) => d,
            None => {
                headers::set_str(headers, DATE, &headers::format_http_date(now));
                now
            }
        };
        cp.date = Some(date);

        if cp.freshness_lifetime == 0 && !cp.must_revalidate {
            if let Some(expires) = &expires {
                match headers::parse_http_date(expires) {
                    Some(exp) if exp >= date => {
                        cp.expires = Some(exp);
                        cp.freshness_lifetime = (exp - date).num_seconds();
                    }
                    Some(exp) => {
                        cp.expires = Some(exp);
                        cp.freshness_lifetime = -1;
                        cp.must_revalidate = true;
                    }
                    None => {
                        cp.freshness_lifetime = -1;
                        cp.must_revalidate = true;
                    }
                }
            }
        }

        if etag.is_none() && last_modified.is_none() {
            cp.can_revalidate = false;
            return cp;
        }
        cp.can_revalidate = true;

        if let Some(etag) = etag {
            cp.etag = etag;
        }

        if let Some(lm) = &last_modified {
            match headers::parse_http_date(lm) {
                Some(lm) => cp.last_modified = Some(lm),
                None => {
                    cp.can_revalidate = false;
                    cp.freshness_lifetime = -1;
                }
            }
        }

        // heuristic freshness: a fifth of the object's age at response time
        if cp.can_revalidate && cp.freshness_lifetime == 0 && !cp.must_revalidate {
            if let Some(lm) = cp.last_modified.filter(|lm| *lm < date) {
                let age = (date - lm).num_seconds();
                if age > 0 {
                    cp.freshness_lifetime = age / 5;
                }
            }
        }

        cp
    }

    /// Derive the caching policy expressed by a client request
    pub fn from_request(headers: &HeaderMap) -> Self {
        let mut cp = CachingPolicy {
            local_date: Some(Utc::now()),
            ..Default::default()
        };

        if headers::get_str(headers, PRAGMA).is_some_and(|v| v.trim().eq_ignore_ascii_case("no-cache")) {
            cp.no_cache = true;
            return cp;
        }

        if let Some(cc) = headers::get_str(headers, CACHE_CONTROL) {
            cp.parse_cache_control_directives(cc);
            if cp.no_cache {
                return cp;
            }
        }

        cp.if_modified_since = headers::get_str(headers, IF_MODIFIED_SINCE).and_then(headers::parse_http_date);
        cp.if_unmodified_since = headers::get_str(headers, IF_UNMODIFIED_SINCE).and_then(headers::parse_http_date);
        if let Some(inm) = headers::get_str(headers, IF_NONE_MATCH) {
            cp.if_none_match_value = inm.to_string();
        }

        cp
    }

    fn parse_cache_control_directives(&mut self, directives: &str) {
        let directives = directives.to_ascii_lowercase().replace(' ', "");
        let mut has_shared_max_age = false;
        let mut found_freshness_directive = false;

        for directive in directives.split(',') {
            let (name, value) = match directive.split_once('=') {
                Some((n, v)) if !n.is_empty() => (n, v),
                _ => (directive, ""),
            };

            if matches!(name, "private" | "no-cache" | "no-store") {
                self.no_cache = true;
                self.freshness_lifetime = -1;
                return;
            }

            if name == "s-maxage" && !value.is_empty() {
                found_freshness_directive = true;
                if let Ok(secs) = value.trim_matches('"').parse::<i64>() {
                    has_shared_max_age = true;
                    self.freshness_lifetime = secs;
                }
            }
            if !has_shared_max_age && name == "max-age" && !value.is_empty() {
                found_freshness_directive = true;
                if let Ok(secs) = value.trim_matches('"').parse::<i64>() {
                    self.freshness_lifetime = secs;
                }
            }

            if matches!(name, "must-revalidate" | "proxy-revalidate")
                || (self.freshness_lifetime == 0 && found_freshness_directive)
            {
                self.must_revalidate = true;
                self.freshness_lifetime = 0;
            }

            if name == "no-transform" {
                self.no_transform = true;
            }
        }
    }

    /// Fold a newer policy into this one, keeping this policy's client conditionals
    pub fn merge(&mut self, src: &CachingPolicy) {
        self.no_cache |= src.no_cache;
        self.no_transform |= src.no_transform;
        self.is_client_conditional |= src.is_client_conditional;
        self.is_client_fresh |= src.is_client_fresh;
        self.is_negative_cache |= src.is_negative_cache;

        self.is_fresh = src.is_fresh;
        self.freshness_lifetime = src.freshness_lifetime;
        self.can_revalidate = src.can_revalidate;
        self.must_revalidate = src.must_revalidate;
        self.last_modified = src.last_modified;
        self.expires = src.expires;
        self.date = src.date;
        self.local_date = src.local_date;
        self.etag = src.etag.clone();
    }

    /// Time to keep the object in cache
    ///
    /// Revalidatable objects are kept `multiplier` times longer than their
    /// freshness lifetime so a stale copy can still be revalidated.
    pub fn ttl(&self, multiplier: f64, max: Duration) -> Duration {
        if self.freshness_lifetime <= 0 {
            return Duration::ZERO;
        }
        let mut secs = self.freshness_lifetime as f64;
        if self.can_revalidate {
            secs *= multiplier;
        }
        Duration::from_secs_f64(secs).min(max)
    }

    /// Whether the object is still within its freshness lifetime
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        if self.freshness_lifetime <= 0 {
            return false;
        }
        match self.local_date {
            Some(local) => (now - local).num_seconds() < self.freshness_lifetime,
            None => false,
        }
    }

    pub fn reset_client_conditionals(&mut self) {
        self.if_none_match_value.clear();
        self.if_modified_since = None;
        self.if_unmodified_since = None;
        self.has_if_none_match = false;
        self.has_if_modified_since = false;
        self.has_if_unmodified_since = false;
        self.is_client_conditional = false;
        self.is_client_fresh = false;
        self.if_none_match_result = false;
    }

    pub fn parse_client_conditionals(&mut self) {
        self.has_if_none_match = !self.if_none_match_value.is_empty();
        self.has_if_modified_since = self.if_modified_since.is_some();
        self.has_if_unmodified_since = self.if_unmodified_since.is_some();
        self.is_client_conditional =
            self.has_if_none_match || self.has_if_modified_since || self.has_if_unmodified_since;
    }

    /// Decide whether the client's copy is current, setting `is_client_fresh`
    pub fn resolve_client_conditionals(&mut self, status: LookupStatus) {
        self.is_client_fresh = false;
        if !self.is_client_conditional {
            return;
        }

        let mut fresh = true;
        if self.has_if_none_match {
            self.if_none_match_result = check_if_none_match(&self.etag, &self.if_none_match_value, status);
            fresh &= !self.if_none_match_result;
        }
        if self.has_if_modified_since {
            fresh &= match (self.last_modified, self.if_modified_since) {
                (Some(lm), Some(ims)) => lm <= ims,
                _ => false,
            };
        }
        if self.has_if_unmodified_since {
            fresh &= match (self.last_modified, self.if_unmodified_since) {
                (Some(lm), Some(ius)) => lm > ius,
                _ => false,
            };
        }
        self.is_client_fresh = fresh;
    }
}

fn opaque_tag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(tag)
}

/// Evaluate `If-None-Match` against an entity tag using weak comparison
///
/// Returns true when no listed tag matches. `*` matches any cached entity,
/// so it only counts as a match when the object came from cache.
pub fn check_if_none_match(etag: &str, header_value: &str, status: LookupStatus) -> bool {
    if etag.is_empty() || header_value.is_empty() {
        return true;
    }

    if header_value.trim() == "*" {
        return !matches!(status, LookupStatus::Hit | LookupStatus::Revalidated);
    }

    let etag = opaque_tag(etag);
    !header_value.split(',').any(|candidate| opaque_tag(candidate) == etag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::format_http_date;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn test_max_age() {
        let mut h = headers(&[(CACHE_CONTROL, "public, max-age=300")]);
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert_eq!(cp.freshness_lifetime, 300);
        assert!(!cp.no_cache);
        assert!(!cp.can_revalidate);
        assert!(h.contains_key(DATE));
    }

    #[test]
    fn test_shared_max_age_wins() {
        let mut h = headers(&[(CACHE_CONTROL, "s-maxage=60, max-age=300")]);
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert_eq!(cp.freshness_lifetime, 60);
    }

    #[test]
    fn test_no_store() {
        let mut h = headers(&[(CACHE_CONTROL, "no-store"), (ETAG, "\"abc\"")]);
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert!(cp.no_cache);
        assert_eq!(cp.freshness_lifetime, -1);
    }

    #[test]
    fn test_set_cookie_is_uncacheable() {
        let mut h = headers(&[(SET_COOKIE, "a=b"), (CACHE_CONTROL, "max-age=60")]);
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert!(cp.no_cache);
        assert_eq!(cp.freshness_lifetime, -1);
    }

    #[test]
    fn test_no_validators_no_lifetime() {
        let mut h = HeaderMap::new();
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert!(cp.no_cache);
        assert_eq!(cp.freshness_lifetime, -1);
    }

    #[test]
    fn test_max_age_zero_must_revalidate() {
        let mut h = headers(&[(CACHE_CONTROL, "max-age=0"), (ETAG, "\"v1\"")]);
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert!(cp.must_revalidate);
        assert_eq!(cp.freshness_lifetime, 0);
        assert!(cp.can_revalidate);
        assert_eq!(cp.etag, "\"v1\"");
    }

    #[test]
    fn test_heuristic_freshness() {
        let now = Utc::now();
        let lm = now - chrono::Duration::hours(5);
        let mut h = headers(&[
            (DATE, &format_http_date(now)),
            (LAST_MODIFIED, &format_http_date(lm)),
        ]);
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert!(cp.can_revalidate);
        assert_eq!(cp.freshness_lifetime, 3600);
    }

    #[test]
    fn test_expires() {
        let now = Utc::now();
        let mut h = headers(&[
            (DATE, &format_http_date(now)),
            (EXPIRES, &format_http_date(now + chrono::Duration::seconds(120))),
        ]);
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert_eq!(cp.freshness_lifetime, 120);

        let mut h = headers(&[(DATE, &format_http_date(now)), (EXPIRES, "0")]);
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert_eq!(cp.freshness_lifetime, -1);
        assert!(cp.must_revalidate);
    }

    #[test]
    fn test_bad_last_modified() {
        let mut h = headers(&[(CACHE_CONTROL, "max-age=60"), (LAST_MODIFIED, "yesterday")]);
        let cp = CachingPolicy::from_response(200, &HashMap::new(), &mut h);
        assert!(!cp.can_revalidate);
        assert_eq!(cp.freshness_lifetime, -1);
    }

    #[test]
    fn test_negative_cache() {
        let mut nc = HashMap::new();
        nc.insert(404u16, Duration::from_secs(30));
        let mut h = headers(&[(CACHE_CONTROL, "no-store")]);
        let cp = CachingPolicy::from_response(404, &nc, &mut h);
        assert!(cp.is_negative_cache);
        assert_eq!(cp.freshness_lifetime, 30);
    }

    #[test]
    fn test_request_policy() {
        let cp = CachingPolicy::from_request(&headers(&[(PRAGMA, "no-cache")]));
        assert!(cp.no_cache);

        let cp = CachingPolicy::from_request(&headers(&[(CACHE_CONTROL, "no-cache")]));
        assert!(cp.no_cache);

        let mut cp = CachingPolicy::from_request(&headers(&[
            (IF_NONE_MATCH, "\"abc\""),
            (IF_MODIFIED_SINCE, "Wed, 21 Oct 2015 07:28:00 GMT"),
        ]));
        assert!(!cp.no_cache);
        cp.parse_client_conditionals();
        assert!(cp.is_client_conditional);
        assert!(cp.has_if_none_match);
        assert!(cp.has_if_modified_since);
        assert!(!cp.has_if_unmodified_since);
    }

    #[test]
    fn test_resolve_client_conditionals() {
        let mut cp = CachingPolicy::from_request(&headers(&[(IF_NONE_MATCH, "W/\"abc\", \"def\"")]));
        cp.etag = "\"def\"".to_string();
        cp.parse_client_conditionals();
        cp.resolve_client_conditionals(LookupStatus::KeyMiss);
        assert!(cp.is_client_fresh);
        assert!(!cp.if_none_match_result);

        cp.etag = "\"xyz\"".to_string();
        cp.resolve_client_conditionals(LookupStatus::Hit);
        assert!(!cp.is_client_fresh);
    }

    #[test]
    fn test_if_none_match_star() {
        assert!(!check_if_none_match("\"a\"", "*", LookupStatus::Hit));
        assert!(!check_if_none_match("\"a\"", "*", LookupStatus::Revalidated));
        assert!(check_if_none_match("\"a\"", "*", LookupStatus::KeyMiss));
        assert!(check_if_none_match("", "\"a\"", LookupStatus::Hit));
    }

    #[test]
    fn test_reset_client_conditionals_idempotent() {
        let mut cp = CachingPolicy::from_request(&headers(&[(IF_NONE_MATCH, "\"abc\"")]));
        cp.parse_client_conditionals();
        cp.reset_client_conditionals();
        let once = cp.clone();
        cp.reset_client_conditionals();
        assert_eq!(cp, once);
        assert!(!cp.is_client_conditional);
        assert!(cp.if_none_match_value.is_empty());
    }

    #[test]
    fn test_merge_keeps_request_conditionals() {
        let mut subject = CachingPolicy::from_request(&headers(&[(IF_NONE_MATCH, "\"abc\"")]));
        subject.parse_client_conditionals();
        let src = CachingPolicy {
            freshness_lifetime: 90,
            etag: "\"new\"".to_string(),
            no_transform: true,
            ..Default::default()
        };
        subject.merge(&src);
        assert_eq!(subject.freshness_lifetime, 90);
        assert_eq!(subject.etag, "\"new\"");
        assert!(subject.no_transform);
        assert_eq!(subject.if_none_match_value, "\"abc\"");
        assert!(subject.is_client_conditional);
    }

    #[test]
    fn test_ttl() {
        let max = Duration::from_secs(86400);
        let cp = CachingPolicy {
            freshness_lifetime: 100,
            can_revalidate: true,
            ..Default::default()
        };
        assert_eq!(cp.ttl(2.0, max), Duration::from_secs(200));
        assert_eq!(cp.ttl(2.0, Duration::from_secs(150)), Duration::from_secs(150));

        let cp = CachingPolicy {
            freshness_lifetime: 100,
            ..Default::default()
        };
        assert_eq!(cp.ttl(2.0, max), Duration::from_secs(100));
    }
}
