//! Cache key derivation

use crate::config::PathConfig;
use crate::headers::{self, AUTHORIZATION, APPLICATION_JSON, CONTENT_TYPE, FORM_URLENCODED, MULTIPART_FORM_DATA};
use crate::multipart::{boundary_from_content_type, parse_multipart};
use crate::pool;
use bytes::Bytes;
use http::{HeaderMap, Method};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The parts of a request that can contribute to its cache key
#[derive(Debug, Clone, Copy)]
pub struct KeyRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: &'a Bytes,
}

/// Replaces the built-in key algorithm for a path
pub trait KeyHasher: Send + Sync {
    /// Returns the cache key and, optionally, a rewritten request body to
    /// send upstream in place of the original one
    fn hash(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &HeaderMap,
        body: &Bytes,
        extra: &str,
    ) -> (String, Option<Bytes>);
}

/// Shareable handle to a [`KeyHasher`] for use in configuration
#[derive(Clone)]
pub struct KeyHasherHandle(pub Arc<dyn KeyHasher>);

impl fmt::Debug for KeyHasherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyHasherHandle")
    }
}

fn has_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// First value of every parameter, by name
fn first_values(pairs: impl Iterator<Item = (String, String)>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (k, v) in pairs {
        out.entry(k).or_insert(v);
    }
    out
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

/// Form fields carried by a request body, for the content types that have them
fn body_form_values(content_type: &str, body: &Bytes, fields: &[String]) -> Option<BTreeMap<String, String>> {
    let ct = content_type.to_ascii_lowercase();
    if ct.starts_with(FORM_URLENCODED) {
        let pairs = url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()));
        Some(first_values(pairs))
    } else if ct.starts_with(MULTIPART_FORM_DATA) {
        let boundary = boundary_from_content_type(content_type)?;
        let parts = parse_multipart(body, &boundary).ok()?;
        let pairs = parts.into_iter().filter_map(|part| {
            let disposition = headers::get_str(&part.headers, "content-disposition")?;
            let name = disposition.split(';').find_map(|p| {
                p.trim().strip_prefix("name=").map(|n| n.trim_matches('"').to_string())
            })?;
            Some((name, String::from_utf8_lossy(&part.content).into_owned()))
        });
        Some(first_values(pairs))
    } else if ct.starts_with(APPLICATION_JSON) {
        let document: serde_json::Value = serde_json::from_slice(body).ok()?;
        let values: BTreeMap<String, String> = fields
            .iter()
            .filter_map(|f| deep_search(&document, f).map(|v| (f.clone(), v)))
            .collect();
        (!values.is_empty()).then_some(values)
    } else {
        None
    }
}

/// Resolve a `/`-delimited path in a JSON document to a key token value
///
/// Strings are returned verbatim, numbers with four decimals and booleans
/// as `true`/`false`. Any other value is not usable in a key.
pub fn deep_search(document: &serde_json::Value, path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let mut current = document;
    for part in path.split('/') {
        current = current.as_object()?.get(part)?;
    }
    match current {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => n.as_f64().map(|f| format!("{:.4}", f)),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Derive the cache key of a request
///
/// The key is the hex md5 of the path followed by the sorted `name.value.`
/// tokens selected by the path configuration and then `extra`. Without a
/// path configuration the defaults apply: method, `Authorization` and every
/// query parameter. A [`KeyHasher`] on the path configuration replaces the algorithm and may
/// also return a rewritten body to send upstream.
pub fn derive_cache_key(req: &KeyRequest<'_>, path_config: Option<&PathConfig>, extra: &str) -> (String, Option<Bytes>) {
    let fallback;
    let pc = match path_config {
        Some(pc) => pc,
        None => {
            fallback = PathConfig::default();
            &fallback
        }
    };

    let query = parse_query(req.query);
    if let Some(hasher) = &pc.key_hasher {
        return hasher.0.hash(req.path, &query, req.headers, req.body, extra);
    }
    let query = first_values(query.into_iter());

    let mut tokens = pool::get_key_tokens();

    if let Some(auth) = headers::get_str(req.headers, AUTHORIZATION) {
        tokens.push(format!("Authorization.{}.", auth));
    }
    tokens.push(format!("method.{}.", req.method));

    if pc.cache_key_params.len() == 1 && pc.cache_key_params[0] == "*" {
        for (name, value) in &query {
            tokens.push(format!("{}.{}.", name, value));
        }
    } else {
        for name in &pc.cache_key_params {
            if let Some(value) = query.get(name).filter(|v| !v.is_empty()) {
                tokens.push(format!("{}.{}.", name, value));
            }
        }
    }

    for name in &pc.cache_key_headers {
        if let Some(value) = headers::get_str(req.headers, name).filter(|v| !v.is_empty()) {
            tokens.push(format!("{}.{}.", name, value));
        }
    }

    if has_body(req.method) && !pc.cache_key_form_fields.is_empty() {
        let ct = headers::get_str(req.headers, CONTENT_TYPE).unwrap_or_default();
        if let Some(form) = body_form_values(ct, req.body, &pc.cache_key_form_fields) {
            for field in &pc.cache_key_form_fields {
                if let Some(value) = form.get(field).filter(|v| !v.is_empty()) {
                    tokens.push(format!("{}.{}.", field, value));
                }
            }
        }
    }

    tokens.sort();

    let mut ctx = md5::Context::new();
    ctx.consume(req.path.as_bytes());
    ctx.consume(b".");
    for token in &tokens {
        ctx.consume(token.as_bytes());
    }
    ctx.consume(extra.as_bytes());
    pool::put_key_tokens(tokens);

    (format!("{:x}", ctx.compute()), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn request<'a>(method: &'a Method, path: &'a str, query: Option<&'a str>, headers: &'a HeaderMap, body: &'a Bytes) -> KeyRequest<'a> {
        KeyRequest {
            method,
            path,
            query,
            headers,
            body,
        }
    }

    fn key(req: &KeyRequest<'_>, pc: &PathConfig) -> String {
        derive_cache_key(req, Some(pc), "").0
    }

    #[test]
    fn test_manual_key_layout() {
        let headers = HeaderMap::new();
        let body = Bytes::new();
        let req = request(&Method::GET, "/obj", Some("b=2&a=1"), &headers, &body);
        let expected = format!("{:x}", md5::compute("/obj.a.1.b.2.method.GET."));
        assert_eq!(key(&req, &PathConfig::default()), expected);
    }

    #[test]
    fn test_param_order_is_irrelevant() {
        let headers = HeaderMap::new();
        let body = Bytes::new();
        let pc = PathConfig::default();
        let a = key(&request(&Method::GET, "/x", Some("a=1&b=2"), &headers, &body), &pc);
        let b = key(&request(&Method::GET, "/x", Some("b=2&a=1"), &headers, &body), &pc);
        assert_eq!(a, b);

        let c = key(&request(&Method::GET, "/x", Some("a=1&b=3"), &headers, &body), &pc);
        assert_ne!(a, c);
    }

    #[test]
    fn test_selected_params_and_headers() {
        let pc = PathConfig {
            cache_key_params: vec!["a".to_string()],
            cache_key_headers: vec!["x-tenant".to_string()],
            ..Default::default()
        };
        let body = Bytes::new();
        let mut h1 = HeaderMap::new();
        h1.insert("x-tenant", HeaderValue::from_static("one"));
        let mut h2 = HeaderMap::new();
        h2.insert("x-tenant", HeaderValue::from_static("two"));

        let a = key(&request(&Method::GET, "/x", Some("a=1&b=2"), &h1, &body), &pc);
        let b = key(&request(&Method::GET, "/x", Some("a=1&b=9"), &h1, &body), &pc);
        let c = key(&request(&Method::GET, "/x", Some("a=1&b=2"), &h2, &body), &pc);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_authorization_and_method_distinguish() {
        let pc = PathConfig::default();
        let body = Bytes::new();
        let none = HeaderMap::new();
        let mut auth = HeaderMap::new();
        auth.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t"));

        let anon = key(&request(&Method::GET, "/x", None, &none, &body), &pc);
        let authed = key(&request(&Method::GET, "/x", None, &auth, &body), &pc);
        let head = key(&request(&Method::HEAD, "/x", None, &none, &body), &pc);
        assert_ne!(anon, authed);
        assert_ne!(anon, head);
    }

    #[test]
    fn test_json_form_fields() {
        let pc = PathConfig {
            cache_key_form_fields: vec!["query/id".to_string(), "limit".to_string()],
            ..Default::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let b1 = Bytes::from_static(br#"{"query":{"id":"abc"},"limit":10,"noise":1}"#);
        let b2 = Bytes::from_static(br#"{"query":{"id":"abc"},"limit":10,"noise":2}"#);
        let b3 = Bytes::from_static(br#"{"query":{"id":"xyz"},"limit":10}"#);

        let k1 = key(&request(&Method::POST, "/q", None, &headers, &b1), &pc);
        let k2 = key(&request(&Method::POST, "/q", None, &headers, &b2), &pc);
        let k3 = key(&request(&Method::POST, "/q", None, &headers, &b3), &pc);
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);

        // bodies of GET requests never contribute
        let g1 = key(&request(&Method::GET, "/q", None, &headers, &b1), &pc);
        let g3 = key(&request(&Method::GET, "/q", None, &headers, &b3), &pc);
        assert_eq!(g1, g3);
    }

    #[test]
    fn test_urlencoded_and_multipart_form_fields() {
        let pc = PathConfig {
            cache_key_form_fields: vec!["q".to_string()],
            ..Default::default()
        };

        let mut form = HeaderMap::new();
        form.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_URLENCODED));
        let a = key(&request(&Method::POST, "/f", None, &form, &Bytes::from_static(b"q=1&z=2")), &pc);
        let b = key(&request(&Method::POST, "/f", None, &form, &Bytes::from_static(b"z=3&q=1")), &pc);
        assert_eq!(a, b);

        let mut mp = HeaderMap::new();
        mp.insert(CONTENT_TYPE, HeaderValue::from_static("multipart/form-data; boundary=zz"));
        let body = Bytes::from_static(
            b"--zz\r\nContent-Disposition: form-data; name=\"q\"\r\n\r\n1\r\n--zz--\r\n",
        );
        let c = key(&request(&Method::POST, "/f", None, &mp, &body), &pc);
        let expected = format!("{:x}", md5::compute("/f.method.POST.q.1."));
        assert_eq!(c, expected);
    }

    #[test]
    fn test_deep_search() {
        let doc: serde_json::Value =
            serde_json::from_str(r#"{"a":{"b":{"n":1.5,"t":true,"s":"x"}},"arr":[1]}"#).unwrap();
        assert_eq!(deep_search(&doc, "a/b/n"), Some("1.5000".to_string()));
        assert_eq!(deep_search(&doc, "a/b/t"), Some("true".to_string()));
        assert_eq!(deep_search(&doc, "a/b/s"), Some("x".to_string()));
        assert_eq!(deep_search(&doc, "arr"), None);
        assert_eq!(deep_search(&doc, "a/missing"), None);
        assert_eq!(deep_search(&doc, ""), None);
    }

    struct FixedHasher;

    impl KeyHasher for FixedHasher {
        fn hash(&self, path: &str, _: &[(String, String)], _: &HeaderMap, _: &Bytes, extra: &str) -> (String, Option<Bytes>) {
            (format!("fixed{}{}", path, extra), Some(Bytes::from_static(b"rewritten")))
        }
    }

    #[test]
    fn test_key_hasher_override() {
        let pc = PathConfig {
            key_hasher: Some(KeyHasherHandle(Arc::new(FixedHasher))),
            ..Default::default()
        };
        let headers = HeaderMap::new();
        let body = Bytes::new();
        let (k, rewritten) = derive_cache_key(&request(&Method::GET, "/p", None, &headers, &body), Some(&pc), ".x");
        assert_eq!(k, "fixed/p.x");
        assert_eq!(rewritten.unwrap().as_ref(), b"rewritten");
    }

    #[test]
    fn test_no_path_config_uses_defaults() {
        let mut auth = HeaderMap::new();
        auth.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        let none = HeaderMap::new();
        let body = Bytes::new();

        let (k, _) = derive_cache_key(&request(&Method::GET, "/p", Some("a=1"), &none, &body), None, "e");
        assert_eq!(k, format!("{:x}", md5::compute("/p.a.1.method.GET.e")));

        let (other_query, _) = derive_cache_key(&request(&Method::GET, "/p", Some("a=2"), &none, &body), None, "e");
        let (other_user, _) = derive_cache_key(&request(&Method::GET, "/p", Some("a=1"), &auth, &body), None, "e");
        assert_ne!(k, other_query);
        assert_ne!(k, other_user);
    }
}
