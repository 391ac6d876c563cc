//! Header Normalizer (C2).
//!
//! Strips hop-by-hop headers and `Host` before forwarding to the local upstream, and
//! optionally forces `Accept-Encoding: identity` so that §4.4's rewriter always sees
//! plaintext bodies.
//!
//! Known limitation: header *values* survive byte-for-byte, but header *names* do
//! not. `http::HeaderMap`/`HeaderName` canonicalize every name to lowercase on
//! insertion (`HeaderName::from_static` panics on anything else), so a remote-sent
//! `X-Custom-Header` reaches the local upstream as `x-custom-header`. Preserving the
//! original casing would need a parallel ordered `Vec<(String, HeaderValue)>` carried
//! alongside the `HeaderMap` used for stripping, which this crate does not build.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

const STRIPPED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Removes hop-by-hop headers and `Host`, case-insensitively. Idempotent: normalizing
/// twice is identical to normalizing once, since every stripped name is simply absent
/// the second time.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in STRIPPED {
        headers.remove(*name);
    }
}

/// Overwrites `Accept-Encoding` with `identity`, discarding whatever the inbound
/// request requested. Forcing identity upstream means C4 never has to rewrite inside
/// a compressed body.
pub fn force_identity_encoding(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("accept-encoding"),
        HeaderValue::from_static("identity"),
    );
}

/// Applies C2 to a plain `stream_id -> value` map as carried on a `REQUEST` frame,
/// producing an `http::HeaderMap` ready to attach to the upstream request. Invalid
/// header names/values from the remote are dropped rather than failing the whole
/// request — a single bad header should not sink an otherwise valid stream. Header
/// names come back lowercased regardless of how the remote cased them; see the
/// module-level note on casing.
pub fn normalize_inbound(
    raw: &std::collections::HashMap<String, String>,
    force_identity: bool,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in raw {
        let (Ok(name), Ok(val)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        headers.append(name, val);
    }
    strip_hop_by_hop(&mut headers);
    if force_identity {
        force_identity_encoding(&mut headers);
    }
    headers
}

/// Converts an `http::HeaderMap` into the plain string map carried on outbound
/// `RESPONSE` frames, lowercasing names (headers are case-insensitive, and the wire
/// format has no notion of original casing once on this side).
pub fn to_wire_map(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.insert(name.as_str().to_string(), v.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_and_host() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        headers.insert("Host", HeaderValue::from_static("example.com"));
        headers.insert("X-Custom", HeaderValue::from_static("keep-me"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("host").is_none());
        assert_eq!(headers.get("x-custom").unwrap(), "keep-me");
    }

    #[test]
    fn normalizing_twice_is_idempotent() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Custom", HeaderValue::from_static("keep-me"));
        headers.insert("Connection", HeaderValue::from_static("close"));
        strip_hop_by_hop(&mut headers);
        let once = headers.clone();
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers, once);
    }

    #[test]
    fn force_identity_overwrites_inbound_value() {
        let mut headers = HeaderMap::new();
        headers.insert("Accept-Encoding", HeaderValue::from_static("gzip, br"));
        force_identity_encoding(&mut headers);
        assert_eq!(headers.get("accept-encoding").unwrap(), "identity");
    }

    #[test]
    fn normalize_inbound_drops_invalid_header_names() {
        let mut raw = std::collections::HashMap::new();
        raw.insert("X-Ok".to_string(), "yes".to_string());
        raw.insert("Bad Name".to_string(), "value".to_string());
        let headers = normalize_inbound(&raw, false);
        assert_eq!(headers.get("x-ok").unwrap(), "yes");
        assert_eq!(headers.len(), 1);
    }
}
