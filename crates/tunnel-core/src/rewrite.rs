//! URL Rewriter (C4).
//!
//! Turns `localhost:<port>` references inside rewritable text bodies into
//! `<worker_id>-p<port>.<tunnel_domain>` host labels, so that cross-port links served
//! by a local app keep working once fetched back through the tunnel. Charset-aware:
//! decodes with the response's declared charset, rewrites the decoded text, and
//! re-encodes with the same codec so non-UTF-8 bodies are not corrupted.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

use crate::policy::PortPolicy;

const REWRITABLE_CONTENT_TYPES: &[&str] = &[
    "text/html",
    "text/css",
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
    "text/xml",
    "application/xml",
    "application/json",
    "text/plain",
];

/// True if the first `;`-delimited token of `content_type`, lowercased and trimmed,
/// is in the fixed rewritable allow-list.
pub fn is_rewritable_content_type(content_type: &str) -> bool {
    let first = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    REWRITABLE_CONTENT_TYPES.contains(&first.as_str())
}

fn parse_charset_label(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|part| {
        let part = part.trim();
        part.to_ascii_lowercase()
            .strip_prefix("charset=")
            .map(|v| v.trim_matches('"').trim().to_string())
    })
}

/// Maps a declared charset label to the codec used to decode/re-encode the body.
/// Unrecognized labels fall back to UTF-8 with a warning, per §4.4.
fn charset_encoding(content_type: &str) -> &'static Encoding {
    match parse_charset_label(content_type).as_deref() {
        Some("utf-8") | Some("utf8") => UTF_8,
        // WHATWG maps the "iso-8859-1"/"latin1" labels onto windows-1252, which (unlike
        // true ISO-8859-1) assigns every byte 0..=255 a code point, so decode/encode is
        // still a clean round trip for the bytes this tunnel ever sees.
        Some("iso-8859-1") | Some("latin1") => WINDOWS_1252,
        Some("ascii") | Some("us-ascii") => UTF_8,
        Some(other) => {
            tracing::warn!(charset = other, "unrecognized charset, defaulting to utf-8");
            UTF_8
        }
        None => UTF_8,
    }
}

/// Rewrites `localhost:<port>` occurrences in decoded text. Rule order:
/// 1. `http://localhost:P` becomes `https://<worker_id>-p<P>.<tunnel_domain>` when
///    `use_https` is set.
/// 2. Any remaining `localhost:P` not preceded by `.` becomes
///    `<worker_id>-p<P>.<tunnel_domain>` (no scheme change).
/// 3. `P` must pass the port policy; unlisted ports are left literal.
fn rewrite_text(input: &str, worker_id: &str, tunnel_domain: &str, use_https: bool, policy: &PortPolicy) -> String {
    const NEEDLE: &str = "localhost:";
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0usize;

    for (idx, _) in input.match_indices(NEEDLE) {
        if idx < last_end {
            continue;
        }
        let digits_start = idx + NEEDLE.len();
        let digits_end = input[digits_start..]
            .find(|c: char| !c.is_ascii_digit())
            .map(|off| digits_start + off)
            .unwrap_or(input.len());
        if digits_end == digits_start {
            continue;
        }
        let Ok(port) = input[digits_start..digits_end].parse::<u16>() else {
            continue;
        };
        if !policy.is_allowed(port) {
            continue;
        }

        let preceded_by_http = idx >= 7 && &input[idx - 7..idx] == "http://";
        if preceded_by_http && use_https {
            let match_start = idx - 7;
            out.push_str(&input[last_end..match_start]);
            out.push_str("https://");
            push_host_label(&mut out, worker_id, port, tunnel_domain);
            last_end = digits_end;
            continue;
        }

        let preceded_by_dot = idx > 0 && input[..idx].ends_with('.');
        if preceded_by_dot {
            continue;
        }

        out.push_str(&input[last_end..idx]);
        push_host_label(&mut out, worker_id, port, tunnel_domain);
        last_end = digits_end;
    }
    out.push_str(&input[last_end..]);
    out
}

fn push_host_label(out: &mut String, worker_id: &str, port: u16, tunnel_domain: &str) {
    out.push_str(worker_id);
    out.push_str("-p");
    out.push_str(&port.to_string());
    out.push('.');
    out.push_str(tunnel_domain);
}

/// Applies C4 to one response body chunk. Returns the bytes unchanged when rewriting
/// is disabled (`worker_id` absent), the content type isn't rewritable, decoding fails,
/// or the decoded text contains no rewrite targets.
pub fn rewrite_chunk(
    bytes: &[u8],
    content_type: &str,
    worker_id: Option<&str>,
    tunnel_domain: &str,
    use_https: bool,
    policy: &PortPolicy,
) -> Vec<u8> {
    let Some(worker_id) = worker_id else {
        return bytes.to_vec();
    };
    if !is_rewritable_content_type(content_type) {
        return bytes.to_vec();
    }

    let encoding = charset_encoding(content_type);
    let (decoded, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::warn!(content_type, "failed to decode body for url rewriting, passing through unchanged");
        return bytes.to_vec();
    }

    let rewritten = rewrite_text(&decoded, worker_id, tunnel_domain, use_https, policy);
    if rewritten == decoded {
        return bytes.to_vec();
    }
    let (encoded, _, _) = encoding.encode(&rewritten);
    encoded.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn policy_allowing(ports: &[u16]) -> PortPolicy {
        PortPolicy::new(ports.to_vec(), HashMap::new())
    }

    #[test]
    fn rewritable_content_type_matches_allow_list() {
        assert!(is_rewritable_content_type("text/html; charset=utf-8"));
        assert!(is_rewritable_content_type("APPLICATION/JSON"));
        assert!(!is_rewritable_content_type("image/png"));
        assert!(!is_rewritable_content_type("application/octet-stream"));
    }

    #[test]
    fn rewrites_http_scheme_to_https_when_requested() {
        let policy = policy_allowing(&[3000]);
        let body = br#"<a href="http://localhost:3000/x">"#;
        let out = rewrite_chunk(
            body,
            "text/html",
            Some("w1"),
            "worker.localhost:4000",
            true,
            &policy,
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"<a href="https://w1-p3000.worker.localhost:4000/x">"#
        );
    }

    #[test]
    fn leaves_subdomain_references_untouched() {
        let policy = policy_allowing(&[3000]);
        let body = b"worker.localhost:3000/x";
        let out = rewrite_chunk(body, "text/plain", Some("w1"), "tunnel.example", false, &policy);
        assert_eq!(out, body);
    }

    #[test]
    fn no_occurrences_yields_byte_identical_output() {
        let policy = policy_allowing(&[3000]);
        let body = b"nothing to rewrite here";
        let out = rewrite_chunk(body, "text/plain", Some("w1"), "tunnel.example", false, &policy);
        assert_eq!(out, body);
    }

    #[test]
    fn disallowed_port_is_left_literal() {
        let policy = policy_allowing(&[3000]);
        let body = b"http://localhost:9999/x";
        let out = rewrite_chunk(body, "text/plain", Some("w1"), "tunnel.example", true, &policy);
        assert_eq!(out, body);
    }

    #[test]
    fn worker_id_absent_disables_rewriting() {
        let policy = policy_allowing(&[]);
        let body = b"http://localhost:3000/x";
        let out = rewrite_chunk(body, "text/html", None, "tunnel.example", true, &policy);
        assert_eq!(out, body);
    }

    #[test]
    fn non_rewritable_content_type_passes_through() {
        let policy = policy_allowing(&[]);
        let body = b"http://localhost:3000/x";
        let out = rewrite_chunk(body, "image/png", Some("w1"), "tunnel.example", true, &policy);
        assert_eq!(out, body);
    }

    #[test]
    fn rewrite_is_idempotent_on_its_own_output() {
        let policy = policy_allowing(&[3000]);
        let body = br#"<a href="http://localhost:3000/x">"#;
        let once = rewrite_chunk(body, "text/html", Some("w1"), "worker.localhost:4000", true, &policy);
        let twice = rewrite_chunk(&once, "text/html", Some("w1"), "worker.localhost:4000", true, &policy);
        assert_eq!(once, twice);
    }

    #[test]
    fn latin1_body_round_trips_through_decode_reencode() {
        let policy = policy_allowing(&[]);
        // 0xE9 is e-acute in windows-1252/latin1.
        let body = vec![b'c', b'a', 0xE9, b' ', b'h', b'i'];
        let out = rewrite_chunk(&body, "text/plain; charset=iso-8859-1", Some("w1"), "tunnel.example", false, &policy);
        assert_eq!(out, body);
    }
}
