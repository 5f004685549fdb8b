//! The flex parser for incoming proxy requests.
//!
//! Clients encode the upstream target in several tolerated ways:
//!
//! - `/proxy/http/host/path?q=1` (embedded protocol segment)
//! - `/proxy?http://host/path?q=1` and the `&`/`https` variants
//! - `/proxy/host/path` (no protocol hint at all)
//!
//! The separator table below makes the precedence explicit: pairs are tried
//! in order and the first one found in the request wins.

use portico_config::url_parts::UrlParts;

/// `(separator, protocol)` pairs, in authoritative order.
const SEPARATORS: &[(&str, &str)] = &[
    ("/http/", "http"),
    ("/https/", "https"),
    ("/*/", "*"),
    ("?http://", "http"),
    ("?https://", "https"),
    ("&http://", "http"),
    ("&https://", "https"),
];

/// A decoded incoming request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUrl {
    /// The prefix the proxy is mounted on, as sent by the client.
    pub listen_path: String,
    /// The upstream target, always with a leading slash: `/host/path`.
    pub proxy_path: String,
    /// `http`, `https`, or `*` when the request carried no protocol hint.
    pub protocol: String,
    pub query: String,
}

impl RequestUrl {
    /// Decode the literal request-line path (including any query). Returns
    /// `None` for empty input, and for input without a known listen prefix
    /// when `must_match` is set.
    pub fn parse(raw: &str, listen_uris: &[String], must_match: bool) -> Option<RequestUrl> {
        if raw.is_empty() {
            return None;
        }

        for (separator, protocol) in SEPARATORS {
            if let Some(idx) = raw.find(separator) {
                return Some(Self::assemble(
                    &raw[..idx],
                    &raw[idx + separator.len()..],
                    protocol,
                ));
            }
        }

        // No protocol hint: split after the last occurrence of a configured
        // listen prefix.
        let split_at = listen_uris
            .iter()
            .filter_map(|listen| raw.rfind(listen.as_str()).map(|idx| idx + listen.len()))
            .max();

        match split_at {
            Some(end) => Some(Self::assemble(&raw[..end], &raw[end..], "*")),
            None if must_match => None,
            None => Some(Self::assemble("", raw, "*")),
        }
    }

    fn assemble(listen_path: &str, remainder: &str, protocol: &str) -> RequestUrl {
        let rooted = if remainder.starts_with('/') {
            remainder.to_string()
        } else {
            format!("/{remainder}")
        };

        let (proxy_path, query) = match rooted.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (rooted, String::new()),
        };

        RequestUrl {
            listen_path: listen_path.to_string(),
            proxy_path,
            protocol: protocol.to_string(),
            query,
        }
    }

    /// The upstream target as URL parts, with the protocol and query carried
    /// over from the request encoding.
    pub fn target_parts(&self) -> UrlParts {
        let mut parts = UrlParts::parse(&self.proxy_path);
        parts.protocol = self.protocol.clone();
        parts.query = self.query.clone();
        parts
    }
}
