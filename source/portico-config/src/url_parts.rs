//! Lenient URL decomposition and wildcard matching.
//!
//! Rule sources and referrer entries are rarely complete URLs: they show up as
//! `https://geo.example.com/rest`, `*.example.com/maps`, `host:8443` or the
//! bare `*`. None of those survive a strict URI parser, so the decomposition
//! is done by hand and every missing component degrades to the `*` wildcard.

/// The literal wildcard used throughout rule and referrer configuration.
pub const ANY: &str = "*";

/// A decomposed URL. Any of `protocol`, `hostname`, `port` and `path` may be
/// the literal `*`, meaning "match any". The protocol carries no trailing
/// colon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub protocol: String,
    pub hostname: String,
    pub port: String,
    pub path: String,
    pub query: String,
}

impl UrlParts {
    /// Normalize a possibly partial URL.
    ///
    /// Applied in order: without a scheme the input is treated as path-only;
    /// an empty hostname is peeled off the leading path segment; a trailing
    /// `:` is stripped from the protocol; empty components become `*`.
    pub fn parse(raw: &str) -> UrlParts {
        let raw = raw.trim();

        let (protocol, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => (scheme.trim_end_matches(':').to_ascii_lowercase(), rest),
            None => (String::new(), raw),
        };

        let (before_query, query) = match rest.split_once('?') {
            Some((b, q)) => (b, q.to_string()),
            None => (rest, String::new()),
        };

        let (authority, path) = match before_query.find('/') {
            Some(idx) => before_query.split_at(idx),
            None => (before_query, ""),
        };

        let mut hostname = authority.to_string();
        let mut path = path.to_string();

        if hostname.is_empty() {
            // Scheme-less and rooted, e.g. "/geo.example.com/rest": the first
            // segment is the host.
            let trimmed = path.trim_start_matches('/');
            match trimmed.split_once('/') {
                Some((head, tail)) => {
                    hostname = head.to_string();
                    path = format!("/{tail}");
                }
                None => {
                    hostname = trimmed.to_string();
                    path = String::new();
                }
            }
        }

        let (hostname, port) = split_port(&hostname);

        UrlParts {
            protocol: or_any(&protocol),
            hostname: or_any(&hostname.to_ascii_lowercase()),
            port: or_any(&port),
            path: or_any(&path),
            query,
        }
    }

    /// Does a request match this (rule) pattern? Protocol, hostname and port
    /// honor the `*` wildcard; the path policy is equality under `match_all`
    /// and prefix matching otherwise.
    pub fn matches(&self, request: &UrlParts, match_all: bool) -> bool {
        domains_match(&self.hostname, &request.hostname)
            && protocols_match(&self.protocol, &request.protocol)
            && ports_match(&self.port, &request.port)
            && path_matches(&self.path, &request.path, match_all)
    }
}

fn or_any(value: &str) -> String {
    if value.is_empty() {
        ANY.to_string()
    } else {
        value.to_string()
    }
}

fn split_port(authority: &str) -> (String, String) {
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host.to_string(), port.to_string())
        }
        _ => (authority.to_string(), String::new()),
    }
}

/// Segment-wise domain comparison: equal segment counts, each pattern segment
/// either `*` or a case-insensitive match. The whole-pattern `*` matches any
/// host.
pub fn domains_match(pattern: &str, candidate: &str) -> bool {
    if pattern == ANY {
        return true;
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let candidate: Vec<&str> = candidate.split('.').collect();
    pattern.len() == candidate.len()
        && pattern
            .iter()
            .zip(&candidate)
            .all(|(p, c)| *p == ANY || p.eq_ignore_ascii_case(c))
}

pub fn protocols_match(pattern: &str, candidate: &str) -> bool {
    pattern == ANY || candidate == ANY || pattern.eq_ignore_ascii_case(candidate)
}

pub fn ports_match(pattern: &str, candidate: &str) -> bool {
    pattern == ANY || candidate == ANY || pattern == candidate
}

fn path_matches(pattern: &str, candidate: &str, match_all: bool) -> bool {
    if pattern == ANY {
        return true;
    }
    if match_all {
        pattern == candidate
    } else {
        candidate.starts_with(pattern)
    }
}
