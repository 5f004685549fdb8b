//! Outbound URL construction.
//!
//! The outbound target is assembled from up to three sources: the matched
//! rule (most specific), the request's own parts, and the validated referrer
//! (tiebreaker for the protocol). Wildcard components defer to the next
//! source in that order.

use portico_config::rules::ServiceRule;
use portico_config::url_parts::{UrlParts, ANY};

/// Build the outbound URL for a request.
///
/// With a rule, wildcard rule components are filled from the request, the
/// path is the rule path plus whatever the request carries beyond the rule's
/// matched prefix, and the query is the rule's entries first, then the
/// request's (the rule wins on conflict). A `host_redirect` keeps the
/// incoming path and query but substitutes the redirect host, protocol and
/// port where they are more specific. Without a rule the request's own parts
/// are used verbatim.
///
/// An acquired token is appended last under the rule's token parameter name,
/// overwriting any value the client supplied.
pub fn build_outbound_url(
    rule: Option<&ServiceRule>,
    target: &UrlParts,
    referrer: &str,
    token: Option<&str>,
) -> String {
    let referrer_protocol = referrer_protocol(referrer);

    match rule {
        None => assemble(
            best_match(&[&target.protocol, referrer_protocol], "http"),
            &target.hostname,
            &target.port,
            &target.path,
            merge_query("", &target.query, None),
        ),
        Some(rule) => {
            let token_param = token.map(|t| (rule.token_param.as_str(), t));

            if let Some(redirect) = &rule.host_redirect {
                return assemble(
                    best_match(
                        &[&redirect.protocol, &target.protocol, referrer_protocol],
                        "http",
                    ),
                    &redirect.hostname,
                    best_match(&[&redirect.port, &target.port], ""),
                    &target.path,
                    merge_query("", &target.query, token_param),
                );
            }

            let path = if rule.parts.path == ANY {
                target.path.clone()
            } else {
                let trailing = target
                    .path
                    .strip_prefix(rule.parts.path.as_str())
                    .unwrap_or("");
                format!("{}{}", rule.parts.path, trailing)
            };

            let hostname = if rule.parts.hostname.contains(ANY) {
                &target.hostname
            } else {
                &rule.parts.hostname
            };

            assemble(
                best_match(
                    &[&rule.parts.protocol, &target.protocol, referrer_protocol],
                    "http",
                ),
                hostname,
                best_match(&[&rule.parts.port, &target.port], ""),
                &path,
                merge_query(&rule.parts.query, &target.query, token_param),
            )
        }
    }
}

/// The first candidate that is neither empty nor the wildcard.
fn best_match<'a>(candidates: &[&'a str], fallback: &'a str) -> &'a str {
    candidates
        .iter()
        .find(|c| !c.is_empty() && **c != ANY)
        .copied()
        .unwrap_or(fallback)
}

fn referrer_protocol(referrer: &str) -> &str {
    match referrer.split_once("://") {
        Some((protocol, _)) if protocol != ANY => protocol,
        _ => ANY,
    }
}

fn assemble(protocol: &str, hostname: &str, port: &str, path: &str, query: String) -> String {
    let mut url = format!("{protocol}://{hostname}");
    if !port.is_empty() && port != ANY {
        url.push(':');
        url.push_str(port);
    }
    if path != ANY {
        url.push_str(path);
    }
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }
    url
}

/// Merge two raw query strings, preserving the original encodings. Base
/// entries come first and win over extra entries with the same name; the
/// token parameter, when present, replaces any entry under its name.
fn merge_query(base: &str, extra: &str, token: Option<(&str, &str)>) -> String {
    let mut pairs: Vec<(String, String)> = vec![];

    for raw in [base, extra] {
        for entry in raw.split('&').filter(|e| !e.is_empty()) {
            let (name, value) = match entry.split_once('=') {
                Some((n, v)) => (n.to_string(), v.to_string()),
                None => (entry.to_string(), String::new()),
            };
            if !pairs.iter().any(|(existing, _)| *existing == name) {
                pairs.push((name, value));
            }
        }
    }

    if let Some((param, value)) = token {
        pairs.retain(|(name, _)| name != param);
        pairs.push((param.to_string(), value.to_string()));
    }

    pairs
        .into_iter()
        .map(|(name, value)| {
            if value.is_empty() {
                name
            } else {
                format!("{name}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}
