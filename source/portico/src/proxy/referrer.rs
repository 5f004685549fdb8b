//! Referrer validation against the configured allow-list.

use portico_config::rules::ReferrerPolicy;
use portico_config::url_parts::{domains_match, protocols_match, UrlParts, ANY};

/// Returns the canonical key of the matched allow-list entry, the literal `*`
/// when the policy accepts anyone, or `None` when the referrer is denied.
///
/// A missing or empty `Referer` header and the literal raw value `*` match
/// nothing unless the global flag is set.
pub fn validate_referrer(raw: Option<&str>, policy: &ReferrerPolicy) -> Option<String> {
    if policy.accept_any {
        return Some(ANY.to_string());
    }

    let raw = raw?.trim();
    if raw.is_empty() || raw == ANY {
        return None;
    }

    let parsed = UrlParts::parse(raw);

    policy
        .entries
        .iter()
        .find(|entry| {
            protocols_match(&entry.protocol, &parsed.protocol)
                && referrer_path_matches(&entry.path, &parsed.path)
                && domains_match(&entry.hostname, &parsed.hostname)
        })
        .map(|entry| entry.canonical_key.clone())
}

fn referrer_path_matches(entry_path: &str, candidate: &str) -> bool {
    entry_path == ANY || candidate.starts_with(entry_path)
}
