//! The two local endpoints: a JSON ping and an HTML status page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use pingora::Result;
use pingora_proxy::Session;

use crate::proxy::{responses, ProxyState};

/// Request counters plus the process start instant. Counters are plain
/// atomic increments; the status page reads whatever is current.
pub struct ProxyStats {
    pub attempted: AtomicU64,
    pub processed_ok: AtomicU64,
    pub processed_err: AtomicU64,
    pub started: Instant,
}

impl ProxyStats {
    pub fn new() -> ProxyStats {
        ProxyStats {
            attempted: AtomicU64::new(0),
            processed_ok: AtomicU64::new(0),
            processed_err: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// `GET /ping`: liveness without any access checks.
pub async fn respond_ping(session: &mut Session, referrer: Option<&str>) -> Result<()> {
    let body = serde_json::json!({
        "Proxy Version": env!("CARGO_PKG_VERSION"),
        "Configuration File": "OK",
        "Log File": "OK",
        "referrer": referrer.unwrap_or("-"),
    });
    responses::respond_json(session, 200, body).await
}

/// `GET /status`: uptime, counters, the referrer allow-list and a dump of the
/// rate-meter buckets. Only reachable with a validated referrer.
pub async fn respond_status(session: &mut Session, state: &ProxyState) -> Result<()> {
    let stats = &state.stats;
    let uptime = stats.started.elapsed().as_secs();

    let mut page = String::with_capacity(2048);
    page.push_str("<!DOCTYPE html><html><head><title>Proxy status</title></head><body>");
    page.push_str(&format!(
        "<h1>Proxy status</h1><p>Version {} &mdash; up {}s</p>",
        env!("CARGO_PKG_VERSION"),
        uptime
    ));
    page.push_str(&format!(
        "<p>Requests: {} attempted, {} processed, {} rejected</p>",
        stats.attempted.load(Ordering::Relaxed),
        stats.processed_ok.load(Ordering::Relaxed),
        stats.processed_err.load(Ordering::Relaxed),
    ));

    page.push_str("<h2>Allowed referrers</h2><ul>");
    if state.config.referrers.accept_any {
        page.push_str("<li>* (any referrer)</li>");
    }
    for entry in &state.config.referrers.entries {
        page.push_str(&format!("<li>{}</li>", escape_html(&entry.canonical_key)));
    }
    page.push_str("</ul>");

    page.push_str(
        "<h2>Rate meter</h2><table border=\"1\"><tr>\
         <th>Referrer</th><th>Rule</th><th>Tokens</th><th>Capacity</th><th>Idle (s)</th></tr>",
    );
    for bucket in state.meter.dump() {
        let rule_url = state
            .config
            .rules
            .get(bucket.rule_index)
            .map(|rule| rule.url.as_str())
            .unwrap_or("?");
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{:.1}</td><td>{:.0}</td><td>{}</td></tr>",
            escape_html(&bucket.referrer),
            escape_html(rule_url),
            bucket.tokens,
            bucket.capacity,
            bucket.idle.as_secs(),
        ));
    }
    page.push_str("</table></body></html>");

    responses::respond_html(session, 200, page).await
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<script>&x</script>"),
            "&lt;script&gt;&amp;x&lt;/script&gt;"
        );
    }
}
