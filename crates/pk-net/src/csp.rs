//! Content-Security-Policy probe run before a save starts.

use crate::resource::ResourceTransport;
use crate::resource::TransportRequest;

/// False when the policy carries a `sandbox` directive without
/// `allow-downloads`.
pub fn sandbox_allows_downloads(policy: &str) -> bool {
    policy.split(';').all(|directive| {
        let mut tokens = directive.split_ascii_whitespace();
        match tokens.next() {
            Some(name) if name.eq_ignore_ascii_case("sandbox") => {
                tokens.any(|token| token.eq_ignore_ascii_case("allow-downloads"))
            }
            _ => true,
        }
    })
}

/// Probes the page with `HEAD` and reports whether its policy lets the
/// saved file be downloaded. Local files are always allowed; an unreachable
/// page or a non-200 answer counts as not allowed.
pub async fn page_allows_downloads(transport: &dyn ResourceTransport, page_url: &str) -> bool {
    if page_url.starts_with("file:///") {
        return true;
    }

    match transport.send(TransportRequest::head(page_url)).await {
        Ok(response) if response.head.status == 200 => {
            let policy = response.head.header("content-security-policy").unwrap_or_default();
            sandbox_allows_downloads(policy)
        }
        Ok(response) => {
            tracing::debug!(target: "pagekeep::fetch", url = page_url, status = response.head.status, "policy probe refused");
            false
        }
        Err(error) => {
            tracing::debug!(target: "pagekeep::fetch", url = page_url, %error, "policy probe failed");
            false
        }
    }
}
