//! Networking for captures: URLs, the HTTP/1.1 client, TLS policy and the
//! resource fetcher.

pub mod client;
pub mod csp;
pub mod fetcher;
pub mod http;
pub mod resource;
pub mod tls;
pub mod tls_backend;
pub mod transport;
pub mod url;

use http::HttpMethod;
use http::HttpRequest;
use pk_core::CaptureResult;
use tls::TlsHandshakeConfig;
use crate::url::RequestUrl;

pub use client::Http11Client;
pub use csp::page_allows_downloads;
pub use csp::sandbox_allows_downloads;
pub use fetcher::CrossOriginReferrer;
pub use fetcher::FailureReason;
pub use fetcher::FetchLimits;
pub use fetcher::FetchMode;
pub use fetcher::FetchOutcome;
pub use fetcher::FetchRequest;
pub use fetcher::ReferrerPolicy;
pub use fetcher::ResourceContent;
pub use fetcher::ResourceFetcher;
pub use http::Header;
pub use http::HttpResponse;
pub use http::ResponseHead;
pub use resource::HttpTransport;
pub use resource::ResourceTransport;
pub use resource::TransportRequest;
pub use tls::TlsPolicy;
pub use tls::TrustStoreMode;
pub use crate::url::is_special_page;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0 PageKeep/0.1";
const DEFAULT_ACCEPT_HEADER: &str = "*/*";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Request prepared by the network layer before transport execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub request: HttpRequest,
    pub tls: Option<TlsHandshakeConfig>,
}

/// Builds a request with the stack's default headers; `extra` headers
/// override defaults of the same name.
pub fn prepare_request(
    method: HttpMethod,
    raw_url: &str,
    extra: &[(String, String)],
    tls_policy: &TlsPolicy,
) -> CaptureResult<PreparedRequest> {
    let url = RequestUrl::parse(raw_url)?;
    let tls = tls_policy.handshake_config_for(&url)?;

    let mut request = HttpRequest::builder(method, url);
    request = request.header("User-Agent", DEFAULT_USER_AGENT)?;
    request = request.header("Accept", DEFAULT_ACCEPT_HEADER)?;
    request = request.header("Accept-Language", DEFAULT_ACCEPT_LANGUAGE)?;
    request = request.header("Accept-Encoding", "gzip, deflate, br")?;
    for (name, value) in extra {
        request = request.header(name, value)?;
    }

    Ok(PreparedRequest {
        request: request.build()?,
        tls,
    })
}
