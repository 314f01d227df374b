//! In-memory transport and page builders for capture tests.

use async_trait::async_trait;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use pk_net::FetchLimits;
use pk_net::Header;
use pk_net::HttpResponse;
use pk_net::ResourceFetcher;
use pk_net::ResourceTransport;
use pk_net::ResponseHead;
use pk_net::TransportRequest;
use pk_net::http::HttpVersion;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct Canned {
    pub(crate) delay: Duration,
    pub(crate) status: u16,
    pub(crate) content_type: String,
    pub(crate) body: Vec<u8>,
}

impl Canned {
    pub(crate) fn ok(content_type: &str, body: &[u8]) -> Self {
        Self {
            delay: Duration::ZERO,
            status: 200,
            content_type: content_type.to_owned(),
            body: body.to_vec(),
        }
    }

    pub(crate) fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok("text/html", b"")
        }
    }

    pub(crate) fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
pub(crate) struct CannedTransport {
    responses: Mutex<HashMap<String, Canned>>,
    seen: Mutex<Vec<String>>,
}

impl CannedTransport {
    pub(crate) fn with(self, url: &str, response: Canned) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(url.to_owned(), response);
        self
    }

    pub(crate) fn requested(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

#[async_trait]
impl ResourceTransport for CannedTransport {
    async fn send(&self, request: TransportRequest) -> CaptureResult<HttpResponse> {
        self.seen
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(request.url.clone());
        let canned = self
            .responses
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(&request.url)
            .cloned();
        let Some(canned) = canned else {
            return Err(CaptureError::new("net.tcp.connect_failed", "no route"));
        };
        tokio::time::sleep(canned.delay).await;

        let head = ResponseHead {
            version: HttpVersion::Http11,
            status: canned.status,
            headers: vec![Header::new("Content-Type", &canned.content_type)?],
        };
        let body_read = (request.body_gate)(&head);
        Ok(HttpResponse {
            head,
            body: if body_read { canned.body } else { Vec::new() },
            body_read,
        })
    }
}

pub(crate) fn fetcher(transport: Arc<CannedTransport>) -> ResourceFetcher {
    ResourceFetcher::new(transport, FetchLimits::default())
}
