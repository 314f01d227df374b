//! Async transport seam between the fetch policy and the wire.

use crate::client::AbortSignal;
use crate::client::Http11Client;
use crate::http::HttpMethod;
use crate::http::HttpResponse;
use crate::http::ResponseHead;
use crate::prepare_request;
use crate::tls::TlsPolicy;
use async_trait::async_trait;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use std::sync::Arc;
use std::time::Duration;

/// Redirect hops followed before giving up.
pub const MAX_REDIRECTS: usize = 5;

/// Decides from the response head whether the body is worth reading.
pub type BodyGate = Arc<dyn Fn(&ResponseHead) -> bool + Send + Sync>;

/// One request as the fetch policy hands it to a transport.
#[derive(Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Extra headers on top of the stack defaults (`Referer`, ...).
    pub headers: Vec<(String, String)>,
    pub max_body_bytes: Option<u64>,
    pub body_gate: BodyGate,
}

impl TransportRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            max_body_bytes: None,
            body_gate: Arc::new(|_| true),
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Head,
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_body_limit(mut self, max_body_bytes: Option<u64>) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn with_body_gate(mut self, gate: BodyGate) -> Self {
        self.body_gate = gate;
        self
    }
}

impl std::fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ResourceTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> CaptureResult<HttpResponse>;
}

/// Production transport: the blocking HTTP/1.1 client on tokio's blocking pool.
pub struct HttpTransport {
    client: Arc<Http11Client>,
    tls_policy: TlsPolicy,
}

impl HttpTransport {
    pub fn new(tls_policy: TlsPolicy, io_timeout: Duration) -> CaptureResult<Self> {
        let mut client = Http11Client::new(tls_policy.clone())?;
        client.set_io_timeout(io_timeout);
        Ok(Self {
            client: Arc::new(client),
            tls_policy,
        })
    }
}

#[async_trait]
impl ResourceTransport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> CaptureResult<HttpResponse> {
        let client = Arc::clone(&self.client);
        let tls_policy = self.tls_policy.clone();
        run_abortable(move |abort| send_following_redirects(&client, &tls_policy, &request, abort)).await
    }
}

/// Raises its signal when dropped, i.e. when the awaiting future goes away.
struct AbortOnDrop(AbortSignal);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `job` on the blocking pool. Dropping the returned future (a timeout
/// or a cancelled capture) raises the job's abort signal so the worker
/// stops at its next read.
async fn run_abortable<T, F>(job: F) -> CaptureResult<T>
where
    T: Send + 'static,
    F: FnOnce(&AbortSignal) -> CaptureResult<T> + Send + 'static,
{
    let signal = AbortSignal::new();
    let guard = AbortOnDrop(signal.clone());
    let result = tokio::task::spawn_blocking(move || job(&signal)).await;
    drop(guard);
    result.map_err(|error| {
        CaptureError::new(
            "net.transport.worker_failed",
            format!("blocking fetch worker did not complete: {error}"),
        )
    })?
}

fn send_following_redirects(
    client: &Http11Client,
    tls_policy: &TlsPolicy,
    request: &TransportRequest,
    abort: &AbortSignal,
) -> CaptureResult<HttpResponse> {
    let mut url = request.url.clone();

    for hop in 0..=MAX_REDIRECTS {
        abort.check()?;
        let prepared = prepare_request(request.method, &url, &request.headers, tls_policy)?;
        let gate = Arc::clone(&request.body_gate);
        let response = client.execute_abortable(
            &prepared,
            request.max_body_bytes,
            move |head| !head.is_redirect() && gate(head),
            abort,
        )?;

        if !response.head.is_redirect() {
            return Ok(response);
        }

        let location = response.head.header("location").unwrap_or_default();
        let next = crate::url::resolve(&url, location).ok_or_else(|| {
            CaptureError::new(
                "net.http.redirect_invalid",
                format!("redirect from `{url}` has unusable location `{location}`"),
            )
        })?;
        tracing::trace!(target: "pagekeep::fetch", hop, from = %url, to = %next, "following redirect");
        url = next.to_string();
    }

    Err(CaptureError::new(
        "net.http.too_many_redirects",
        format!("more than {MAX_REDIRECTS} redirects starting at `{}`", request.url),
    ))
}

#[cfg(test)]
mod tests {
    use super::TransportRequest;
    use super::run_abortable;
    use crate::client::ABORTED;
    use crate::http::HttpMethod;
    use crate::http::HttpVersion;
    use crate::http::ResponseHead;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    #[tokio::test]
    async fn timed_out_fetch_stops_its_blocking_worker() {
        let (stopped_tx, stopped) = mpsc::channel();
        // Stands in for a body that keeps dripping within the read timeout.
        let slow_body = run_abortable(move |abort| -> pk_core::CaptureResult<()> {
            let mut reads = 0_u32;
            loop {
                if let Err(error) = abort.check() {
                    let _ = stopped_tx.send(reads);
                    return Err(error);
                }
                reads += 1;
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let timed_out = tokio::time::timeout(Duration::from_millis(50), slow_body).await;
        assert!(timed_out.is_err());
        assert!(stopped.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn finished_jobs_are_not_aborted() {
        let result = run_abortable(|abort| abort.check().map(|()| 7)).await;
        assert_eq!(result, Ok(7));
        let aborted = run_abortable(|abort| {
            abort.abort();
            abort.check()
        })
        .await;
        assert!(matches!(aborted, Err(error) if error.code == ABORTED));
    }

    #[test]
    fn head_requests_keep_defaults_of_get() {
        let request = TransportRequest::head("https://example.com/")
            .with_header("Referer", "https://example.com/page")
            .with_body_limit(Some(10));
        assert_eq!(request.method, HttpMethod::Head);
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.max_body_bytes, Some(10));
        assert!(format!("{request:?}").contains("example.com"));
    }

    #[test]
    fn custom_gate_sees_the_head() {
        let request = TransportRequest::get("http://example.com/a.png")
            .with_body_gate(Arc::new(|head: &ResponseHead| head.status == 200));
        let ok = ResponseHead {
            version: HttpVersion::Http11,
            status: 200,
            headers: Vec::new(),
        };
        let missing = ResponseHead { status: 404, ..ok.clone() };
        assert!((request.body_gate)(&ok));
        assert!(!(request.body_gate)(&missing));
    }
}
