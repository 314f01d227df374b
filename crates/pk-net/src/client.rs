//! Blocking HTTP/1.1 client built on the DNS, transport and TLS contracts.

use crate::PreparedRequest;
use crate::http::Header;
use crate::http::HttpMethod;
use crate::http::HttpRequest;
use crate::http::HttpResponse;
use crate::http::HttpVersion;
use crate::http::ResponseHead;
use crate::tls::TlsPolicy;
use crate::tls_backend::RustlsTlsAdapter;
use crate::tls_backend::TlsBackendAdapter;
use crate::transport::BoxedIoStream;
use crate::transport::DnsResolver;
use crate::transport::SystemDnsResolver;
use crate::transport::TcpTransport;
use crate::transport::Transport;
use crate::transport::connect_first_available;
use brotli::Decompressor;
use flate2::read::DeflateDecoder;
use flate2::read::GzDecoder;
use flate2::read::ZlibDecoder;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

const MAX_RESPONSE_HEAD_BYTES: usize = 128 * 1024;
const MAX_CHUNK_LINE_BYTES: usize = 8 * 1024;

/// Error code for bodies that grow past the caller's limit.
pub const BODY_TOO_LARGE: &str = "net.http.body_too_large";

/// Error code for requests stopped through their [`AbortSignal`].
pub const ABORTED: &str = "net.transport.aborted";

/// Stops a blocking request at its next read. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> CaptureResult<()> {
        if self.is_aborted() {
            return Err(CaptureError::new(ABORTED, "request aborted"));
        }
        Ok(())
    }
}

/// Refuses further reads once the signal is raised.
struct AbortableRead<'a> {
    inner: &'a mut dyn Read,
    abort: &'a AbortSignal,
}

impl Read for AbortableRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.abort.is_aborted() {
            return Err(std::io::Error::other("request aborted"));
        }
        self.inner.read(buf)
    }
}

/// HTTP/1.1 client with pluggable resolver/transport/tls backend. Every
/// request uses a fresh `Connection: close` connection.
pub struct Http11Client<R = SystemDnsResolver, T = TcpTransport, A = RustlsTlsAdapter>
where
    R: DnsResolver,
    T: Transport,
    A: TlsBackendAdapter,
{
    dns: R,
    transport: T,
    tls_adapter: A,
    tls_policy: TlsPolicy,
    io_timeout: Duration,
}

impl Http11Client {
    pub fn new(tls_policy: TlsPolicy) -> CaptureResult<Self> {
        Self::with_parts(SystemDnsResolver, TcpTransport, RustlsTlsAdapter::default(), tls_policy)
    }
}

impl<R, T, A> Http11Client<R, T, A>
where
    R: DnsResolver,
    T: Transport,
    A: TlsBackendAdapter,
{
    pub fn with_parts(dns: R, transport: T, tls_adapter: A, tls_policy: TlsPolicy) -> CaptureResult<Self> {
        tls_policy.validate()?;
        Ok(Self {
            dns,
            transport,
            tls_adapter,
            tls_policy,
            io_timeout: Duration::from_secs(10),
        })
    }

    /// Bounds connect, each read and each write.
    pub fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }

    /// Sends the request and reads the response head. The body is read only
    /// when `read_body` accepts the head; it is capped at `max_body_bytes`.
    pub fn execute(
        &self,
        prepared: &PreparedRequest,
        max_body_bytes: Option<u64>,
        read_body: impl FnOnce(&ResponseHead) -> bool,
    ) -> CaptureResult<HttpResponse> {
        self.execute_abortable(prepared, max_body_bytes, read_body, &AbortSignal::new())
    }

    /// [`Self::execute`] that gives up between reads once `abort` is raised.
    pub fn execute_abortable(
        &self,
        prepared: &PreparedRequest,
        max_body_bytes: Option<u64>,
        read_body: impl FnOnce(&ResponseHead) -> bool,
        abort: &AbortSignal,
    ) -> CaptureResult<HttpResponse> {
        self.tls_policy.validate()?;
        validate_prepared_request(prepared)?;

        let mut stream = self.open_stream(prepared)?;
        abort.check()?;
        write_request(&mut *stream, &prepared.request)?;
        read_response_abortable(&mut stream, &prepared.request, max_body_bytes, read_body, abort)
    }

    fn open_stream(&self, prepared: &PreparedRequest) -> CaptureResult<BoxedIoStream> {
        let host = prepared.request.url.host();
        let port = prepared.request.url.port();
        let addresses = self.dns.resolve(host, port)?;

        connect_first_available(&self.transport, &addresses, self.io_timeout).and_then(|stream| {
            match &prepared.tls {
                Some(handshake) => self.tls_adapter.connect_tls(stream, handshake, &self.tls_policy),
                None => Ok(Box::new(stream)),
            }
        })
    }
}

fn validate_prepared_request(prepared: &PreparedRequest) -> CaptureResult<()> {
    if prepared.request.url.is_secure() && prepared.tls.is_none() {
        return Err(CaptureError::new(
            "net.http.tls_missing",
            "HTTPS request is missing TLS handshake configuration",
        ));
    }

    if !prepared.request.url.is_secure() && prepared.tls.is_some() {
        return Err(CaptureError::new(
            "net.http.tls_unexpected",
            "non-HTTPS request must not include TLS handshake configuration",
        ));
    }

    Ok(())
}

fn write_request(stream: &mut dyn Write, request: &HttpRequest) -> CaptureResult<()> {
    let mut encoded = Vec::new();
    encoded.extend_from_slice(request.method.as_str().as_bytes());
    encoded.push(b' ');
    encoded.extend_from_slice(request.request_target().as_bytes());
    encoded.push(b' ');
    encoded.extend_from_slice(HttpVersion::Http11.as_str().as_bytes());
    encoded.extend_from_slice(b"\r\n");

    for header in &request.headers {
        encoded.extend_from_slice(header.name.as_bytes());
        encoded.extend_from_slice(b": ");
        encoded.extend_from_slice(header.value.as_bytes());
        encoded.extend_from_slice(b"\r\n");
    }
    if request.header("connection").is_none() {
        encoded.extend_from_slice(b"Connection: close\r\n");
    }
    encoded.extend_from_slice(b"\r\n");

    stream.write_all(&encoded).map_err(|error| {
        CaptureError::new(
            "net.http.write_failed",
            format!("failed to write HTTP request bytes: {error}"),
        )
    })?;
    stream.flush().map_err(|error| {
        CaptureError::new(
            "net.http.flush_failed",
            format!("failed to flush HTTP request bytes: {error}"),
        )
    })?;

    Ok(())
}

fn read_response_abortable(
    stream: &mut dyn Read,
    request: &HttpRequest,
    max_body_bytes: Option<u64>,
    read_body: impl FnOnce(&ResponseHead) -> bool,
    abort: &AbortSignal,
) -> CaptureResult<HttpResponse> {
    let mut guarded = AbortableRead { inner: stream, abort };
    read_response(&mut guarded, request, max_body_bytes, read_body).map_err(|error| {
        if abort.is_aborted() {
            CaptureError::new(ABORTED, format!("request aborted while reading: {}", error.message))
        } else {
            error
        }
    })
}

fn read_response(
    stream: &mut dyn Read,
    request: &HttpRequest,
    max_body_bytes: Option<u64>,
    read_body: impl FnOnce(&ResponseHead) -> bool,
) -> CaptureResult<HttpResponse> {
    let (head, prefetched) = read_head(stream)?;

    let has_no_body = request.method == HttpMethod::Head || status_disallows_body(head.status);
    if has_no_body || !read_body(&head) {
        return Ok(HttpResponse {
            head,
            body: Vec::new(),
            body_read: false,
        });
    }

    let limit = max_body_bytes.map(|max| usize::try_from(max).unwrap_or(usize::MAX));
    let chunked = header_contains(&head.headers, "transfer-encoding", "chunked");
    if head.header("transfer-encoding").is_some() && !chunked {
        return Err(CaptureError::new(
            "net.http.transfer_encoding_unsupported",
            "only chunked transfer encoding is currently supported",
        ));
    }

    let raw = if chunked {
        read_chunked_body(stream, prefetched, limit)?
    } else {
        match parse_content_length(&head.headers)? {
            Some(len) => read_sized_body(stream, prefetched, len, limit)?,
            None => read_to_close(stream, prefetched, limit)?,
        }
    };

    let body = decode_content_encoding(&head.headers, &raw)?;
    check_limit(body.len(), limit)?;

    Ok(HttpResponse {
        head,
        body,
        body_read: true,
    })
}

fn read_head(stream: &mut dyn Read) -> CaptureResult<(ResponseHead, Vec<u8>)> {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];

    let header_end = loop {
        if let Some(end) = find_header_end(&buffer) {
            break end;
        }

        let read = stream.read(&mut chunk).map_err(|error| {
            CaptureError::new(
                "net.http.read_head_failed",
                format!("failed while reading HTTP response head: {error}"),
            )
        })?;

        if read == 0 {
            return Err(CaptureError::new(
                "net.http.unexpected_eof",
                "unexpected EOF before response head completed",
            ));
        }

        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > MAX_RESPONSE_HEAD_BYTES {
            return Err(CaptureError::new(
                "net.http.head_too_large",
                format!("HTTP response head exceeds {MAX_RESPONSE_HEAD_BYTES} bytes"),
            ));
        }
    };

    let prefetched = buffer[header_end..].to_vec();
    let head_text = String::from_utf8_lossy(&buffer[..header_end]);

    let mut lines = head_text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| {
        CaptureError::new("net.http.status_line_missing", "missing HTTP status line")
    })?;
    let (version, status) = parse_status_line(status_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (name, value) = line.split_once(':').ok_or_else(|| {
            CaptureError::new(
                "net.http.header_invalid",
                format!("invalid HTTP header line `{line}`"),
            )
        })?;
        headers.push(Header::new(name.trim(), value.trim())?);
    }

    Ok((
        ResponseHead {
            version,
            status,
            headers,
        },
        prefetched,
    ))
}

fn check_limit(len: usize, limit: Option<usize>) -> CaptureResult<()> {
    match limit {
        Some(limit) if len > limit => Err(CaptureError::new(
            BODY_TOO_LARGE,
            format!("response body exceeds {limit} bytes"),
        )),
        _ => Ok(()),
    }
}

fn read_sized_body(
    stream: &mut dyn Read,
    mut body: Vec<u8>,
    len: usize,
    limit: Option<usize>,
) -> CaptureResult<Vec<u8>> {
    check_limit(len, limit)?;
    if body.len() < len {
        let start = body.len();
        body.resize(len, 0);
        stream.read_exact(&mut body[start..]).map_err(|error| {
            CaptureError::new(
                "net.http.read_body_failed",
                format!("failed to read HTTP body bytes: {error}"),
            )
        })?;
    } else {
        body.truncate(len);
    }
    Ok(body)
}

fn read_to_close(stream: &mut dyn Read, mut body: Vec<u8>, limit: Option<usize>) -> CaptureResult<Vec<u8>> {
    let mut chunk = [0_u8; 8192];
    loop {
        check_limit(body.len(), limit)?;
        let read = stream.read(&mut chunk).map_err(|error| {
            CaptureError::new(
                "net.http.read_body_failed",
                format!("failed while draining connection-close response body: {error}"),
            )
        })?;
        if read == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&chunk[..read]);
    }
}

struct PrefixedStreamReader<'a> {
    prefetched: Vec<u8>,
    offset: usize,
    stream: &'a mut dyn Read,
}

impl<'a> PrefixedStreamReader<'a> {
    fn new(stream: &'a mut dyn Read, prefetched: Vec<u8>) -> Self {
        Self {
            prefetched,
            offset: 0,
            stream,
        }
    }

    fn read_exact_into(&mut self, out: &mut [u8], detail: &str) -> CaptureResult<()> {
        let available = self.prefetched.len().saturating_sub(self.offset);
        let prefix_take = available.min(out.len());

        if prefix_take > 0 {
            out[..prefix_take].copy_from_slice(&self.prefetched[self.offset..self.offset + prefix_take]);
            self.offset += prefix_take;
        }

        if prefix_take < out.len() {
            self.stream
                .read_exact(&mut out[prefix_take..])
                .map_err(|error| CaptureError::new("net.http.read_body_failed", format!("{detail}: {error}")))?;
        }

        Ok(())
    }
}

fn read_chunked_body(stream: &mut dyn Read, prefetched: Vec<u8>, limit: Option<usize>) -> CaptureResult<Vec<u8>> {
    let mut reader = PrefixedStreamReader::new(stream, prefetched);
    let mut decoded = Vec::new();

    loop {
        let size_line = read_crlf_line(&mut reader)?;
        if size_line.is_empty() {
            continue;
        }

        let size_token = size_line.split(';').next().unwrap_or_default().trim();
        let chunk_size = usize::from_str_radix(size_token, 16).map_err(|error| {
            CaptureError::new(
                "net.http.chunk_size_invalid",
                format!("invalid chunk size `{size_token}`: {error}"),
            )
        })?;

        if chunk_size == 0 {
            drain_chunk_trailers(&mut reader)?;
            break;
        }

        let start = decoded.len();
        check_limit(start.saturating_add(chunk_size), limit)?;
        decoded.resize(start + chunk_size, 0);
        reader.read_exact_into(&mut decoded[start..], "failed while reading chunked HTTP body bytes")?;

        let mut terminator = [0_u8; 2];
        reader.read_exact_into(&mut terminator, "failed while reading chunked body terminator")?;
        if terminator != *b"\r\n" {
            return Err(CaptureError::new(
                "net.http.chunk_terminator_invalid",
                "chunk data is missing trailing CRLF",
            ));
        }
    }

    Ok(decoded)
}

fn drain_chunk_trailers(reader: &mut PrefixedStreamReader<'_>) -> CaptureResult<()> {
    loop {
        let line = read_crlf_line(reader)?;
        if line.is_empty() {
            break;
        }

        if line.split_once(':').is_none() {
            return Err(CaptureError::new(
                "net.http.chunk_trailer_invalid",
                format!("invalid chunk trailer line `{line}`"),
            ));
        }
    }

    Ok(())
}

fn read_crlf_line(reader: &mut PrefixedStreamReader<'_>) -> CaptureResult<String> {
    let mut line = Vec::new();

    loop {
        let mut byte = [0_u8; 1];
        reader.read_exact_into(&mut byte, "failed while reading chunked transfer line")?;
        line.push(byte[0]);

        if line.len() > MAX_CHUNK_LINE_BYTES {
            return Err(CaptureError::new(
                "net.http.chunk_line_too_large",
                format!("chunk metadata line exceeds {MAX_CHUNK_LINE_BYTES} bytes"),
            ));
        }

        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line).map_err(|error| {
                CaptureError::new(
                    "net.http.chunk_line_invalid_utf8",
                    format!("chunk metadata line is not valid UTF-8: {error}"),
                )
            });
        }
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

fn parse_status_line(line: &str) -> CaptureResult<(HttpVersion, u16)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code_text = parts.next().ok_or_else(|| {
        CaptureError::new(
            "net.http.status_line_invalid",
            format!("missing status code in status line `{line}`"),
        )
    })?;

    let version = match version {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        other => {
            return Err(CaptureError::new(
                "net.http.version_unsupported",
                format!("unsupported response version `{other}`"),
            ));
        }
    };

    let code = code_text
        .parse::<u16>()
        .ok()
        .filter(|code| (100..=599).contains(code))
        .ok_or_else(|| {
            CaptureError::new(
                "net.http.status_line_invalid",
                format!("invalid status code `{code_text}`"),
            )
        })?;

    Ok((version, code))
}

fn parse_content_length(headers: &[Header]) -> CaptureResult<Option<usize>> {
    let mut value: Option<usize> = None;
    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            let parsed = header.value.trim().parse::<usize>().map_err(|error| {
                CaptureError::new(
                    "net.http.content_length_invalid",
                    format!("invalid Content-Length `{}`: {error}", header.value),
                )
            })?;

            match value {
                Some(existing) if existing != parsed => {
                    return Err(CaptureError::new(
                        "net.http.content_length_conflict",
                        "conflicting Content-Length headers in response",
                    ));
                }
                _ => value = Some(parsed),
            }
        }
    }

    Ok(value)
}

fn status_disallows_body(status_code: u16) -> bool {
    (100..200).contains(&status_code) || status_code == 204 || status_code == 304
}

fn header_contains(headers: &[Header], name: &str, value: &str) -> bool {
    headers.iter().any(|header| {
        header.name.eq_ignore_ascii_case(name)
            && header
                .value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case(value))
    })
}

fn decode_content_encoding(headers: &[Header], body: &[u8]) -> CaptureResult<Vec<u8>> {
    let encodings: Vec<String> = headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("content-encoding"))
        .flat_map(|header| header.value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut decoded = body.to_vec();
    for encoding in encodings.iter().rev() {
        decoded = match encoding.as_str() {
            "identity" => decoded,
            "gzip" | "x-gzip" => decode_with(GzDecoder::new(Cursor::new(&decoded)), "gzip")?,
            "deflate" => match decode_with(ZlibDecoder::new(Cursor::new(&decoded)), "deflate") {
                Ok(inflated) => inflated,
                Err(_) => decode_with(DeflateDecoder::new(Cursor::new(&decoded)), "deflate")?,
            },
            "br" => decode_with(Decompressor::new(Cursor::new(&decoded), 4096), "brotli")?,
            _ => {
                return Err(CaptureError::new(
                    "net.http.content_encoding_unsupported",
                    format!("unsupported content encoding `{encoding}`"),
                ));
            }
        };
    }

    Ok(decoded)
}

fn decode_with(mut decoder: impl Read, name: &str) -> CaptureResult<Vec<u8>> {
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).map_err(|error| {
        CaptureError::new("net.http.decode_failed", format!("{name} decode failed: {error}"))
    })?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::ABORTED;
    use super::AbortSignal;
    use super::BODY_TOO_LARGE;
    use super::decode_content_encoding;
    use super::parse_status_line;
    use super::read_chunked_body;
    use super::read_response;
    use super::read_response_abortable;
    use crate::http::Header;
    use crate::http::HttpMethod;
    use crate::http::HttpRequest;
    use crate::url::RequestUrl;
    use brotli::CompressorWriter;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Cursor;
    use std::io::Write;

    fn get(url: &str) -> HttpRequest {
        let url = RequestUrl::parse(url);
        assert!(url.is_ok());
        let url = match url {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        let request = HttpRequest::builder(HttpMethod::Get, url).build();
        match request {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn status_line_parser_rejects_out_of_range_codes() {
        assert_eq!(parse_status_line("HTTP/1.1 404 Not Found").ok(), Some((crate::http::HttpVersion::Http11, 404)));
        assert!(parse_status_line("HTTP/1.1 999 Nope").is_err());
        assert!(parse_status_line("HTTP/2 200").is_err());
    }

    #[test]
    fn decodes_chunked_body() {
        let prefetched = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec();
        let mut stream = Cursor::new(Vec::<u8>::new());
        let decoded = read_chunked_body(&mut stream, prefetched, None);
        assert_eq!(decoded, Ok(b"Wikipedia".to_vec()));
    }

    #[test]
    fn chunked_body_past_limit_is_too_large() {
        let prefetched = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec();
        let mut stream = Cursor::new(Vec::<u8>::new());
        let decoded = read_chunked_body(&mut stream, prefetched, Some(8));
        assert!(matches!(decoded, Err(error) if error.code == BODY_TOO_LARGE));
    }

    #[test]
    fn gate_can_skip_the_body() {
        let request = get("http://x/a.png");
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello";
        let mut stream = Cursor::new(raw.to_vec());
        let response = read_response(&mut stream, &request, None, |head| head.mime_type() != "text/html");
        assert!(response.is_ok());
        let response = match response {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        assert!(!response.body_read);
        assert!(response.body.is_empty());
        assert_eq!(response.head.status, 200);
    }

    #[test]
    fn sized_body_at_limit_is_read() {
        let request = get("http://x/a.png");
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut stream = Cursor::new(raw.to_vec());
        let response = read_response(&mut stream, &request, Some(5), |_| true);
        assert_eq!(response.map(|r| r.body), Ok(b"hello".to_vec()));
    }

    #[test]
    fn close_delimited_body_past_limit_is_too_large() {
        let request = get("http://x/a.png");
        let raw = b"HTTP/1.0 200 OK\r\n\r\n0123456789";
        let mut stream = Cursor::new(raw.to_vec());
        let response = read_response(&mut stream, &request, Some(4), |_| true);
        assert!(matches!(response, Err(error) if error.code == BODY_TOO_LARGE));
    }

    #[test]
    fn decodes_gzip_content_encoding() {
        let mut encoded = Vec::new();
        {
            let mut encoder = GzEncoder::new(&mut encoded, Compression::default());
            assert!(encoder.write_all(b"hello gzip").is_ok());
            assert!(encoder.finish().is_ok());
        }

        let header = Header::new("Content-Encoding", "gzip");
        let header = match header {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };

        let decoded = decode_content_encoding(&[header], &encoded);
        assert_eq!(decoded, Ok(b"hello gzip".to_vec()));
    }

    #[test]
    fn decodes_brotli_content_encoding() {
        let mut encoded = Vec::new();
        {
            let mut writer = CompressorWriter::new(&mut encoded, 4096, 5, 22);
            assert!(writer.write_all(b"hello br").is_ok());
            assert!(writer.flush().is_ok());
        }

        let header = match Header::new("Content-Encoding", "br") {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };

        let decoded = decode_content_encoding(&[header], &encoded);
        assert_eq!(decoded, Ok(b"hello br".to_vec()));
    }

    /// Close-delimited body that never ends, one byte per read. Raises the
    /// signal after `abort_after` reads, as a timed-out caller would.
    struct Drip {
        reads: usize,
        abort_after: usize,
        abort: AbortSignal,
    }

    impl std::io::Read for Drip {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            const HEAD: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\n\r\n";
            self.reads += 1;
            if self.reads == self.abort_after {
                self.abort.abort();
            }
            let n = if self.reads == 1 { HEAD.len().min(buf.len()) } else { 1 };
            if self.reads == 1 {
                buf[..n].copy_from_slice(&HEAD[..n]);
            } else {
                buf[0] = b'x';
            }
            Ok(n)
        }
    }

    #[test]
    fn aborted_request_stops_reading_a_dripping_body() {
        let abort = AbortSignal::new();
        let mut stream = Drip {
            reads: 0,
            abort_after: 20,
            abort: abort.clone(),
        };
        let request = get("http://x/slow.png");
        let response = read_response_abortable(&mut stream, &request, None, |_| true, &abort);
        assert!(matches!(response, Err(error) if error.code == ABORTED));
        assert_eq!(stream.reads, 20);
    }

    #[test]
    fn unraised_signal_leaves_the_response_alone() {
        let request = get("http://x/a.png");
        let mut stream = Cursor::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec());
        let response = read_response_abortable(&mut stream, &request, None, |_| true, &AbortSignal::new());
        assert_eq!(response.map(|r| r.body), Ok(b"ok".to_vec()));
    }
}
