//! HTTP request/response types.

use crate::url::RequestUrl;
use pk_core::CaptureError;
use pk_core::CaptureResult;

/// Methods the capture issues: `GET` for resources, `HEAD` for page probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// Single HTTP header with validated wire-safe name/value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: &str, value: &str) -> CaptureResult<Self> {
        if name.is_empty() || !name.bytes().all(is_token_char) {
            return Err(CaptureError::new(
                "net.http.header_name_invalid",
                format!("invalid HTTP header name `{name}`"),
            ));
        }

        if value.bytes().any(|byte| matches!(byte, b'\r' | b'\n' | 0)) {
            return Err(CaptureError::new(
                "net.http.header_value_invalid",
                format!("invalid characters found in HTTP header `{name}`"),
            ));
        }

        Ok(Self {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }
}

/// Outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: RequestUrl,
    pub headers: Vec<Header>,
}

impl HttpRequest {
    pub fn builder(method: HttpMethod, url: RequestUrl) -> HttpRequestBuilder {
        HttpRequestBuilder {
            method,
            url,
            headers: Vec::new(),
        }
    }

    pub fn request_target(&self) -> String {
        self.url.path_and_query()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestBuilder {
    method: HttpMethod,
    url: RequestUrl,
    headers: Vec<Header>,
}

impl HttpRequestBuilder {
    /// Appends a header, replacing an earlier one with the same name.
    pub fn header(mut self, name: &str, value: &str) -> CaptureResult<Self> {
        let header = Header::new(name, value)?;
        self.headers
            .retain(|existing| !existing.name.eq_ignore_ascii_case(name));
        self.headers.push(header);
        Ok(self)
    }

    pub fn build(mut self) -> CaptureResult<HttpRequest> {
        if find_header(&self.headers, "host").is_none() {
            let host = self.url.authority();
            self.headers.insert(0, Header::new("Host", &host)?);
        }

        Ok(HttpRequest {
            method: self.method,
            url: self.url,
            headers: self.headers,
        })
    }
}

/// Status line and headers of a response, available before the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Declared body length. Unparseable values count as unknown.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.trim().parse::<u64>().ok())
    }

    /// Lower-cased MIME type of `Content-Type`, empty when absent.
    pub fn mime_type(&self) -> String {
        self.header("content-type")
            .and_then(|value| value.split(';').next())
            .map(|mime| mime.trim().to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Lower-cased `charset` parameter of `Content-Type`.
    pub fn charset(&self) -> Option<String> {
        let content_type = self.header("content-type")?;
        content_type.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("charset") {
                return None;
            }
            let value = value.trim().trim_matches(['"', '\'']).to_ascii_lowercase();
            (!value.is_empty()).then_some(value)
        })
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308) && self.header("location").is_some()
    }
}

/// Complete response. `body` is empty when the body was not read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub head: ResponseHead,
    pub body: Vec<u8>,
    pub body_read: bool,
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

fn is_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
