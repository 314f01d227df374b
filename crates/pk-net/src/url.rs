//! URL parsing, resolution and page classification.

use pk_core::CaptureError;
use pk_core::CaptureResult;
use url::Url;

/// Schemes the HTTP client can fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::Https)
    }
}

/// Canonical network URL: http(s) only, no userinfo, fragment stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUrl {
    parsed: Url,
    scheme: Scheme,
    host: String,
    port: u16,
}

impl RequestUrl {
    pub fn parse(input: &str) -> CaptureResult<Self> {
        let mut parsed = Url::parse(input).map_err(|error| {
            CaptureError::new(
                "net.url.invalid",
                format!("failed to parse URL `{input}`: {error}"),
            )
        })?;

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(CaptureError::new(
                "net.url.credentials_disallowed",
                "URL userinfo (`username:password@`) is not allowed",
            ));
        }

        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(CaptureError::new(
                    "net.url.scheme_unsupported",
                    format!("unsupported scheme `{other}`"),
                ));
            }
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| CaptureError::new("net.url.host_missing", "URL must include a host"))?
            .to_ascii_lowercase();

        let port = parsed.port_or_known_default().ok_or_else(|| {
            CaptureError::new(
                "net.url.port_missing",
                "unable to determine effective port for URL",
            )
        })?;

        parsed.set_fragment(None);

        Ok(Self {
            parsed,
            scheme,
            host,
            port,
        })
    }

    pub fn as_str(&self) -> &str {
        self.parsed.as_str()
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    pub fn authority(&self) -> String {
        if Some(self.port) == default_port(self.scheme.as_str()) {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn path_and_query(&self) -> String {
        let path = if self.parsed.path().is_empty() {
            "/"
        } else {
            self.parsed.path()
        };

        match self.parsed.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_owned(),
        }
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Resolves `raw` against `base` the way a browser resolves an attribute
/// value. Returns `None` for empty or unparseable input.
pub fn resolve(base: &str, raw: &str) -> Option<Url> {
    let raw = raw.trim_matches(|ch: char| ch.is_ascii_whitespace());
    if raw.is_empty() {
        return None;
    }
    match Url::parse(base) {
        Ok(base) => base.join(raw).ok(),
        Err(_) => Url::parse(raw).ok(),
    }
}

/// True when both URLs name the same document (fragments ignored).
pub fn same_document(left: &Url, right: &Url) -> bool {
    let mut left = left.clone();
    let mut right = right.clone();
    left.set_fragment(None);
    right.set_fragment(None);
    left == right
}

/// ASCII serialization of the URL's origin, `null` for opaque origins.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

pub fn same_origin(left: &Url, right: &Url) -> bool {
    left.origin() == right.origin()
}

const SPECIAL_SCHEMES: &[&str] = &[
    "about:",
    "chrome:",
    "edge:",
    "view-source:",
    "moz-extension:",
    "chrome-extension:",
];

const SPECIAL_HOSTS: &[&str] = &[
    "https://addons.mozilla.org",
    "https://support.mozilla.org",
    "https://chrome.google.com/webstore",
    "https://chromewebstore.google.com",
];

/// Pages the browser does not let extensions script, which therefore cannot
/// be saved.
pub fn is_special_page(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    SPECIAL_SCHEMES.iter().any(|prefix| lower.starts_with(prefix))
        || SPECIAL_HOSTS.iter().any(|prefix| lower.starts_with(prefix))
}
