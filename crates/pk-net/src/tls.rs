//! TLS policy for resource fetches.

use crate::url::RequestUrl;
use crate::url::Scheme;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

impl TlsVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1_2 => "TLS1.2",
            Self::V1_3 => "TLS1.3",
        }
    }
}

/// Controls which trust anchors are used for server certificate verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStoreMode {
    /// Use only the embedded Mozilla/WebPKI roots.
    WebPkiOnly,
    /// Use WebPKI roots and merge operating-system roots (enterprise/local CAs).
    WebPkiAndOs,
}

/// Handshake parameters for one HTTPS request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsHandshakeConfig {
    pub server_name: String,
    pub minimum_version: TlsVersion,
    pub maximum_version: TlsVersion,
    pub alpn_protocols: Vec<String>,
    pub require_ocsp_stapling: bool,
}

/// TLS behaviour for the fetcher. Saving a page must reach whatever hosts
/// the page itself loaded from, so the defaults track what a browser accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    pub minimum_version: TlsVersion,
    pub maximum_version: TlsVersion,
    pub require_ocsp_stapling: bool,
    pub trust_store_mode: TrustStoreMode,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            minimum_version: TlsVersion::V1_2,
            maximum_version: TlsVersion::V1_3,
            require_ocsp_stapling: false,
            trust_store_mode: TrustStoreMode::WebPkiAndOs,
        }
    }
}

impl TlsPolicy {
    pub fn with_trust_store_mode(mut self, mode: TrustStoreMode) -> Self {
        self.trust_store_mode = mode;
        self
    }

    pub fn with_ocsp_stapling_required(mut self, required: bool) -> Self {
        self.require_ocsp_stapling = required;
        self
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.minimum_version > self.maximum_version {
            return Err(CaptureError::new(
                "net.tls.invalid_version_range",
                "minimum TLS version cannot be greater than maximum version",
            ));
        }

        Ok(())
    }

    pub fn handshake_config_for(&self, url: &RequestUrl) -> CaptureResult<Option<TlsHandshakeConfig>> {
        self.validate()?;

        match url.scheme() {
            Scheme::Http => Ok(None),
            Scheme::Https => {
                if url.host().parse::<IpAddr>().is_ok() {
                    return Err(CaptureError::new(
                        "net.tls.sni_host_invalid",
                        "certificate verification requires a DNS host, not a raw IP address",
                    ));
                }

                Ok(Some(TlsHandshakeConfig {
                    server_name: url.host().to_owned(),
                    minimum_version: self.minimum_version,
                    maximum_version: self.maximum_version,
                    alpn_protocols: vec!["http/1.1".to_owned()],
                    require_ocsp_stapling: self.require_ocsp_stapling,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TlsPolicy;
    use super::TlsVersion;
    use super::TrustStoreMode;
    use crate::url::RequestUrl;

    fn url(raw: &str) -> RequestUrl {
        match RequestUrl::parse(raw) {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn validates_version_range() {
        let policy = TlsPolicy {
            minimum_version: TlsVersion::V1_3,
            maximum_version: TlsVersion::V1_2,
            ..TlsPolicy::default()
        };

        assert!(policy.validate().is_err());
    }

    #[test]
    fn creates_handshake_only_for_https() {
        let policy = TlsPolicy::default();
        let secure = policy.handshake_config_for(&url("https://example.com/"));
        assert!(matches!(secure, Ok(Some(config)) if config.server_name == "example.com"));
        let plain = policy.handshake_config_for(&url("http://example.com/"));
        assert_eq!(plain, Ok(None));
    }

    #[test]
    fn defaults_allow_unstapled_certificates() {
        let policy = TlsPolicy::default();
        assert!(!policy.require_ocsp_stapling);
        assert_eq!(policy.trust_store_mode, TrustStoreMode::WebPkiAndOs);
        let strict = policy.with_ocsp_stapling_required(true).with_trust_store_mode(TrustStoreMode::WebPkiOnly);
        assert!(strict.require_ocsp_stapling);
    }
}
