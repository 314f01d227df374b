//! Name resolution and TCP connection contracts.

use pk_core::CaptureError;
use pk_core::CaptureResult;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::time::Duration;

/// Trait-object-safe stream used by the HTTP client.
pub trait IoStream: Read + Write + Send {}
impl<T> IoStream for T where T: Read + Write + Send {}

pub type BoxedIoStream = Box<dyn IoStream>;

/// Name resolution abstraction.
pub trait DnsResolver {
    fn resolve(&self, host: &str, port: u16) -> CaptureResult<Vec<SocketAddr>>;
}

/// Uses the operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDnsResolver;

impl DnsResolver for SystemDnsResolver {
    fn resolve(&self, host: &str, port: u16) -> CaptureResult<Vec<SocketAddr>> {
        let query = format!("{host}:{port}");
        let addresses: Vec<SocketAddr> = query
            .to_socket_addrs()
            .map_err(|error| {
                CaptureError::new(
                    "net.dns.resolve_failed",
                    format!("failed to resolve `{query}`: {error}"),
                )
            })?
            .collect();

        if addresses.is_empty() {
            return Err(CaptureError::new(
                "net.dns.no_results",
                format!("resolver returned no addresses for `{query}`"),
            ));
        }

        Ok(addresses)
    }
}

/// Low-level transport abstraction for opening TCP connections.
pub trait Transport {
    fn connect(&self, address: SocketAddr, timeout: Duration) -> CaptureResult<TcpStream>;
}

/// Standard library TCP transport. `timeout` bounds connect, reads and writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn connect(&self, address: SocketAddr, timeout: Duration) -> CaptureResult<TcpStream> {
        let stream = TcpStream::connect_timeout(&address, timeout).map_err(|error| {
            CaptureError::new(
                "net.transport.connect_failed",
                format!("failed to connect to `{address}`: {error}"),
            )
        })?;

        stream.set_nodelay(true).map_err(|error| {
            CaptureError::new(
                "net.transport.nodelay_failed",
                format!("failed to enable TCP_NODELAY for `{address}`: {error}"),
            )
        })?;

        stream.set_read_timeout(Some(timeout)).map_err(|error| {
            CaptureError::new(
                "net.transport.read_timeout_failed",
                format!("failed to set read timeout for `{address}`: {error}"),
            )
        })?;

        stream.set_write_timeout(Some(timeout)).map_err(|error| {
            CaptureError::new(
                "net.transport.write_timeout_failed",
                format!("failed to set write timeout for `{address}`: {error}"),
            )
        })?;

        Ok(stream)
    }
}

/// Tries each address in turn, returning the first connection.
pub fn connect_first_available<T: Transport>(
    transport: &T,
    addresses: &[SocketAddr],
    timeout: Duration,
) -> CaptureResult<TcpStream> {
    let mut last_error: Option<CaptureError> = None;

    for address in addresses {
        match transport.connect(*address, timeout) {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                last_error = Some(error);
            }
        }
    }

    match last_error {
        Some(error) => Err(error),
        None => Err(CaptureError::new(
            "net.transport.no_addresses",
            "no addresses available to open a connection",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::DnsResolver;
    use super::SystemDnsResolver;
    use super::TcpTransport;
    use super::connect_first_available;
    use std::time::Duration;

    #[test]
    fn resolves_literal_addresses_without_lookup() {
        let resolved = SystemDnsResolver.resolve("127.0.0.1", 8080);
        assert!(resolved.is_ok());
        let resolved = resolved.unwrap_or_default();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].port(), 8080);
    }

    #[test]
    fn empty_address_list_is_an_error() {
        let result = connect_first_available(&TcpTransport, &[], Duration::from_millis(10));
        assert!(result.is_err());
        if let Err(error) = result {
            assert_eq!(error.code, "net.transport.no_addresses");
        }
    }
}
