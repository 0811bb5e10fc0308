//! Transport endpoints.

use core::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Object-safe alias for the streams a channel can wrap.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// A connectable stream endpoint: TCP, TLS over TCP, or a Unix-domain
/// stream socket.
///
/// TLS endpoints carry a pre-built [`tokio_rustls::TlsConnector`];
/// certificate and root-store setup stays with the caller.
pub enum Endpoint {
    /// `host:port`, resolved at connect time.
    Tcp(String),
    #[cfg(feature = "tls")]
    Tls {
        addr: String,
        /// Server name for SNI and certificate verification.
        domain: String,
        connector: tokio_rustls::TlsConnector,
    },
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

impl Endpoint {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::Tcp(addr.into())
    }

    #[cfg(feature = "tls")]
    pub fn tls(
        addr: impl Into<String>,
        domain: impl Into<String>,
        connector: tokio_rustls::TlsConnector,
    ) -> Self {
        Self::Tls {
            addr: addr.into(),
            domain: domain.into(),
            connector,
        }
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    /// Resolve and connect, performing the TLS handshake for TLS endpoints.
    pub(crate) async fn connect(&self) -> io::Result<Box<dyn IoStream>> {
        match self {
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
            #[cfg(feature = "tls")]
            Self::Tls {
                addr,
                domain,
                connector,
            } => {
                let tcp = TcpStream::connect(addr.as_str()).await?;
                tcp.set_nodelay(true).ok();
                let name = rustls::pki_types::ServerName::try_from(domain.clone())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let stream = connector.connect(name, tcp).await?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => f.debug_tuple("Tcp").field(addr).finish(),
            #[cfg(feature = "tls")]
            Self::Tls { addr, domain, .. } => f
                .debug_struct("Tls")
                .field("addr", addr)
                .field("domain", domain)
                .finish_non_exhaustive(),
            #[cfg(unix)]
            Self::Unix(path) => f.debug_tuple("Unix").field(path).finish(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(feature = "tls")]
            Self::Tls { addr, domain, .. } => write!(f, "tls://{addr} ({domain})"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::tcp("127.0.0.1:80").to_string(), "tcp://127.0.0.1:80");
        #[cfg(unix)]
        assert_eq!(Endpoint::unix("/tmp/x.sock").to_string(), "unix:///tmp/x.sock");
    }

    #[cfg(feature = "tls")]
    #[test]
    fn tls_endpoint_construction() {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
        let endpoint = Endpoint::tls("127.0.0.1:443", "localhost", connector);
        assert_eq!(endpoint.to_string(), "tls://127.0.0.1:443 (localhost)");
        assert!(format!("{endpoint:?}").contains("localhost"));
    }
}
