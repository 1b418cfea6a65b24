//! The transport layer: typed backend addresses, the opaque byte stream the
//! bridging core consumes, and the WebSocket opening handshakes that produce
//! those streams.

pub mod dial;
pub mod handshake;
pub mod io_stream;

pub use dial::{DialError, Dialer, WebSocketDialer};
pub use handshake::HandshakeError;
pub use io_stream::IoStream;

use http::uri::{InvalidUri, Uri};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// The address of a pooled backend: a URI of the form `ws://some.domain.com:9000/path`
/// with an optional port number and path.
///
/// Addresses compare and hash by their canonical form, so `ws://b1` and
/// `ws://b1/` are the same backend. The proxy does not terminate TLS, so only
/// the plain `ws` scheme is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
pub struct BackendAddress {
    host: String,
    port: Option<u16>,
    path: String,
}

impl BackendAddress {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(crate::defaults::backend_port)
    }

    /// The request path sent on the opening handshake.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The `host[:port]` form used for the `Host` header and for dialing.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// The origin derived from this address, sent on the opening handshake.
    pub fn origin(&self) -> String {
        format!("http://{}", self.authority())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidBackendAddress {
    #[error("Incorrect URI scheme: expecting `ws://`")]
    IncorrectScheme,
    #[error("Missing hostname in backend address")]
    MissingHost,
    #[error("Invalid backend address: {0}")]
    InvalidUri(#[from] InvalidUri),
}

impl FromStr for BackendAddress {
    type Err = InvalidBackendAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri: Uri = s.parse()?;
        if uri.scheme_str() != Some("ws") {
            Err(InvalidBackendAddress::IncorrectScheme)
        } else if let Some(host) = uri.host() {
            let path = match uri.path_and_query() {
                Some(path) if path.as_str() != "/" && !path.as_str().is_empty() => {
                    path.as_str().to_owned()
                }
                _ => "/".to_owned(),
            };
            Ok(BackendAddress {
                host: host.to_owned(),
                port: uri.port_u16(),
                path,
            })
        } else {
            Err(InvalidBackendAddress::MissingHost)
        }
    }
}

impl Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ws://{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if self.path != "/" {
            write!(f, "{}", self.path)?;
        }
        Ok(())
    }
}
