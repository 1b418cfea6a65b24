use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use super::handshake::{self, HandshakeError};
use super::io_stream::IoStream;
use super::BackendAddress;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("could not reach backend: {0}")]
    Connect(#[from] io::Error),
    #[error("backend did not complete the websocket handshake: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Produces a live byte stream for a backend address.
///
/// The pool dials through this seam, so tests can hand out in-memory streams
/// and deployments can swap in their own transport.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, address: &BackendAddress) -> Result<IoStream, DialError>;
}

/// The default dialer: TCP connect followed by the client side of the
/// WebSocket opening handshake, with the origin derived from the address.
#[derive(Debug, Clone, Default)]
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, address: &BackendAddress) -> Result<IoStream, DialError> {
        // Resolve the backend host and try each candidate address,
        // succeeding on the first that connects.
        let mut candidates = tokio::net::lookup_host((address.host(), address.port())).await?;
        let mut connection_error = None;
        let tcp_stream = loop {
            if let Some(candidate) = candidates.next() {
                match TcpStream::connect(candidate).await {
                    Ok(tcp_stream) => {
                        // Proxied traffic is latency-sensitive; send it as it
                        // comes.
                        tcp_stream.set_nodelay(true)?;
                        break tcp_stream;
                    }
                    Err(e) => connection_error = Some(e),
                }
            } else {
                return Err(connection_error
                    .unwrap_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("unknown host: {}", address.host()),
                        )
                    })
                    .into());
            }
        };

        debug!(%address, "dialed backend, starting handshake");
        let stream = handshake::client::connect(IoStream::from(tcp_stream), address).await?;
        Ok(stream)
    }
}
