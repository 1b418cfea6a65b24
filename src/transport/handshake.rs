//! The WebSocket opening handshakes, server and client side. Both stop at the
//! upgrade boundary: the bytes that follow the switch to the websocket
//! protocol are never framed or parsed here, they flow through the bridging
//! core untouched.

use bytes::{Bytes, BytesMut};
use ring::digest;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::io_stream::IoStream;
use super::BackendAddress;

/// Upper bound on the size of a request or response head.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Maximum number of headers parsed out of a head.
const MAX_HEADERS: usize = 32;

/// Fixed GUID appended to the client key when computing the accept digest
/// (RFC 6455 section 4.2.2).
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection closed in the middle of the handshake")]
    ConnectionClosed,
    #[error("request or response head exceeds {} bytes", MAX_HEAD_BYTES)]
    HeadTooLarge,
    #[error("malformed HTTP head")]
    MalformedHead,
    #[error("request is not a websocket upgrade")]
    NotAnUpgrade,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("peer refused the upgrade with status {code}")]
    Refused { code: u16 },
    #[error("Sec-WebSocket-Accept does not match the handshake key")]
    KeyMismatch,
    #[error("could not gather entropy for the handshake key")]
    Entropy,
}

/// Compute the `Sec-WebSocket-Accept` value for a handshake key.
fn accept_key(key: &str) -> String {
    let input = format!("{}{}", key, ACCEPT_GUID);
    let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes());
    base64::encode(digest.as_ref())
}

/// Case-insensitive header lookup; values come back trimmed and owned.
fn find_header(headers: &[httparse::Header<'_>], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .and_then(|header| std::str::from_utf8(header.value).ok())
        .map(|value| value.trim().to_owned())
}

/// `Connection` is a comma-separated token list; the upgrade token may sit
/// next to others (`keep-alive, Upgrade`).
fn has_upgrade_token(value: &str) -> bool {
    value
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

pub(crate) mod server {
    use super::*;

    /// A validated upgrade request that has not been answered yet.
    ///
    /// The caller inspects the request path (to extract a client identifier)
    /// and then either [`upgrade`](Incoming::upgrade)s the connection or
    /// [`refuse`](Incoming::refuse)s it.
    pub struct Incoming {
        path: String,
        accept: String,
        stream: IoStream,
        leftover: Bytes,
    }

    impl Incoming {
        pub fn path(&self) -> &str {
            &self.path
        }

        /// Complete the upgrade: send the 101 response and hand back the raw
        /// byte stream, with any bytes the client pipelined after its request
        /// head replayed in front.
        pub async fn upgrade(mut self) -> Result<IoStream, HandshakeError> {
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                self.accept
            );
            self.stream.write_all(response.as_bytes()).await?;
            Ok(IoStream::replay(self.leftover, self.stream))
        }

        /// Turn the client away and close the connection.
        pub async fn refuse(mut self) -> Result<(), HandshakeError> {
            self.stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
                .await?;
            self.stream.shutdown().await?;
            Ok(())
        }
    }

    /// Read and validate a client's opening request.
    pub(crate) async fn accept(mut stream: IoStream) -> Result<Incoming, HandshakeError> {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            let parsed = {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut request = httparse::Request::new(&mut headers);
                match request
                    .parse(&buf)
                    .map_err(|_| HandshakeError::MalformedHead)?
                {
                    httparse::Status::Complete(head_len) => {
                        if request.method != Some("GET") {
                            return Err(HandshakeError::NotAnUpgrade);
                        }
                        let upgrade = find_header(request.headers, "upgrade")
                            .filter(|value| value.eq_ignore_ascii_case("websocket"));
                        let connection = find_header(request.headers, "connection")
                            .filter(|value| has_upgrade_token(value));
                        if upgrade.is_none() || connection.is_none() {
                            return Err(HandshakeError::NotAnUpgrade);
                        }
                        let key = find_header(request.headers, "sec-websocket-key")
                            .ok_or(HandshakeError::MissingKey)?;
                        let path = request.path.unwrap_or("/").to_owned();
                        Some((path, key, head_len))
                    }
                    httparse::Status::Partial => None,
                }
            };
            match parsed {
                Some((path, key, head_len)) => {
                    let leftover = Bytes::copy_from_slice(&buf[head_len..]);
                    return Ok(Incoming {
                        path,
                        accept: accept_key(&key),
                        stream,
                        leftover,
                    });
                }
                None => {
                    if buf.len() >= MAX_HEAD_BYTES {
                        return Err(HandshakeError::HeadTooLarge);
                    }
                    if stream.read_buf(&mut buf).await? == 0 {
                        return Err(HandshakeError::ConnectionClosed);
                    }
                }
            }
        }
    }
}

pub(super) mod client {
    use super::*;
    use ring::rand::{SecureRandom, SystemRandom};

    /// Run the client side of the opening handshake against a freshly
    /// connected backend stream. On success the returned stream carries raw
    /// post-upgrade bytes, with anything the backend pipelined after its
    /// response head replayed in front.
    pub(crate) async fn connect(
        mut stream: IoStream,
        address: &BackendAddress,
    ) -> Result<IoStream, HandshakeError> {
        let key = fresh_key()?;
        let request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Origin: {}\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            address.path(),
            address.authority(),
            address.origin(),
            key
        );
        stream.write_all(request.as_bytes()).await?;

        let mut buf = BytesMut::with_capacity(1024);
        loop {
            let parsed = {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut response = httparse::Response::new(&mut headers);
                match response
                    .parse(&buf)
                    .map_err(|_| HandshakeError::MalformedHead)?
                {
                    httparse::Status::Complete(head_len) => {
                        let code = response.code.ok_or(HandshakeError::MalformedHead)?;
                        if code != 101 {
                            return Err(HandshakeError::Refused { code });
                        }
                        let accept = find_header(response.headers, "sec-websocket-accept")
                            .ok_or(HandshakeError::MissingKey)?;
                        Some((accept, head_len))
                    }
                    httparse::Status::Partial => None,
                }
            };
            match parsed {
                Some((accept, head_len)) => {
                    if accept != accept_key(&key) {
                        return Err(HandshakeError::KeyMismatch);
                    }
                    let leftover = Bytes::copy_from_slice(&buf[head_len..]);
                    return Ok(IoStream::replay(leftover, stream));
                }
                None => {
                    if buf.len() >= MAX_HEAD_BYTES {
                        return Err(HandshakeError::HeadTooLarge);
                    }
                    if stream.read_buf(&mut buf).await? == 0 {
                        return Err(HandshakeError::ConnectionClosed);
                    }
                }
            }
        }
    }

    /// A fresh random handshake key: 16 bytes of entropy, base64-encoded.
    fn fresh_key() -> Result<String, HandshakeError> {
        let mut nonce = [0u8; 16];
        SystemRandom::new()
            .fill(&mut nonce)
            .map_err(|_| HandshakeError::Entropy)?;
        Ok(base64::encode(nonce))
    }
}
