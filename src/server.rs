//! The accept loop: terminates client WebSocket handshakes, extracts the
//! client identifier, and hands the raw byte stream to the pipe manager.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream::FuturesUnordered, Future, StreamExt};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn};
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::defaults;
use crate::manager::PipeManager;
use crate::transport::handshake;
use crate::transport::IoStream;

/// Produces a client identifier from the path of an accepted upgrade
/// request. Returning `None` refuses the connection.
pub type ClientIdExtractor = Arc<dyn Fn(&str) -> Option<Uuid> + Send + Sync>;

/// The default extractor: the request path, with its leading slash stripped,
/// is the canonical text of the client identifier.
fn client_id_from_path(path: &str) -> Option<Uuid> {
    path.trim_start_matches('/').parse().ok()
}

pub struct Server {
    manager: Arc<PipeManager>,
    handshake_timeout: Duration,
    extract_client_id: ClientIdExtractor,
}

impl Server {
    pub fn new(manager: Arc<PipeManager>) -> Server {
        Server {
            manager,
            handshake_timeout: defaults::handshake_timeout(),
            extract_client_id: Arc::new(client_id_from_path),
        }
    }

    /// Set how long a client gets to finish its opening handshake.
    pub fn handshake_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Replace the default path-based client identifier extractor.
    pub fn client_id_extractor(&mut self, extractor: ClientIdExtractor) -> &mut Self {
        self.extract_client_id = extractor;
        self
    }

    /// Accept connections on `address` until the `terminate` future
    /// resolves, serving each client on its own task.
    pub async fn serve(
        self,
        address: SocketAddr,
        terminate: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), io::Error> {
        // Session-handling tasks report their outcomes through a channel so
        // failures are logged as they happen.
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let outcomes = tokio::spawn(log_outcomes(result_rx));

        // Listen for the termination event and forward it to stop the server.
        let (stop_server, mut recv_stop_server) = mpsc::channel(1);
        tokio::spawn(async move {
            terminate.await;
            stop_server.send(()).await.unwrap_or(());
        });

        let listener = TcpListener::bind(address).await?;
        info!("serving on: {:?}", address);

        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = recv_stop_server.recv() => break,
            };
            match accepted {
                Err(error) => error!("failed to accept a connection: {}", error),
                Ok((tcp_stream, peer)) => {
                    tcp_stream.set_nodelay(true)?;
                    let manager = self.manager.clone();
                    let extract_client_id = self.extract_client_id.clone();
                    let handshake_timeout = self.handshake_timeout;
                    let session = tokio::spawn(
                        handle_client(
                            manager,
                            extract_client_id,
                            handshake_timeout,
                            IoStream::from(tcp_stream),
                        )
                        .instrument(info_span!("client", %peer)),
                    );
                    result_tx.send(session).unwrap_or(());
                }
            }
        }

        drop(result_tx);
        outcomes
            .await
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        Ok(())
    }
}

/// One client session: handshake, identify, bridge.
async fn handle_client(
    manager: Arc<PipeManager>,
    extract_client_id: ClientIdExtractor,
    handshake_timeout: Duration,
    stream: IoStream,
) -> Result<(), anyhow::Error> {
    let incoming =
        tokio::time::timeout(handshake_timeout, handshake::server::accept(stream)).await??;
    let client_id = match extract_client_id(incoming.path()) {
        Some(client_id) => client_id,
        None => {
            let path = incoming.path().to_owned();
            incoming.refuse().await?;
            anyhow::bail!("no client id in request path {:?}", path);
        }
    };
    let stream = incoming.upgrade().await?;
    manager.create_pipe(client_id, stream).await?;
    Ok(())
}

/// Await every session task and log how it ended.
async fn log_outcomes(
    mut result_rx: mpsc::UnboundedReceiver<tokio::task::JoinHandle<Result<(), anyhow::Error>>>,
) {
    let mut results = FuturesUnordered::new();
    loop {
        select! {
            Some(session) = result_rx.recv() => results.push(session),
            Some(result) = results.next() => match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!("client session ended with error: {}", error),
                Err(join_error) => error!("{}", join_error),
            },
            else => break,
        }
    }
}
