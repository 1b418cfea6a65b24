//! The persistent pipe: the per-client bridge between a client stream and
//! whatever backend currently backs it.
//!
//! A pipe runs two copy tasks. The forward task reads from the client and
//! writes to the backend; while the backend slot is vacant it stages client
//! bytes in a bounded buffer and flushes them, in order, into the next
//! backend. The backward task reads from the backend and writes to the
//! client. The backend slot itself is a lease published over a watch channel:
//! the manager swaps in a replacement lease after a failure, and both tasks
//! pick it up without the client ever seeing a disconnect.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::defaults;
use crate::transport::IoStream;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipeError {
    #[error("pipe is already streaming")]
    AlreadyStarted,
    #[error("pipe is missing a live stream")]
    MissingStream,
    #[error("client {0} is already connected")]
    DuplicateClient(Uuid),
    #[error("staged bytes would exceed the {limit} byte ceiling while the backend is interrupted")]
    BufferOverflow { limit: usize },
    #[error("client connection failed: {0}")]
    Client(#[source] io::Error),
}

/// A live backend connection, shared between the two copy tasks.
///
/// Exactly one failure is reported per lease: whichever side notices first
/// wins the flag and emits the event, the other side goes quiet.
pub(crate) struct BackendLease {
    serial: u64,
    reader: Mutex<ReadHalf<IoStream>>,
    writer: Mutex<WriteHalf<IoStream>>,
    failed: AtomicBool,
}

impl BackendLease {
    fn new(serial: u64, stream: IoStream) -> Arc<BackendLease> {
        let (reader, writer) = split(stream);
        Arc::new(BackendLease {
            serial,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            failed: AtomicBool::new(false),
        })
    }

    /// Returns true for exactly one caller over the lease's lifetime.
    fn mark_failed(&self) -> bool {
        !self.failed.swap(true, Ordering::AcqRel)
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Raised by a copy task when the backend half of the pipe stops working.
#[derive(Debug)]
pub(crate) struct BackendFailure {
    pub(crate) serial: u64,
}

pub(crate) struct PipeTasks {
    pub(crate) forward: JoinHandle<Result<(), PipeError>>,
    pub(crate) backward: JoinHandle<Result<(), PipeError>>,
}

type LeaseReceiver = watch::Receiver<Option<Arc<BackendLease>>>;

pub struct PersistentPipe {
    id: Uuid,
    client_id: Uuid,
    client: Option<IoStream>,
    buffer_byte_limit: usize,
    lease_tx: watch::Sender<Option<Arc<BackendLease>>>,
    lease_rx: LeaseReceiver,
    event_tx: mpsc::UnboundedSender<BackendFailure>,
    event_rx: Option<mpsc::UnboundedReceiver<BackendFailure>>,
    next_serial: u64,
    started: bool,
    tasks: Option<PipeTasks>,
}

impl PersistentPipe {
    pub fn new(client_id: Uuid, client: IoStream, buffer_byte_limit: usize) -> PersistentPipe {
        let (lease_tx, lease_rx) = watch::channel(None);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        PersistentPipe {
            id: Uuid::new_v4(),
            client_id,
            client: Some(client),
            buffer_byte_limit,
            lease_tx,
            lease_rx,
            event_tx,
            event_rx: Some(event_rx),
            next_serial: 0,
            started: false,
            tasks: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Install a backend stream, clearing any failed state: the copy tasks
    /// observe the fresh lease, the forward task flushes whatever it staged
    /// while the slot was vacant, and the backward task starts reading from
    /// the replacement. Returns the lease serial, which failure events echo.
    pub(crate) fn attach_backend(&mut self, stream: IoStream) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        trace!(pipe = %self.id, serial, "backend lease published");
        let _ = self.lease_tx.send(Some(BackendLease::new(serial, stream)));
        serial
    }

    /// Start the two copy tasks. Returns immediately; the tasks run until
    /// the client side ends or the staging buffer overflows.
    pub fn start(&mut self) -> Result<(), PipeError> {
        if self.started {
            return Err(PipeError::AlreadyStarted);
        }
        if self.lease_rx.borrow().is_none() {
            return Err(PipeError::MissingStream);
        }
        let client = match self.client.take() {
            Some(client) => client,
            None => return Err(PipeError::MissingStream),
        };
        let (client_read, client_write) = split(client);
        debug!(pipe = %self.id, client = %self.client_id, "pipe streaming");
        let forward = tokio::spawn(run_forward(
            client_read,
            self.lease_rx.clone(),
            self.event_tx.clone(),
            self.buffer_byte_limit,
            self.id,
        ));
        let backward = tokio::spawn(run_backward(
            client_write,
            self.lease_rx.clone(),
            self.event_tx.clone(),
            self.id,
        ));
        self.tasks = Some(PipeTasks { forward, backward });
        self.started = true;
        Ok(())
    }

    pub(crate) fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<BackendFailure>> {
        self.event_rx.take()
    }

    pub(crate) fn take_tasks(&mut self) -> Option<PipeTasks> {
        self.tasks.take()
    }
}

/// The currently published lease, if it is live.
fn current_lease(leases: &mut LeaseReceiver) -> Option<Arc<BackendLease>> {
    let lease = leases.borrow_and_update().clone();
    lease.filter(|lease| !lease.is_failed())
}

/// Client to backend. Reads from the client forever; depending on the state
/// of the backend slot, bytes are written through or staged.
async fn run_forward(
    mut client: ReadHalf<IoStream>,
    mut leases: LeaseReceiver,
    events: mpsc::UnboundedSender<BackendFailure>,
    limit: usize,
    pipe_id: Uuid,
) -> Result<(), PipeError> {
    enum Step {
        Bytes(usize),
        LeaseChanged,
        Eof,
    }

    let mut chunk = vec![0u8; defaults::COPY_CHUNK_BYTES];
    let mut staging = BytesMut::new();
    loop {
        let step = tokio::select! {
            read = client.read(&mut chunk) => match read {
                Ok(0) => Step::Eof,
                Ok(n) => Step::Bytes(n),
                Err(error) => return Err(PipeError::Client(error)),
            },
            changed = leases.changed() => match changed {
                Ok(()) => Step::LeaseChanged,
                // The lease channel is gone: the pipe is being torn down.
                Err(_) => Step::Eof,
            },
        };
        match step {
            Step::Eof => {
                debug!(pipe = %pipe_id, "client reached end of stream");
                return Ok(());
            }
            Step::Bytes(n) => {
                let bytes = &chunk[..n];
                forward_bytes(&mut staging, bytes, &mut leases, &events, limit).await?;
            }
            Step::LeaseChanged => {
                // A replacement backend came in; drain the staging buffer
                // into it before any fresh client bytes.
                if !staging.is_empty() {
                    forward_bytes(&mut staging, &[], &mut leases, &events, limit).await?;
                }
            }
        }
    }
}

/// Deliver `bytes` (after anything already staged) to the current backend,
/// or stage them if the slot is vacant. Staged bytes are only dropped once a
/// write covering them fully succeeds.
async fn forward_bytes(
    staging: &mut BytesMut,
    bytes: &[u8],
    leases: &mut LeaseReceiver,
    events: &mpsc::UnboundedSender<BackendFailure>,
    limit: usize,
) -> Result<(), PipeError> {
    let lease = match current_lease(leases) {
        Some(lease) => lease,
        None => return stage(staging, bytes, limit),
    };

    // One write call covers the staged backlog plus the new bytes, so the
    // backend sees them contiguously and in order.
    staging.extend_from_slice(bytes);
    let result = {
        let mut writer = lease.writer.lock().await;
        writer.write_all(staging).await
    };
    match result {
        Ok(()) => {
            staging.clear();
            Ok(())
        }
        Err(error) => {
            if lease.mark_failed() {
                warn!(serial = lease.serial, %error, "backend write failed, staging client bytes");
                let _ = events.send(BackendFailure {
                    serial: lease.serial,
                });
            }
            if staging.len() > limit {
                Err(PipeError::BufferOverflow { limit })
            } else {
                Ok(())
            }
        }
    }
}

fn stage(staging: &mut BytesMut, bytes: &[u8], limit: usize) -> Result<(), PipeError> {
    if staging.len() + bytes.len() > limit {
        return Err(PipeError::BufferOverflow { limit });
    }
    staging.extend_from_slice(bytes);
    Ok(())
}

/// Backend to client. Reads only from a live lease; when the lease fails it
/// stops reading and waits for the replacement. Bytes never replay across a
/// substitution: whatever was not yet read from the failed backend is gone.
async fn run_backward(
    mut client: WriteHalf<IoStream>,
    mut leases: LeaseReceiver,
    events: mpsc::UnboundedSender<BackendFailure>,
    pipe_id: Uuid,
) -> Result<(), PipeError> {
    let mut chunk = vec![0u8; defaults::COPY_CHUNK_BYTES];
    'lease: loop {
        // Wait until a live backend is in the slot.
        let lease = loop {
            match current_lease(&mut leases) {
                Some(lease) => break lease,
                None => {
                    if leases.changed().await.is_err() {
                        // Torn down.
                        return Ok(());
                    }
                }
            }
        };
        trace!(pipe = %pipe_id, serial = lease.serial, "reading from backend");

        loop {
            if lease.is_failed() {
                // The forward task beat us to the failure; stop reading.
                continue 'lease;
            }
            let read = {
                let mut reader = lease.reader.lock().await;
                tokio::select! {
                    read = reader.read(&mut chunk) => Some(read),
                    changed = leases.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        // The slot was swapped under us; abandon this read.
                        None
                    }
                }
            };
            let read = match read {
                Some(read) => read,
                None => continue 'lease,
            };
            match read {
                Ok(0) => {
                    if lease.mark_failed() {
                        debug!(pipe = %pipe_id, serial = lease.serial, "backend closed its stream");
                        let _ = events.send(BackendFailure {
                            serial: lease.serial,
                        });
                    }
                    continue 'lease;
                }
                Err(error) => {
                    if lease.mark_failed() {
                        warn!(pipe = %pipe_id, serial = lease.serial, %error, "backend read failed");
                        let _ = events.send(BackendFailure {
                            serial: lease.serial,
                        });
                    }
                    continue 'lease;
                }
                Ok(n) => {
                    client
                        .write_all(&chunk[..n])
                        .await
                        .map_err(PipeError::Client)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn pipe_with_backend(
        limit: usize,
    ) -> (
        PersistentPipe,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let (client_near, client_far) = tokio::io::duplex(64 * 1024);
        let (backend_near, backend_far) = tokio::io::duplex(64 * 1024);
        let mut pipe = PersistentPipe::new(Uuid::new_v4(), IoStream::from(client_near), limit);
        pipe.attach_backend(IoStream::from(backend_near));
        (pipe, client_far, backend_far)
    }

    #[tokio::test]
    async fn bytes_flow_both_ways() {
        let (mut pipe, mut client, mut backend) = pipe_with_backend(1024);
        pipe.start().unwrap();
        let tasks = pipe.take_tasks().unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // A clean client close ends the forward task without an error.
        drop(client);
        let PipeTasks { forward, backward } = tasks;
        assert!(forward.await.unwrap().is_ok());
        backward.abort();
    }

    #[tokio::test]
    async fn substitution_preserves_byte_order() {
        let (mut pipe, mut client, mut backend1) = pipe_with_backend(1024);
        pipe.start().unwrap();
        let mut events = pipe.take_events().unwrap();
        let tasks = pipe.take_tasks().unwrap();

        // First five bytes make it to the original backend.
        client.write_all(b"AAAAA").await.unwrap();
        let mut buf = [0u8; 5];
        backend1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AAAAA");

        // Kill the backend, then keep sending; the suffix is staged.
        drop(backend1);
        client.write_all(&[b'A'; 15]).await.unwrap();

        let failure = events.recv().await.unwrap();
        assert_eq!(failure.serial, 0);
        // Exactly one event per lease, whichever side noticed first.
        assert!(events.try_recv().is_err());

        // Substitute: the staged suffix lands first, then fresh bytes.
        let (backend2_near, mut backend2) = tokio::io::duplex(64 * 1024);
        pipe.attach_backend(IoStream::from(backend2_near));

        let mut rest = [0u8; 15];
        backend2.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [b'A'; 15]);

        client.write_all(b"BB").await.unwrap();
        let mut tail = [0u8; 2];
        backend2.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"BB");

        // The replacement also serves the backward direction.
        backend2.write_all(b"ok").await.unwrap();
        client.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"ok");

        drop(client);
        let PipeTasks { forward, backward } = tasks;
        assert!(forward.await.unwrap().is_ok());
        backward.abort();
    }

    #[tokio::test]
    async fn overflow_terminates_the_forward_task() {
        let (mut pipe, mut client, backend) = pipe_with_backend(16);
        pipe.start().unwrap();
        let tasks = pipe.take_tasks().unwrap();

        // No backend, and one byte more than the ceiling.
        drop(backend);
        client.write_all(&[b'Q'; 17]).await.unwrap();

        let PipeTasks { forward, backward } = tasks;
        let outcome = forward.await.unwrap();
        assert!(matches!(
            outcome,
            Err(PipeError::BufferOverflow { limit: 16 })
        ));
        backward.abort();
    }

    #[tokio::test]
    async fn large_transfers_survive_chunking() {
        use rand::RngCore;

        let (mut pipe, mut client, mut backend) = pipe_with_backend(1024);
        pipe.start().unwrap();
        let tasks = pipe.take_tasks().unwrap();

        // Several copy chunks worth of data, pushed while the backend reads
        // concurrently.
        let mut payload = vec![0u8; 256 * 1024];
        rand::thread_rng().fill_bytes(&mut payload);
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        backend.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let PipeTasks { forward, backward } = tasks;
        assert!(forward.await.unwrap().is_ok());
        backward.abort();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (mut pipe, _client, _backend) = pipe_with_backend(1024);
        pipe.start().unwrap();
        assert!(matches!(pipe.start(), Err(PipeError::AlreadyStarted)));
        if let Some(PipeTasks { forward, backward }) = pipe.take_tasks() {
            forward.abort();
            backward.abort();
        }
    }

    #[tokio::test]
    async fn start_requires_a_backend() {
        let (client_near, _client_far) = tokio::io::duplex(1024);
        let mut pipe = PersistentPipe::new(Uuid::new_v4(), IoStream::from(client_near), 1024);
        assert!(matches!(pipe.start(), Err(PipeError::MissingStream)));
    }
}
