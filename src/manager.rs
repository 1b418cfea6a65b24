//! The pipe manager: owns the client registry and performs backend
//! substitution under running pipes.
//!
//! `create_pipe` is the long call of a client session. It acquires a backend,
//! starts the pipe's copy tasks, and then supervises: every time the pipe
//! reports a backend failure, the manager quarantines the failed entry,
//! acquires a replacement from the pool, and attaches it to the running pipe.
//! The call returns when the client side closes or fails, or when the pipe's
//! staging buffer overflows.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::task::JoinError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipe::{PersistentPipe, PipeError, PipeTasks};
use crate::pool::{BackendEntry, BackendPool, BackoffStrategy, RegisterError};
use crate::transport::{BackendAddress, IoStream};
use crate::util::lock;

pub struct PipeManager {
    pool: Arc<BackendPool>,
    clients: Mutex<HashSet<Uuid>>,
    buffer_byte_limit: usize,
    backoff: Option<BackoffStrategy>,
}

impl PipeManager {
    pub fn new(pool: Arc<BackendPool>, buffer_byte_limit: usize) -> PipeManager {
        PipeManager {
            pool,
            clients: Mutex::new(HashSet::new()),
            buffer_byte_limit,
            backoff: None,
        }
    }

    /// Install a delay schedule consulted between pool acquisition attempts
    /// on the substitution path.
    pub fn set_backoff_strategy(&mut self, strategy: BackoffStrategy) {
        self.backoff = Some(strategy);
    }

    /// Register a backend with the pool.
    pub fn register_backend(&self, address: BackendAddress) -> Result<(), RegisterError> {
        self.pool.register(address)
    }

    /// Number of clients with a live pipe.
    pub fn active_clients(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Bridge a client stream to pooled backends until the client side ends.
    ///
    /// Returns `Ok(())` on a clean client close. A second call with the same
    /// client id while the first is live fails immediately, before any
    /// backend is consumed.
    pub async fn create_pipe(&self, client_id: Uuid, client: IoStream) -> Result<(), PipeError> {
        let _registration = self.register_client(client_id)?;
        info!(%client_id, "client connected");
        let result = self.run_pipe(client_id, client).await;
        match &result {
            Ok(()) => info!(%client_id, "client disconnected"),
            Err(error) => warn!(%client_id, %error, "pipe ended"),
        }
        result
    }

    async fn run_pipe(&self, client_id: Uuid, client: IoStream) -> Result<(), PipeError> {
        let mut entry = self.pool.acquire().await;
        debug!(%client_id, backend = %entry.address(), "bridging client to backend");

        let mut pipe = PersistentPipe::new(client_id, client, self.buffer_byte_limit);
        let stream = entry.take_stream().ok_or(PipeError::MissingStream)?;
        let mut current_serial = pipe.attach_backend(stream);
        let mut current_entry = Some(entry);
        pipe.start()?;

        let mut events = match pipe.take_events() {
            Some(events) => events,
            None => return Err(PipeError::AlreadyStarted),
        };
        let PipeTasks {
            mut forward,
            mut backward,
        } = match pipe.take_tasks() {
            Some(tasks) => tasks,
            None => return Err(PipeError::MissingStream),
        };

        let outcome = 'supervise: loop {
            tokio::select! {
                event = events.recv() => {
                    let event = match event {
                        Some(event) => event,
                        None => continue,
                    };
                    // Failures of an already-replaced lease are stale.
                    if event.serial != current_serial {
                        continue;
                    }
                    if let Some(failed) = current_entry.take() {
                        self.pool.report_failure(failed);
                    }
                    info!(%client_id, "backend interrupted, acquiring a replacement");
                    // Keep watching the copy tasks while we wait on the pool:
                    // the client can give up (or the staging buffer overflow)
                    // before a replacement shows up.
                    let mut replacement = tokio::select! {
                        entry = self.pool.acquire_with_backoff(self.backoff.as_ref()) => entry,
                        result = &mut forward => {
                            backward.abort();
                            break 'supervise task_outcome(result);
                        }
                        result = &mut backward => {
                            forward.abort();
                            break 'supervise task_outcome(result);
                        }
                    };
                    let stream = match replacement.take_stream() {
                        Some(stream) => stream,
                        None => {
                            self.pool.report_failure(replacement);
                            continue;
                        }
                    };
                    current_serial = pipe.attach_backend(stream);
                    debug!(%client_id, backend = %replacement.address(), "backend substituted");
                    current_entry = Some(replacement);
                }
                result = &mut forward => {
                    backward.abort();
                    break task_outcome(result);
                }
                result = &mut backward => {
                    forward.abort();
                    break task_outcome(result);
                }
            }
        };

        // Whatever backend the pipe still holds outlived the session intact.
        if let Some(entry) = current_entry.take() {
            self.pool.release(entry);
        }
        outcome
    }

    fn register_client(&self, client_id: Uuid) -> Result<Registration<'_>, PipeError> {
        let mut clients = lock(&self.clients);
        if !clients.insert(client_id) {
            return Err(PipeError::DuplicateClient(client_id));
        }
        Ok(Registration {
            clients: &self.clients,
            client_id,
        })
    }
}

fn task_outcome(result: Result<Result<(), PipeError>, JoinError>) -> Result<(), PipeError> {
    match result {
        Ok(outcome) => outcome,
        Err(join_error) => Err(PipeError::Client(std::io::Error::new(
            std::io::ErrorKind::Other,
            join_error,
        ))),
    }
}

/// Removes the client from the registry when the session ends, however it
/// ends.
struct Registration<'a> {
    clients: &'a Mutex<HashSet<Uuid>>,
    client_id: Uuid,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        lock(self.clients).remove(&self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BackendPool;
    use crate::transport::dial::testing::ScriptedDialer;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    fn address(text: &str) -> BackendAddress {
        text.parse().unwrap()
    }

    fn manager_with_dialer(limit: usize) -> (Arc<PipeManager>, Arc<ScriptedDialer>, Arc<BackendPool>) {
        let dialer = Arc::new(ScriptedDialer::new());
        let pool = BackendPool::new(8, 5, dialer.clone());
        let manager = Arc::new(PipeManager::new(pool.clone(), limit));
        (manager, dialer, pool)
    }

    fn script_dial(dialer: &ScriptedDialer, address: &BackendAddress) -> DuplexStream {
        let (near, far) = tokio::io::duplex(64 * 1024);
        dialer.push(address, IoStream::from(near));
        far
    }

    fn client_id() -> Uuid {
        "098d8a97-3615-4eb8-b803-c57c01c7536c".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_round_trip() {
        let (manager, dialer, pool) = manager_with_dialer(1024);
        let b1 = address("ws://b1");
        let mut backend = script_dial(&dialer, &b1);
        manager.register_backend(b1).unwrap();

        let (client_near, mut client) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn({
            let manager = manager.clone();
            async move { manager.create_pipe(client_id(), IoStream::from(client_near)).await }
        });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        let outcome = timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert!(outcome.is_ok());
        assert_eq!(manager.active_clients(), 0);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_is_transparent_to_the_client() {
        let (manager, dialer, pool) = manager_with_dialer(1024);
        let b1 = address("ws://b1");
        let b2 = address("ws://b2");
        let mut backend1 = script_dial(&dialer, &b1);
        let mut backend2 = script_dial(&dialer, &b2);
        manager.register_backend(b1).unwrap();
        manager.register_backend(b2).unwrap();

        let (client_near, mut client) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn({
            let manager = manager.clone();
            async move { manager.create_pipe(client_id(), IoStream::from(client_near)).await }
        });

        // The first backend in registration order is assigned.
        client.write_all(b"AAAAA").await.unwrap();
        let mut buf = [0u8; 5];
        backend1.read_exact(&mut buf).await.unwrap();

        // Kill it mid-stream; the remaining bytes must reach the substitute
        // in order.
        drop(backend1);
        client.write_all(&[b'A'; 15]).await.unwrap();

        let mut rest = [0u8; 15];
        timeout(Duration::from_secs(30), backend2.read_exact(&mut rest))
            .await
            .expect("substitute backend should receive the staged suffix")
            .unwrap();
        assert_eq!(rest, [b'A'; 15]);

        // And the client never noticed: traffic keeps flowing both ways.
        backend2.write_all(b"again").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");

        drop(client);
        let outcome = timeout(Duration::from_secs(30), session).await.unwrap().unwrap();
        assert!(outcome.is_ok());
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_client_is_rejected_without_consuming_a_backend() {
        let (manager, dialer, pool) = manager_with_dialer(1024);
        let b1 = address("ws://b1");
        let b2 = address("ws://b2");
        let mut backend1 = script_dial(&dialer, &b1);
        manager.register_backend(b1).unwrap();
        manager.register_backend(b2).unwrap();

        let (client_near, mut client) = tokio::io::duplex(64 * 1024);
        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.create_pipe(client_id(), IoStream::from(client_near)).await }
        });

        // A byte makes it through, so the first session holds its backend.
        client.write_all(b"x").await.unwrap();
        let mut byte = [0u8; 1];
        backend1.read_exact(&mut byte).await.unwrap();
        while pool.idle_count() != 1 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let (second_near, _second_far) = tokio::io::duplex(1024);
        let second = manager
            .create_pipe(client_id(), IoStream::from(second_near))
            .await;
        assert!(matches!(second, Err(PipeError::DuplicateClient(_))));

        // The duplicate did not take the remaining idle backend.
        assert_eq!(pool.idle_count(), 1);

        drop(client);
        let outcome = timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
        assert!(outcome.is_ok());
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_surfaces_and_clears_the_registry() {
        let (manager, dialer, pool) = manager_with_dialer(16);
        let b1 = address("ws://b1");
        let mut backend1 = script_dial(&dialer, &b1);
        manager.register_backend(b1).unwrap();

        let (client_near, mut client) = tokio::io::duplex(1024);
        let session = tokio::spawn({
            let manager = manager.clone();
            async move { manager.create_pipe(client_id(), IoStream::from(client_near)).await }
        });

        // A byte makes it through, so the session is bridged; then kill the
        // only backend and push one byte more than the ceiling.
        client.write_all(b"s").await.unwrap();
        let mut byte = [0u8; 1];
        backend1.read_exact(&mut byte).await.unwrap();
        drop(backend1);
        client.write_all(&[b'Q'; 17]).await.unwrap();

        let outcome = timeout(Duration::from_secs(60), session).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            Err(PipeError::BufferOverflow { limit: 16 })
        ));
        assert_eq!(manager.active_clients(), 0);
        pool.shutdown();
    }
}
