//! The backend connection pool.
//!
//! Backends are registered by address and dialed lazily. An entry is owned by
//! exactly one location at a time: the *available* queue (registered, never
//! yet readied), the *idle* queue (ready for hand-out), the *in-use* set
//! (exclusively held by one pipe), or the *errored* queue (quarantined after
//! a failure). Two background tasks move entries between locations: the idle
//! filler readies registered addresses, and the errored refresher either
//! recycles a quarantined entry or drops it for good once its error count
//! reaches the configured ceiling.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::defaults;
use crate::transport::{BackendAddress, Dialer, IoStream};
use crate::util::lock;

/// Delay schedule consulted while the idle queue is empty: the caller may
/// supply one to reshape the wait between acquisition attempts.
pub type BackoffStrategy = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// One registered backend endpoint.
///
/// The stream is absent while the entry is undialed or quarantined; an entry
/// handed out by [`BackendPool::acquire`] always carries a live stream.
pub struct BackendEntry {
    address: BackendAddress,
    stream: Option<IoStream>,
    error_count: u32,
    last_error_at: Option<Instant>,
}

impl BackendEntry {
    fn undialed(address: BackendAddress) -> BackendEntry {
        BackendEntry {
            address,
            stream: None,
            error_count: 0,
            last_error_at: None,
        }
    }

    pub fn address(&self) -> &BackendAddress {
        &self.address
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_error_at(&self) -> Option<Instant> {
        self.last_error_at
    }

    /// Move the live stream out of the entry, leaving it attached to its
    /// address and error history.
    pub fn take_stream(&mut self) -> Option<IoStream> {
        self.stream.take()
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("backend address already registered: {0}")]
    AlreadyRegistered(BackendAddress),
}

struct Locations {
    registered: HashSet<BackendAddress>,
    available: VecDeque<BackendAddress>,
    idle: VecDeque<BackendEntry>,
    in_use: HashSet<BackendAddress>,
    errored: VecDeque<BackendEntry>,
}

pub struct BackendPool {
    locations: Mutex<Locations>,
    idle_count: AtomicUsize,
    max_idle_connections: usize,
    max_allowed_error_count: u32,
    dialer: Arc<dyn Dialer>,
    shutdown: watch::Sender<bool>,
}

impl BackendPool {
    /// Create a pool and start its two background tasks. The tasks run until
    /// [`shutdown`](BackendPool::shutdown) is called or every handle to the
    /// pool is dropped.
    pub fn new(
        max_idle_connections: usize,
        max_allowed_error_count: u32,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<BackendPool> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(BackendPool {
            locations: Mutex::new(Locations {
                registered: HashSet::new(),
                available: VecDeque::new(),
                idle: VecDeque::new(),
                in_use: HashSet::new(),
                errored: VecDeque::new(),
            }),
            idle_count: AtomicUsize::new(0),
            max_idle_connections,
            max_allowed_error_count,
            dialer,
            shutdown,
        });

        tokio::spawn(maintain(
            Arc::downgrade(&pool),
            shutdown_rx.clone(),
            BackendPool::fill_one,
        ));
        tokio::spawn(maintain(
            Arc::downgrade(&pool),
            shutdown_rx,
            BackendPool::refresh_one,
        ));

        pool
    }

    /// Register a backend address. Duplicates are rejected; the address set
    /// remembers every address ever registered, including evicted ones.
    pub fn register(&self, address: BackendAddress) -> Result<(), RegisterError> {
        let mut locations = lock(&self.locations);
        if !locations.registered.insert(address.clone()) {
            return Err(RegisterError::AlreadyRegistered(address));
        }
        debug!(%address, "backend registered");
        locations.available.push_back(address);
        Ok(())
    }

    /// Take exclusive ownership of a ready backend, dialing it if needed.
    ///
    /// Blocks until an entry can be handed out; an exhausted fleet never
    /// resolves. Dial failures are internal: the failed entry is quarantined
    /// and the wait continues.
    pub async fn acquire(&self) -> BackendEntry {
        self.acquire_with_backoff(None).await
    }

    pub(crate) async fn acquire_with_backoff(
        &self,
        backoff: Option<&BackoffStrategy>,
    ) -> BackendEntry {
        let mut retries = 0u32;
        loop {
            let popped = {
                let mut locations = lock(&self.locations);
                locations.idle.pop_front()
            };
            let entry = match popped {
                Some(entry) => {
                    self.idle_count.fetch_sub(1, Ordering::AcqRel);
                    entry
                }
                None => {
                    let delay = match backoff {
                        Some(strategy) => strategy(retries),
                        None => acquire_delay(retries),
                    };
                    retries = retries.saturating_add(1);
                    time::sleep(delay).await;
                    continue;
                }
            };

            // The dial below is a suspension point; the pending hand-out puts
            // the entry back at the front of the idle queue if this future is
            // dropped mid-dial.
            let mut pending = PendingHandOut {
                pool: self,
                entry: Some(entry),
            };
            let mut dial_failure = None;
            if let Some(entry) = pending.entry.as_mut() {
                if entry.stream.is_none() {
                    let address = entry.address.clone();
                    match self.dialer.dial(&address).await {
                        Ok(stream) => entry.stream = Some(stream),
                        Err(error) => dial_failure = Some((address, error)),
                    }
                }
            }
            let entry = match pending.into_entry() {
                Some(entry) => entry,
                None => continue,
            };
            if let Some((address, error)) = dial_failure {
                debug!(%address, %error, "backend dial failed");
                self.report_failure(entry);
                continue;
            }

            let mut locations = lock(&self.locations);
            locations.in_use.insert(entry.address.clone());
            trace!(address = %entry.address, "backend handed out");
            return entry;
        }
    }

    /// Quarantine an entry whose stream has failed: the in-use marker is
    /// dropped, the error is stamped and counted, and the entry joins the
    /// errored queue for the refresher to recycle or evict.
    pub fn report_failure(&self, mut entry: BackendEntry) {
        let mut locations = lock(&self.locations);
        locations.in_use.remove(&entry.address);
        entry.stream = None;
        entry.error_count += 1;
        entry.last_error_at = Some(Instant::now());
        warn!(
            address = %entry.address,
            errors = entry.error_count,
            "backend connection failed"
        );
        locations.errored.push_back(entry);
    }

    /// Return a healthy entry whose session is over. The live connection is
    /// dropped; the entry re-enters the idle queue undialed.
    pub fn release(&self, mut entry: BackendEntry) {
        let mut locations = lock(&self.locations);
        locations.in_use.remove(&entry.address);
        entry.stream = None;
        locations.idle.push_back(entry);
        self.idle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of entries currently in the idle queue.
    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    /// Stop the background tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// One step of the idle filler: ready a registered address unless the
    /// idle queue is over its ceiling. Returns whether it made progress.
    fn fill_one(&self) -> bool {
        if self.idle_count.load(Ordering::Acquire) > self.max_idle_connections {
            return false;
        }
        let mut locations = lock(&self.locations);
        match locations.available.pop_front() {
            Some(address) => {
                trace!(%address, "backend ready for hand-out");
                locations.idle.push_back(BackendEntry::undialed(address));
                self.idle_count.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// One step of the errored refresher: recycle the oldest quarantined
    /// entry, or drop it for good once its error count reaches the ceiling.
    /// Returns whether it made progress.
    fn refresh_one(&self) -> bool {
        let popped = {
            let mut locations = lock(&self.locations);
            locations.errored.pop_front()
        };
        let mut entry = match popped {
            Some(entry) => entry,
            None => return false,
        };
        if entry.error_count < self.max_allowed_error_count {
            // Force a redial on the next hand-out.
            entry.stream = None;
            let mut locations = lock(&self.locations);
            locations.idle.push_back(entry);
            self.idle_count.fetch_add(1, Ordering::AcqRel);
        } else {
            info!(
                address = %entry.address,
                errors = entry.error_count,
                "backend permanently evicted"
            );
        }
        true
    }

    fn requeue_front(&self, entry: BackendEntry) {
        let mut locations = lock(&self.locations);
        locations.idle.push_front(entry);
        self.idle_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// 2^min(i, 5) seconds.
fn acquire_delay(retries: u32) -> Duration {
    Duration::from_secs(1u64 << retries.min(5))
}

/// An idle entry held across the dial suspension point. Dropping it without
/// [`into_entry`](PendingHandOut::into_entry) hands the entry back.
struct PendingHandOut<'a> {
    pool: &'a BackendPool,
    entry: Option<BackendEntry>,
}

impl PendingHandOut<'_> {
    fn into_entry(mut self) -> Option<BackendEntry> {
        self.entry.take()
    }
}

impl Drop for PendingHandOut<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.requeue_front(entry);
        }
    }
}

/// Drive one of the pool's background steps until shutdown, sleeping a tick
/// whenever the step has nothing to do.
async fn maintain(
    pool: Weak<BackendPool>,
    mut shutdown: watch::Receiver<bool>,
    step: fn(&BackendPool) -> bool,
) {
    loop {
        let made_progress = match pool.upgrade() {
            Some(pool) => step(&pool),
            None => return,
        };
        if made_progress {
            continue;
        }
        tokio::select! {
            _ = time::sleep(defaults::POOL_TICK) => {}
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
