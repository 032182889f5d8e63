//! A bounded pool of pre-established associations with one peer.
//!
//! Connections are created eagerly up to `min_size` at initialization, on
//! demand up to `max_size` under load, validated with C-ECHO on borrow,
//! reset and re-queued on return, and pruned back toward `min_size` by a
//! periodic maintenance pass.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dimse::{Channel, Connector, Target};
use serde::Deserialize;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timed out waiting for a connection to {0}")]
    BorrowTimeout(String),
    #[error("connection pool for {0} is shut down")]
    Shutdown(String),
    #[error("connection pool for {0} is not initialized")]
    NotInitialized(String),
    #[error("failed to establish initial connections: {0}")]
    Initialize(#[source] dimse::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Idle connections above `min_size` older than this are evicted.
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,
    /// Default deadline for [`Pool::borrow`].
    #[serde(with = "humantime_serde")]
    pub borrow_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub validation_interval: Duration,
    pub validate_on_borrow: bool,
    pub validate_on_return: bool,
    /// How long shutdown waits for active borrows to come home.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            max_idle_time: Duration::from_secs(300),
            borrow_timeout: Duration::from_secs(5),
            validation_interval: Duration::from_secs(60),
            validate_on_borrow: true,
            validate_on_return: false,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Point-in-time pool statistics. The `total_*` counters are monotonic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_size: usize,
    pub available_size: usize,
    pub active_size: usize,
    pub max_size: usize,
    pub total_borrowed: u64,
    pub total_created: u64,
    pub total_destroyed: u64,
}

struct IdleConn {
    chan: Box<dyn Channel>,
    since: Instant,
}

struct State {
    idle: VecDeque<IdleConn>,
    /// Idle + active + reserved-for-creation.
    total: usize,
    active: usize,
    initialized: bool,
    running: bool,
    total_borrowed: u64,
    total_created: u64,
    total_destroyed: u64,
}

struct Shared {
    target: Target,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<State>,
    /// Signaled when a connection or slot frees up, and on shutdown.
    notify: Notify,
}

/// Connection pool for a single peer.
pub struct Pool {
    shared: Arc<Shared>,
    maintenance: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Pool {
    pub fn new(target: Target, connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                target,
                connector,
                config,
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    total: 0,
                    active: 0,
                    initialized: false,
                    running: false,
                    total_borrowed: 0,
                    total_created: 0,
                    total_destroyed: 0,
                }),
                notify: Notify::new(),
            }),
            maintenance: Mutex::new(None),
        }
    }

    /// Peer AE title this pool serves.
    pub fn peer(&self) -> &str {
        &self.shared.target.ae_title
    }

    /// Eagerly establish `min_size` connections and start the maintenance
    /// loop. A connect failure tears down whatever was created.
    pub async fn initialize(&self) -> Result<(), Error> {
        {
            let state = self.shared.state.lock().await;
            if state.initialized {
                return Ok(());
            }
        }

        let mut created = Vec::new();
        for _ in 0..self.shared.config.min_size {
            match self.shared.connector.connect(&self.shared.target).await {
                Ok(chan) => created.push(IdleConn {
                    chan,
                    since: Instant::now(),
                }),
                Err(err) => {
                    tracing::error!(
                        peer = %self.peer(),
                        error = %err,
                        "initial connection failed, rolling back pool"
                    );
                    return Err(Error::Initialize(err));
                }
            }
        }

        {
            let mut state = self.shared.state.lock().await;
            state.total = created.len();
            state.total_created = created.len() as u64;
            state.idle = created.into();
            state.initialized = true;
            state.running = true;
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(maintenance_loop(shared));
        *self.maintenance.lock().await = Some(handle);

        tracing::info!(peer = %self.peer(), min = self.shared.config.min_size, "pool initialized");
        Ok(())
    }

    /// Borrow with the configured default timeout.
    pub async fn borrow(&self) -> Result<Pooled, Error> {
        self.borrow_with_timeout(self.shared.config.borrow_timeout)
            .await
    }

    /// Borrow a connection, waiting up to `timeout` for one to free up.
    /// Creates a new connection when none is idle and the pool is below
    /// `max_size`.
    pub async fn borrow_with_timeout(&self, timeout: Duration) -> Result<Pooled, Error> {
        let deadline = Instant::now() + timeout;
        let shared = &self.shared;

        loop {
            let candidate = {
                let mut state = shared.state.lock().await;
                if !state.initialized {
                    return Err(Error::NotInitialized(self.peer().to_string()));
                }
                if !state.running {
                    return Err(Error::Shutdown(self.peer().to_string()));
                }
                state.idle.pop_front()
            };

            if let Some(mut idle) = candidate {
                if shared.config.validate_on_borrow && !validate(idle.chan.as_mut()).await {
                    destroy_one(shared, idle.chan).await;
                    continue;
                }
                let mut state = shared.state.lock().await;
                state.active += 1;
                state.total_borrowed += 1;
                return Ok(Pooled {
                    chan: Some(idle.chan),
                    shared: shared.clone(),
                });
            }

            // Nothing idle: reserve a slot and dial, if below max.
            let reserved = {
                let mut state = shared.state.lock().await;
                if state.total < shared.config.max_size {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };

            if reserved {
                match shared.connector.connect(&shared.target).await {
                    Ok(chan) => {
                        let mut state = shared.state.lock().await;
                        state.total_created += 1;
                        state.active += 1;
                        state.total_borrowed += 1;
                        return Ok(Pooled {
                            chan: Some(chan),
                            shared: shared.clone(),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(peer = %self.peer(), error = %err, "connect failed");
                        let mut state = shared.state.lock().await;
                        state.total -= 1;
                        drop(state);
                        shared.notify.notify_one();
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::BorrowTimeout(self.peer().to_string()));
            }
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = tokio::time::sleep(deadline - now) => {
                    return Err(Error::BorrowTimeout(self.peer().to_string()));
                }
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().await;
        PoolStats {
            total_size: state.total,
            available_size: state.idle.len(),
            active_size: state.active,
            max_size: self.shared.config.max_size,
            total_borrowed: state.total_borrowed,
            total_created: state.total_created,
            total_destroyed: state.total_destroyed,
        }
    }

    /// Drain active borrows (up to the grace deadline), then close all
    /// connections and stop the maintenance loop.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().await;
            if !state.initialized {
                return;
            }
            state.running = false;
            state.initialized = false;
        }
        self.shared.notify.notify_waiters();

        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        let grace = Instant::now() + self.shared.config.shutdown_grace;
        loop {
            let active = self.shared.state.lock().await.active;
            if active == 0 || Instant::now() >= grace {
                if active > 0 {
                    tracing::warn!(peer = %self.peer(), active, "shutdown grace expired");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut state = self.shared.state.lock().await;
        let dropped = state.idle.len();
        state.idle.clear();
        state.total_destroyed += dropped as u64;
        state.total = state.total.saturating_sub(dropped);
        tracing::info!(peer = %self.peer(), "pool shut down");
    }
}

/// A borrowed connection. Returning it happens on drop: the channel is
/// reset, optionally validated, and re-queued; failures destroy it and
/// free the slot for a waiter.
pub struct Pooled {
    chan: Option<Box<dyn Channel>>,
    shared: Arc<Shared>,
}

impl Pooled {
    pub fn channel(&mut self) -> &mut dyn Channel {
        self.chan.as_deref_mut().unwrap()
    }
}

impl std::ops::Deref for Pooled {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.chan.as_deref().unwrap()
    }
}

impl std::ops::DerefMut for Pooled {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.chan.as_deref_mut().unwrap()
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        if let Some(chan) = self.chan.take() {
            let shared = self.shared.clone();
            tokio::spawn(give_back(shared, chan));
        }
    }
}

async fn validate(chan: &mut dyn Channel) -> bool {
    chan.is_alive() && chan.echo().await.is_ok()
}

async fn destroy_one(shared: &Arc<Shared>, chan: Box<dyn Channel>) {
    tracing::debug!(peer = %shared.target.ae_title, id = chan.id(), "destroying connection");
    drop(chan);
    let mut state = shared.state.lock().await;
    state.total = state.total.saturating_sub(1);
    state.total_destroyed += 1;
    drop(state);
    shared.notify.notify_one();
}

async fn give_back(shared: Arc<Shared>, mut chan: Box<dyn Channel>) {
    {
        let mut state = shared.state.lock().await;
        state.active = state.active.saturating_sub(1);
        if !state.running {
            state.total = state.total.saturating_sub(1);
            state.total_destroyed += 1;
            return;
        }
    }

    if shared.config.validate_on_return && !validate(chan.as_mut()).await {
        destroy_one(&shared, chan).await;
        return;
    }

    if let Err(err) = chan.reset().await {
        tracing::debug!(peer = %shared.target.ae_title, error = %err, "reset failed on return");
        destroy_one(&shared, chan).await;
        return;
    }

    let mut state = shared.state.lock().await;
    state.idle.push_back(IdleConn {
        chan,
        since: Instant::now(),
    });
    drop(state);
    shared.notify.notify_one();
}

/// Periodic pass: evict idle-expired and invalid connections, then top the
/// pool back up to `min_size`.
async fn maintenance_loop(shared: Arc<Shared>) {
    let interval = shared.config.validation_interval;
    loop {
        tokio::time::sleep(interval).await;

        let (mut candidates, min_size) = {
            let mut state = shared.state.lock().await;
            if !state.running {
                return;
            }
            (
                std::mem::take(&mut state.idle),
                shared.config.min_size,
            )
        };

        let mut keep: VecDeque<IdleConn> = VecDeque::new();
        while let Some(mut idle) = candidates.pop_front() {
            let over_min = {
                let state = shared.state.lock().await;
                state.total > min_size
            };
            if over_min && idle.since.elapsed() > shared.config.max_idle_time {
                tracing::debug!(peer = %shared.target.ae_title, "evicting idle connection");
                destroy_one(&shared, idle.chan).await;
                continue;
            }
            if !validate(idle.chan.as_mut()).await {
                destroy_one(&shared, idle.chan).await;
                continue;
            }
            keep.push_back(idle);
        }

        {
            let mut state = shared.state.lock().await;
            if !state.running {
                return;
            }
            // Returns that raced the sweep stay where they landed.
            for conn in keep {
                state.idle.push_back(conn);
            }
        }

        // Top back up to min_size.
        loop {
            let reserve = {
                let mut state = shared.state.lock().await;
                if state.running && state.total < min_size {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };
            if !reserve {
                break;
            }
            match shared.connector.connect(&shared.target).await {
                Ok(chan) => {
                    let mut state = shared.state.lock().await;
                    state.total_created += 1;
                    state.idle.push_back(IdleConn {
                        chan,
                        since: Instant::now(),
                    });
                    drop(state);
                    shared.notify.notify_one();
                }
                Err(err) => {
                    tracing::warn!(
                        peer = %shared.target.ae_title,
                        error = %err,
                        "maintenance top-up connect failed"
                    );
                    let mut state = shared.state.lock().await;
                    state.total -= 1;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dimse::testing::ScriptedPeer;

    fn target() -> Target {
        Target {
            ae_title: "PEER1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 11112,
            calling_ae: "CLIENT".to_string(),
            operation_timeout: Duration::from_secs(5),
            tls_profile: None,
        }
    }

    fn pool_with(peer: &ScriptedPeer, config: PoolConfig) -> Pool {
        Pool::new(target(), Arc::new(peer.clone()), config)
    }

    #[tokio::test]
    async fn initialize_creates_min_size_connections() {
        let peer = ScriptedPeer::new();
        let pool = pool_with(
            &peer,
            PoolConfig {
                min_size: 3,
                ..PoolConfig::default()
            },
        );
        pool.initialize().await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.total_size, 3);
        assert_eq!(stats.available_size, 3);
        assert_eq!(peer.connect_calls(), 3);
    }

    #[tokio::test]
    async fn initialize_rolls_back_on_connect_failure() {
        let peer = ScriptedPeer::new();
        peer.fail_next_connects(1);
        let pool = pool_with(
            &peer,
            PoolConfig {
                min_size: 2,
                ..PoolConfig::default()
            },
        );
        assert!(matches!(
            pool.initialize().await,
            Err(Error::Initialize(_))
        ));

        // Pool never became usable.
        assert!(matches!(
            pool.borrow().await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn borrow_grows_to_max_then_times_out() {
        let peer = ScriptedPeer::new();
        let pool = pool_with(
            &peer,
            PoolConfig {
                min_size: 1,
                max_size: 2,
                validate_on_borrow: false,
                ..PoolConfig::default()
            },
        );
        pool.initialize().await.unwrap();

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        assert_eq!(pool.stats().await.active_size, 2);

        // At max: a zero-timeout borrow fails immediately.
        let denied = pool.borrow_with_timeout(Duration::ZERO).await;
        assert!(matches!(denied, Err(Error::BorrowTimeout(_))));

        // With a window, a returning borrower unblocks the waiter.
        drop(a);
        let c = pool.borrow_with_timeout(Duration::from_secs(1)).await;
        assert!(c.is_ok());
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn returned_connections_are_reset_and_reused() {
        let peer = ScriptedPeer::new();
        let pool = pool_with(
            &peer,
            PoolConfig {
                min_size: 1,
                max_size: 1,
                validate_on_borrow: false,
                ..PoolConfig::default()
            },
        );
        pool.initialize().await.unwrap();

        let conn = pool.borrow().await.unwrap();
        drop(conn);

        // Drop return is asynchronous.
        let deadline = Instant::now() + Duration::from_secs(1);
        while pool.stats().await.available_size == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = pool.stats().await;
        assert_eq!(stats.available_size, 1);
        assert_eq!(stats.total_borrowed, 1);
        assert_eq!(peer.reset_calls(), 1);
        assert_eq!(peer.connect_calls(), 1, "reused, not re-dialed");

        let again = pool.borrow().await.unwrap();
        assert_eq!(pool.stats().await.total_borrowed, 2);
        drop(again);
    }

    #[tokio::test]
    async fn validate_on_borrow_discards_dead_connections() {
        let peer = ScriptedPeer::new();
        let pool = pool_with(
            &peer,
            PoolConfig {
                min_size: 1,
                max_size: 2,
                ..PoolConfig::default()
            },
        );
        pool.initialize().await.unwrap();

        // The queued echo failure makes validation discard the idle
        // connection; the pool dials a replacement.
        peer.push_echo(Err(dimse::Error::ConnectionReset));
        let conn = pool.borrow().await.unwrap();
        drop(conn);

        let stats = pool.stats().await;
        assert_eq!(stats.total_destroyed, 1);
        assert_eq!(peer.connect_calls(), 2);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_borrows() {
        let peer = ScriptedPeer::new();
        let pool = pool_with(&peer, PoolConfig::default());
        pool.initialize().await.unwrap();
        pool.shutdown().await;

        assert!(matches!(
            pool.borrow().await,
            Err(Error::NotInitialized(_)) | Err(Error::Shutdown(_))
        ));
    }
}
