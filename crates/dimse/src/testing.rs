//! Scripted in-memory peers for exercising the fabric without a wire.
//!
//! A [`ScriptedPeer`] plays the role of one remote archive: outcomes for
//! echo and store calls are queued ahead of time, find results and move
//! sub-operations are configured as datasets, and every wire call is
//! counted so tests can assert on exactly what reached the peer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::{Channel, Connector, Dataset, Error, MoveProgress, Target};

#[derive(Default)]
struct PeerState {
    connect_failures: AtomicUsize,
    echo_outcomes: Mutex<VecDeque<Result<(), Error>>>,
    store_outcomes: Mutex<VecDeque<Result<(), Error>>>,
    find_results: Mutex<Vec<Dataset>>,
    move_items: Mutex<Vec<Dataset>>,
    op_delay: Mutex<Duration>,
    move_item_delay: Mutex<Duration>,
    stored: Mutex<Vec<Dataset>>,
    dead: AtomicBool,

    connects: AtomicU64,
    echoes: AtomicU64,
    finds: AtomicU64,
    moves: AtomicU64,
    stores: AtomicU64,
    resets: AtomicU64,
    next_channel: AtomicU64,
}

/// A programmable peer. Clones share state.
#[derive(Clone, Default)]
pub struct ScriptedPeer {
    state: Arc<PeerState>,
}

impl ScriptedPeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject this many association attempts before accepting again.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn push_echo(&self, outcome: Result<(), Error>) {
        self.state.echo_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn push_store(&self, outcome: Result<(), Error>) {
        self.state.store_outcomes.lock().unwrap().push_back(outcome);
    }

    /// Queue `n` identical store failures.
    pub fn fail_stores(&self, err: Error, n: usize) {
        let mut queue = self.state.store_outcomes.lock().unwrap();
        for _ in 0..n {
            queue.push_back(Err(err.clone()));
        }
    }

    pub fn set_find_results(&self, results: Vec<Dataset>) {
        *self.state.find_results.lock().unwrap() = results;
    }

    /// Datasets streamed as C-MOVE sub-operations, in order.
    pub fn set_move_items(&self, items: Vec<Dataset>) {
        *self.state.move_items.lock().unwrap() = items;
    }

    /// Delay applied to every echo, find, and store call.
    pub fn set_op_delay(&self, delay: Duration) {
        *self.state.op_delay.lock().unwrap() = delay;
    }

    /// Delay between consecutive C-MOVE sub-operations.
    pub fn set_move_item_delay(&self, delay: Duration) {
        *self.state.move_item_delay.lock().unwrap() = delay;
    }

    /// Mark every current and future channel as dead.
    pub fn kill(&self) {
        self.state.dead.store(true, Ordering::SeqCst);
    }

    pub fn revive(&self) {
        self.state.dead.store(false, Ordering::SeqCst);
    }

    /// Objects accepted by store calls, in arrival order.
    pub fn stored(&self) -> Vec<Dataset> {
        self.state.stored.lock().unwrap().clone()
    }

    pub fn connect_calls(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn echo_calls(&self) -> u64 {
        self.state.echoes.load(Ordering::SeqCst)
    }

    pub fn find_calls(&self) -> u64 {
        self.state.finds.load(Ordering::SeqCst)
    }

    pub fn move_calls(&self) -> u64 {
        self.state.moves.load(Ordering::SeqCst)
    }

    pub fn store_calls(&self) -> u64 {
        self.state.stores.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) -> u64 {
        self.state.resets.load(Ordering::SeqCst)
    }

    /// Every DIMSE operation that actually reached this peer.
    pub fn wire_calls(&self) -> u64 {
        self.echo_calls() + self.find_calls() + self.move_calls() + self.store_calls()
    }
}

#[async_trait]
impl Connector for ScriptedPeer {
    async fn connect(&self, _target: &Target) -> Result<Box<dyn Channel>, Error> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let failures = &self.state.connect_failures;
        loop {
            let n = failures.load(Ordering::SeqCst);
            if n == 0 {
                break;
            }
            if failures
                .compare_exchange(n, n - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(Error::AssociationRejected("scripted refusal".to_string()));
            }
        }

        if self.state.dead.load(Ordering::SeqCst) {
            return Err(Error::ConnectionReset);
        }

        let seq = self.state.next_channel.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedChannel {
            state: self.state.clone(),
            id: format!("scripted-{seq}"),
            open: true,
        }))
    }
}

struct ScriptedChannel {
    state: Arc<PeerState>,
    id: String,
    open: bool,
}

impl ScriptedChannel {
    async fn op_delay(&self) {
        let delay = *self.state.op_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if !self.open || self.state.dead.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

/// Keep find results whose attributes equal every concrete (non-empty,
/// non-wildcard) key of the query identifier.
fn matches_query(query: &Dataset, candidate: &Dataset) -> bool {
    query.iter().all(|(tag, value)| {
        if value.is_empty() || value == "*" {
            return true;
        }
        candidate.get(tag) == Some(value)
    })
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn echo(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.state.echoes.fetch_add(1, Ordering::SeqCst);
        self.op_delay().await;
        self.state
            .echo_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn find(&mut self, query: &Dataset) -> Result<Vec<Dataset>, Error> {
        self.ensure_open()?;
        self.state.finds.fetch_add(1, Ordering::SeqCst);
        self.op_delay().await;
        let results = self.state.find_results.lock().unwrap();
        Ok(results
            .iter()
            .filter(|ds| matches_query(query, ds))
            .cloned()
            .collect())
    }

    async fn move_study(
        &mut self,
        _destination_ae: &str,
        _query: &Dataset,
        progress: &mut (dyn FnMut(MoveProgress) -> bool + Send),
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.state.moves.fetch_add(1, Ordering::SeqCst);

        let items = self.state.move_items.lock().unwrap().clone();
        let delay = *self.state.move_item_delay.lock().unwrap();
        let total = items.len() as u64;

        for (i, item) in items.into_iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let keep_going = progress(MoveProgress {
                completed: i as u64 + 1,
                total,
                current: item.sop_instance_uid().map(|s| s.to_string()),
            });
            if !keep_going {
                return Err(Error::Aborted("stopped by caller".to_string()));
            }
        }
        Ok(())
    }

    async fn store(
        &mut self,
        object: &Dataset,
        progress: &mut (dyn FnMut(u64, u64) -> bool + Send),
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.state.stores.fetch_add(1, Ordering::SeqCst);
        self.op_delay().await;

        let outcome = self
            .state
            .store_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        outcome?;

        let bytes: u64 = object.iter().map(|(_, v)| v.len() as u64).sum();
        let _ = progress(bytes, bytes);
        self.state.stored.lock().unwrap().push(object.clone());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.open && !self.state.dead.load(Ordering::SeqCst)
    }

    async fn reset(&mut self) -> Result<(), Error> {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()
    }

    fn id(&self) -> &str {
        &self.id
    }
}
