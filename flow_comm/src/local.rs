use crate::{Comm, Error, Result};
use observability_deps::tracing::debug;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Shared state of an in-process worker group.
///
/// Collectives are generation-counted: every member deposits under the
/// mutex, the last arriver publishes the combined result and bumps the
/// epoch, and waiters collect after the epoch moves. Because a member can
/// only reach collective `n+1` after leaving collective `n`, the published
/// result of epoch `n` is stable until every member has read it.
#[derive(Debug)]
pub struct LocalGroup {
    size: usize,
    state: Mutex<GroupState>,
    cond: Condvar,
}

#[derive(Debug)]
struct GroupState {
    epoch: u64,
    arrived: usize,
    gather_slots: Vec<Option<Vec<u64>>>,
    bcast_slot: Option<Vec<u8>>,
    published_gather: Vec<Vec<u64>>,
    published_bcast: Vec<u8>,
    aborted: bool,
}

impl LocalGroup {
    /// Create a group of `size` workers.
    pub fn new(size: usize) -> Arc<Self> {
        assert!(size > 0, "worker group must have at least one member");
        Arc::new(Self {
            size,
            state: Mutex::new(GroupState {
                epoch: 0,
                arrived: 0,
                gather_slots: vec![None; size],
                bcast_slot: None,
                published_gather: Vec::new(),
                published_bcast: Vec::new(),
                aborted: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// The communicator handle for `rank`.
    pub fn comm(self: &Arc<Self>, rank: usize) -> LocalComm {
        assert!(rank < self.size, "rank {} out of range", rank);
        LocalComm {
            group: Arc::clone(self),
            rank,
        }
    }

    /// One rendezvous: deposit, last-arriver publish, everyone collect.
    fn rendezvous<T>(
        &self,
        deposit: impl FnOnce(&mut GroupState),
        publish: impl FnOnce(&mut GroupState),
        collect: impl Fn(&GroupState) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(Error::Aborted);
        }
        deposit(&mut state);
        state.arrived += 1;
        if state.arrived == self.size {
            publish(&mut state);
            state.arrived = 0;
            state.epoch = state.epoch.wrapping_add(1);
            self.cond.notify_all();
            return Ok(collect(&state));
        }
        let entered_at = state.epoch;
        while state.epoch == entered_at && !state.aborted {
            self.cond.wait(&mut state);
        }
        if state.epoch == entered_at {
            // woken by abort, not by completion
            return Err(Error::Aborted);
        }
        Ok(collect(&state))
    }

    fn abort(&self) {
        let mut state = self.state.lock();
        if !state.aborted {
            debug!("worker group aborted");
            state.aborted = true;
            self.cond.notify_all();
        }
    }
}

/// One worker's handle onto a [`LocalGroup`].
#[derive(Debug)]
pub struct LocalComm {
    group: Arc<LocalGroup>,
    rank: usize,
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn barrier(&self) -> Result<()> {
        self.group.rendezvous(|_| {}, |_| {}, |_| {})
    }

    fn all_gather(&self, words: &[u64]) -> Result<Vec<Vec<u64>>> {
        let rank = self.rank;
        let deposit = words.to_vec();
        self.group.rendezvous(
            move |state| state.gather_slots[rank] = Some(deposit),
            |state| {
                state.published_gather = state
                    .gather_slots
                    .iter_mut()
                    .map(|slot| slot.take().unwrap_or_default())
                    .collect()
            },
            |state| state.published_gather.clone(),
        )
    }

    fn broadcast(&self, root: usize, payload: Vec<u8>) -> Result<Vec<u8>> {
        let is_root = self.rank == root;
        self.group.rendezvous(
            move |state| {
                if is_root {
                    state.bcast_slot = Some(payload)
                }
            },
            |state| state.published_bcast = state.bcast_slot.take().unwrap_or_default(),
            |state| state.published_bcast.clone(),
        )
    }

    fn abort(&self) {
        self.group.abort()
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        // A worker unwinding mid-collective would otherwise leave its peers
        // blocked forever.
        if std::thread::panicking() {
            self.group.abort();
        }
    }
}
