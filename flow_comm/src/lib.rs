//! Collective communication between the peer workers of a workflow run.
//!
//! Workers execute the identical control flow SPMD-style and meet at
//! collective points: barriers, all-gathers (append coordination,
//! termination checks) and broadcasts (scratch-file naming). The [`Comm`]
//! trait captures exactly that surface so the engine never talks to a
//! concrete transport; [`SoloComm`] degenerates every collective to the
//! identity for single-worker runs, and [`LocalComm`] implements an
//! in-process worker group.
//!
//! Every collective MUST be entered by every member of the group with
//! compatible arguments, in the same order. A worker that fails mid-run
//! aborts the group, which poisons all pending and future collectives of
//! its peers; one worker's error is fatal to the whole run.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod local;
mod solo;

pub use local::{LocalComm, LocalGroup};
pub use solo::SoloComm;

use snafu::Snafu;
use std::sync::Arc;

/// Errors raised by collective calls.
#[derive(Debug, Clone, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("worker group aborted (a peer failed)"))]
    Aborted,
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The collective-communication capability a worker holds for the duration
/// of a run.
pub trait Comm: Send + Sync + std::fmt::Debug {
    /// This worker's rank, `0 <= rank < size`.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn size(&self) -> usize;

    /// Block until every worker has arrived.
    fn barrier(&self) -> Result<()>;

    /// Deposit a word vector and receive every worker's deposit, indexed by
    /// rank. All workers must deposit vectors of the same length.
    fn all_gather(&self, words: &[u64]) -> Result<Vec<Vec<u64>>>;

    /// Deliver `payload` from worker `root` to every worker. Non-root
    /// payloads are ignored.
    fn broadcast(&self, root: usize, payload: Vec<u8>) -> Result<Vec<u8>>;

    /// Mark the group as failed, waking peers blocked in collectives.
    fn abort(&self);

    /// Gather a single word from every worker.
    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>> {
        Ok(self
            .all_gather(&[value])?
            .into_iter()
            .map(|words| words[0])
            .collect())
    }
}

/// Spawn `size` workers running the identical function and collect their
/// results in rank order. A worker returning `Err` (or panicking) aborts
/// the group so no peer is left blocked in a collective.
pub fn run_workers<T, E, F>(size: usize, f: F) -> Vec<std::result::Result<T, E>>
where
    F: Fn(Arc<dyn Comm>) -> std::result::Result<T, E> + Send + Sync,
    T: Send,
    E: Send,
{
    let group = LocalGroup::new(size);
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let comm = group.comm(rank);
                let f = &f;
                scope.spawn(move || {
                    let comm: Arc<dyn Comm> = Arc::new(comm);
                    let result = f(Arc::clone(&comm));
                    if result.is_err() {
                        comm.abort();
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker thread panicked"))
            .collect()
    })
}
