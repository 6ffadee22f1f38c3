//! In-process process group: one thread per rank, collectives over shared memory.
//!
//! Each rank deposits its contribution into a shared slot table, waits on a
//! barrier, reduces every deposit in rank order and waits again before the
//! slots can be reused. Every collective carries a per-rank sequence number;
//! if the numbers disagree the ranks have entered collectives out of order and
//! all of them report [`DistributedError::CollectiveDesync`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use candle_core::Tensor;
use tracing::trace;

use super::communicator::{DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::ShardSpec;

#[derive(Clone)]
struct Deposit {
    seq: u64,
    /// `None` for a barrier.
    tensor: Option<Tensor>,
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Deposit>>>,
}

/// Factory for a set of communicators sharing one rendezvous.
pub struct InProcessGroup;

impl InProcessGroup {
    /// Create `world_size` communicators, one per rank, in rank order.
    ///
    /// Each communicator is meant to be moved onto its own thread.
    pub fn new(world_size: usize) -> Result<Vec<InProcessCommunicator>> {
        if world_size == 0 {
            return Err(DistributedError::InvalidWorldSize);
        }
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| {
                Ok(InProcessCommunicator {
                    spec: ShardSpec::new(rank, world_size)?,
                    shared: Arc::clone(&shared),
                    seq: AtomicU64::new(0),
                })
            })
            .collect()
    }
}

/// One rank's handle into an [`InProcessGroup`].
pub struct InProcessCommunicator {
    spec: ShardSpec,
    shared: Arc<Shared>,
    seq: AtomicU64,
}

impl InProcessCommunicator {
    /// Number of collectives this rank has entered so far.
    pub fn collectives_entered(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Deposit, rendezvous, read every rank's deposit, rendezvous again.
    fn exchange(&self, tensor: Option<&Tensor>) -> Result<Vec<Deposit>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| DistributedError::Poisoned)?;
            slots[self.spec.rank()] = Some(Deposit {
                seq,
                tensor: tensor.cloned(),
            });
        }
        self.shared.barrier.wait();

        let deposits: Option<Vec<Deposit>> = {
            let slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| DistributedError::Poisoned)?;
            slots.iter().cloned().collect()
        };
        // Nobody may overwrite a slot until every rank has read all of them.
        self.shared.barrier.wait();

        let deposits = deposits.ok_or(DistributedError::Poisoned)?;
        for (other_rank, d) in deposits.iter().enumerate() {
            if d.seq != seq || d.tensor.is_some() != tensor.is_some() {
                return Err(DistributedError::CollectiveDesync {
                    rank: self.spec.rank(),
                    local_seq: seq,
                    other_rank,
                    other_seq: d.seq,
                });
            }
        }
        trace!(rank = self.spec.rank(), seq, "collective complete");
        Ok(deposits)
    }
}

impl DeviceCommunicator for InProcessCommunicator {
    fn shard_spec(&self) -> ShardSpec {
        self.spec
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let deposits = self.exchange(Some(tensor))?;

        let expected = tensor.dims().to_vec();
        let mut acc: Option<Tensor> = None;
        // Rank order keeps the floating-point result identical on every rank.
        for d in deposits {
            let Some(t) = d.tensor else {
                continue;
            };
            if t.dims() != expected.as_slice() {
                return Err(DistributedError::ShapeMismatch {
                    expected,
                    actual: t.dims().to_vec(),
                });
            }
            let t = t.to_device(tensor.device())?.to_dtype(tensor.dtype())?;
            acc = Some(match acc {
                None => t,
                Some(a) => match op {
                    ReduceOp::Sum => a.add(&t)?,
                },
            });
        }
        acc.ok_or(DistributedError::Poisoned)
    }

    fn barrier(&self) -> Result<()> {
        self.exchange(None).map(|_| ())
    }
}
