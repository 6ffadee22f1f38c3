use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::Tensor;

use crate::distributed::{DeviceCommunicator, DistributedError, ReduceOp, ShardSpec};

/// Wraps a communicator and counts the collectives it enters.
pub struct CountingCommunicator<C> {
    inner: C,
    all_reduces: Arc<AtomicUsize>,
    barriers: Arc<AtomicUsize>,
}

impl<C: DeviceCommunicator> CountingCommunicator<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            all_reduces: Arc::new(AtomicUsize::new(0)),
            barriers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn all_reduces(&self) -> usize {
        self.all_reduces.load(Ordering::SeqCst)
    }

    pub fn barriers(&self) -> usize {
        self.barriers.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.all_reduces.store(0, Ordering::SeqCst);
        self.barriers.store(0, Ordering::SeqCst);
    }
}

impl<C: DeviceCommunicator> DeviceCommunicator for CountingCommunicator<C> {
    fn shard_spec(&self) -> ShardSpec {
        self.inner.shard_spec()
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor, DistributedError> {
        self.all_reduces.fetch_add(1, Ordering::SeqCst);
        self.inner.all_reduce(tensor, op)
    }

    fn barrier(&self) -> Result<(), DistributedError> {
        self.barriers.fetch_add(1, Ordering::SeqCst);
        self.inner.barrier()
    }
}
