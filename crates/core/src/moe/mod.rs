//! Mixture-of-experts for DBRX.
//!
//! - [`router`]: softmax/top-k routing into an [`ExpertAssignment`]
//! - [`expert_weights`]: expert sharding policies and the load → compute repack
//! - [`experts`]: the sharded expert block dispatching to the fused kernel

mod error;
pub mod expert_weights;
pub mod experts;
pub mod router;

pub use error::MoeError;
pub use expert_weights::{
    repack, ExpertPartition, ExpertShardPolicy, ExpertWeightSet, LoadExpertWeights, REMOTE_EXPERT,
};
pub use experts::DbrxExperts;
pub use router::{DbrxRouter, ExpertAssignment};
