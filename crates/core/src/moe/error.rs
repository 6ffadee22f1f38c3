use thiserror::Error;

/// Expert weight state and partition errors.
#[derive(Error, Debug)]
pub enum MoeError {
    #[error("expert weights are not repacked; call repack before forward")]
    NotRepacked,

    #[error("expert weights are already repacked")]
    AlreadyRepacked,

    #[error("expert weights are unusable after a failed repack")]
    Poisoned,

    #[error("{what}: expected {expected:?}, found {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{num_experts} experts cannot be split across world_size {world_size}")]
    IndivisibleExperts { num_experts: usize, world_size: usize },

    #[error("tensor error during repack: {0}")]
    Tensor(#[from] candle_core::Error),
}
