//! Model implementations.

pub mod dbrx;

pub use dbrx::{DbrxAttention, DbrxBlock, DbrxFfn, DbrxModel};
