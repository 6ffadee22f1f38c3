//! Facade over the workspace crates.

pub use dbrx_tp_core::*;
