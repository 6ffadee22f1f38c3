pub mod rotary;

pub use rotary::RotaryEmbedding;
