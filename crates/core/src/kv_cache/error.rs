use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid cache geometry: {field} {reason}")]
    InvalidGeometry {
        field: &'static str,
        reason: &'static str,
    },

    #[error("layer {layer} out of range: cache has {num_layers} layers")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
