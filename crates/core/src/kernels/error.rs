use thiserror::Error;

/// A kernel invocation failed. Fatal to the forward pass.
#[derive(Error, Debug)]
#[error("{kernel} kernel failed: {source}")]
pub struct KernelError {
    pub kernel: &'static str,
    #[source]
    pub source: candle_core::Error,
}

impl KernelError {
    pub fn new(kernel: &'static str, source: candle_core::Error) -> Self {
        Self { kernel, source }
    }

    /// A precondition the kernel checks itself, e.g. an unmapped slot.
    pub fn invalid(kernel: &'static str, msg: impl Into<String>) -> Self {
        Self::new(kernel, candle_core::Error::Msg(msg.into()))
    }
}

/// Attach the kernel name to a tensor-op failure.
pub(crate) trait KernelResultExt<T> {
    fn in_kernel(self, kernel: &'static str) -> Result<T, KernelError>;
}

impl<T> KernelResultExt<T> for candle_core::Result<T> {
    fn in_kernel(self, kernel: &'static str) -> Result<T, KernelError> {
        self.map_err(|source| KernelError::new(kernel, source))
    }
}
