//! Error types for L1 attention dispatch.

use thiserror::Error;

/// Result type alias for L1 attention operations.
pub type Result<T> = std::result::Result<T, L1AttnError>;

/// Errors that can occur while validating, dispatching or running a kernel.
#[derive(Error, Debug)]
pub enum L1AttnError {
    /// A precondition on a named argument was violated.
    ///
    /// Raised at call entry, before any kernel runs.
    #[error("{arg} must be {requirement}")]
    InvalidArgument {
        /// Name of the offending argument (`q`, `k`, `d_attn`, ...).
        arg: &'static str,
        /// What the argument was required to be.
        requirement: String,
    },

    /// A tiled kernel was called with a width it has no specialisation for.
    #[error("no tiled kernel for width {0} (expected 16, 32 or 64)")]
    UnsupportedWidth(usize),

    /// The requested device has no kernels compiled into this build.
    #[error("backend {0:?} is not available in this build")]
    BackendUnavailable(crate::backend::Backend),

    /// GPU initialisation or execution failed.
    #[cfg(feature = "wgpu")]
    #[error("gpu error: {0}")]
    Gpu(#[from] crate::ops::wgpu::GpuError),

    /// No binding with this name is registered.
    #[error("unknown binding: {0}")]
    UnknownBinding(String),

    /// A binding was called with the wrong number of tensors.
    #[error("binding {name} expects {expected} tensors, got {got}")]
    Arity {
        /// Binding name.
        name: &'static str,
        /// Number of tensors the binding takes.
        expected: usize,
        /// Number of tensors supplied.
        got: usize,
    },
}

impl L1AttnError {
    pub(crate) fn invalid(arg: &'static str, requirement: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            requirement: requirement.into(),
        }
    }
}
