//! Backend selection module.
//!
//! This module defines the devices a tensor can be resident on and the
//! process-wide default device.
//!
//! # Supported Backends
//!
//! - `Cpu`: Pure Rust kernels parallelised with `rayon` (default).
//! - `Wgpu`: GPU compute shaders through `wgpu` (requires the `wgpu` feature).
//!
//! The default is stored globally using an `AtomicU8`. New tensors are tagged
//! with it, and the free functions in [`crate::ops::dispatch`] pick their
//! kernel set from it.

use core::convert::TryFrom;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of devices a tensor can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Backend {
    /// Host memory, CPU kernels (default).
    #[default]
    Cpu = 0,
    /// GPU-accelerated kernels using `wgpu`.
    Wgpu,
}

impl Backend {
    /// Whether kernels for this backend are compiled into this build.
    #[must_use]
    pub const fn is_available(self) -> bool {
        match self {
            Self::Cpu => true,
            Self::Wgpu => cfg!(feature = "wgpu"),
        }
    }

    /// Short lowercase name, used in error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Wgpu => "wgpu",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

/// Global default backend.
///
/// Only expected to change rarely, never inside a running kernel.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the default backend for new tensors and free dispatch calls.
///
/// # Example
///
/// ```
/// use l1attn::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    log::debug!("default backend set to {b}");
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the current default backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip_and_unknown_tag() {
        assert_eq!(Backend::try_from(Backend::Wgpu as u8), Ok(Backend::Wgpu));
        assert_eq!(Backend::try_from(7), Err(()));
    }

    #[test]
    fn cpu_is_always_available() {
        assert!(Backend::Cpu.is_available());
        assert_eq!(Backend::Wgpu.is_available(), cfg!(feature = "wgpu"));
        assert_eq!(Backend::Wgpu.to_string(), "wgpu");
    }
}
