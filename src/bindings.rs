//! Named entry points for host environments.
//!
//! The forward and backward dispatchers are registered under a single module
//! name, [`MODULE_NAME`], and can be looked up and called by name with a list
//! of tensors. This is the surface a scripting host or FFI layer binds to.
//!
//! # Example
//! ```rust
//! use l1attn::bindings::module;
//! use l1attn::tensors::Tensor;
//!
//! let m = module();
//! let q = Tensor::new(vec![1, 2, 1, 2], vec![0.0f32, 1.0, 1.0, 0.0]);
//! let out = m.call("forward", &[q.clone(), q]).unwrap();
//! assert_eq!(out[0].shape(), &[1, 2, 2, 1]);
//! ```

use crate::error::{L1AttnError, Result};
use crate::ops::dispatch;
use crate::tensors::Ten32;

/// Name the bindings are registered under.
pub const MODULE_NAME: &str = "l1attn_drv";

type BindingFn = fn(&[Ten32]) -> Result<Vec<Ten32>>;

/// One callable entry point.
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    /// Name the entry point is called by.
    pub name: &'static str,
    /// One-line description.
    pub doc: &'static str,
    /// Number of tensors the entry point takes.
    pub arity: usize,
    call: BindingFn,
}

impl Binding {
    /// Calls the entry point after checking the argument count.
    ///
    /// # Errors
    /// [`L1AttnError::Arity`] on a wrong argument count; otherwise whatever
    /// the dispatcher reports.
    pub fn call(&self, args: &[Ten32]) -> Result<Vec<Ten32>> {
        if args.len() != self.arity {
            return Err(L1AttnError::Arity {
                name: self.name,
                expected: self.arity,
                got: args.len(),
            });
        }
        (self.call)(args)
    }
}

/// A named set of bindings.
#[derive(Debug, Clone)]
pub struct Module {
    name: &'static str,
    bindings: Vec<Binding>,
}

impl Module {
    /// The module name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// All registered bindings, in registration order.
    #[must_use]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Looks a binding up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    /// Calls a binding by name.
    ///
    /// # Errors
    /// [`L1AttnError::UnknownBinding`] if nothing is registered under `name`;
    /// otherwise as [`Binding::call`].
    pub fn call(&self, name: &str, args: &[Ten32]) -> Result<Vec<Ten32>> {
        self.get(name)
            .ok_or_else(|| L1AttnError::UnknownBinding(name.to_string()))?
            .call(args)
    }
}

fn forward(args: &[Ten32]) -> Result<Vec<Ten32>> {
    let attn = dispatch::forward(&args[0], &args[1])?;
    Ok(vec![attn])
}

fn backward(args: &[Ten32]) -> Result<Vec<Ten32>> {
    let (dq, dk) = dispatch::backward(&args[0], &args[1], &args[2])?;
    Ok(vec![dq, dk])
}

/// The `l1attn_drv` module with its `forward` and `backward` bindings.
#[must_use]
pub fn module() -> Module {
    Module {
        name: MODULE_NAME,
        bindings: vec![
            Binding {
                name: "forward",
                doc: "L1Attn forward: (q, k) -> [attn]",
                arity: 2,
                call: forward,
            },
            Binding {
                name: "backward",
                doc: "L1Attn backward: (d_attn, q, k) -> [dq, dk]",
                arity: 3,
                call: backward,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_forward_and_backward() {
        let m = module();
        assert_eq!(m.name(), "l1attn_drv");
        let names: Vec<_> = m.bindings().iter().map(|b| b.name).collect();
        assert_eq!(names, ["forward", "backward"]);
    }

    #[test]
    fn rejects_unknown_names_and_wrong_arity() {
        let m = module();
        let t = Ten32::zeros(vec![1, 1, 1, 1]);
        assert!(matches!(
            m.call("sideways", &[]),
            Err(L1AttnError::UnknownBinding(name)) if name == "sideways"
        ));
        assert!(matches!(
            m.call("backward", &[t.clone(), t]),
            Err(L1AttnError::Arity { expected: 3, got: 2, .. })
        ));
    }

    #[test]
    fn backward_returns_two_gradients() {
        let m = module();
        let q = Ten32::new(vec![1, 3, 2, 2], (0..12).map(|i| i as f32).collect());
        let d_attn = Ten32::new(vec![1, 3, 3, 2], vec![1.0; 18]);
        let out = m.call("backward", &[d_attn, q.clone(), q.clone()]).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|g| g.shape() == q.shape()));
    }
}
