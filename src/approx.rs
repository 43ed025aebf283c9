//! Utilities to approximate equality of floating point values.
//!
//! Kernels that reduce in different orders (tiled vs general, CPU vs GPU)
//! agree only up to rounding, so comparisons go through these tiers.

/// The max epsilon accepted on `f32`s.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// The expected minimum epsilon accepted on `f32`s.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// The best expected epsilon accepted on `f32`s.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// The approximated equality enumerated, best first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,

    /// Good epsilon.
    Partial = 1,

    /// Acceptable epsilon.
    Relative = 2,

    /// No relative equality.
    Scarce = 3,
}

/// Checks the distance between two values, relative to the magnitude of
/// the right-hand side once it exceeds one.
pub trait RelativeEq<Rhs: ?Sized> {
    /// Grades the equality of `self` and `rhs`.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq<Self> for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self == rhs {
            return ApproxEquality::Precise;
        }
        let dif = (self - rhs).abs() / rhs.abs().max(1.0);

        if dif < F32_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < F32_AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < F32_MAX_ERROR {
            ApproxEquality::Relative
        } else {
            // NaN lands here too
            ApproxEquality::Scarce
        }
    }
}

/// The worst grade over all pairs; slices of different length are `Scarce`.
impl RelativeEq<[f32]> for [f32] {
    fn approx_eq(&self, rhs: &[f32]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (a, b) in self.iter().zip(rhs) {
            eq = eq.max(a.approx_eq(b));
            if eq == ApproxEquality::Scarce {
                break; // can't improve from here; not equal
            }
        }
        eq
    }
}

/// Approximates equality: true unless some pair is `Scarce`.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) != ApproxEquality::Scarce
}

/// Largest absolute elementwise difference.
///
/// # Panics
/// Panics if lengths differ.
#[must_use]
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "length mismatch");
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Asserts `a` and `b` are approximately equal.
///
/// # Panics
/// Panics with the largest difference if they are not.
#[track_caller]
pub fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    assert!(
        approx_eq(a, b),
        "values differ: max abs diff {} over {} elements",
        max_abs_diff(a, b),
        a.len()
    );
}
