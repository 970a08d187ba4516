//! Divergence estimators for drift evaluations.
//!
//! The change-of-variables formula needs `tr(∂f/∂y)` at every solver step.
//! Both estimators consume the *pullback* of a recorded drift evaluation (a
//! closure mapping an output cotangent to a state cotangent), so they work
//! unchanged over plain `(batch, dim)` states and per-point
//! `(batch, points, dim)` states:
//!
//! - [`divergence_approx`]: the Hutchinson estimator
//!   \( \mathbb{E}_e[e^\top J e] = \operatorname{tr} J \) for a probe `e`
//!   with zero mean and identity covariance. One pullback call per step.
//!   Unbiased over a trajectory only if the probe is held fixed across the
//!   trajectory's evaluations; the enclosing state function owns that probe.
//! - [`divergence_bf`]: the exact Jacobian diagonal, one pullback call per
//!   state dimension. Ground truth for tests and for low-dimensional flows.

use ndarray::{Array, Axis, Dimension, RemoveAxis};

use crate::Result;

/// Which divergence estimator an ODE state function runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceKind {
    /// Stochastic Hutchinson trace estimate.
    Approx,
    /// Exact brute-force trace; cost scales with the state dimensionality.
    BruteForce,
}

impl DivergenceKind {
    /// Run the selected estimator. `probe` is the fixed Hutchinson probe; the
    /// brute-force path uses it only as a shape template.
    pub fn estimate<D>(
        self,
        pullback: impl Fn(&Array<f32, D>) -> Result<Array<f32, D>>,
        probe: &Array<f32, D>,
    ) -> Result<Array<f32, D::Smaller>>
    where
        D: Dimension + RemoveAxis,
    {
        match self {
            Self::Approx => divergence_approx(pullback, probe),
            Self::BruteForce => divergence_bf(pullback, probe),
        }
    }
}

/// Hutchinson stochastic trace estimate: `sum(e ⊙ (eᵀ ∂f/∂y))` over the last
/// axis. One reverse-mode pullback call, independent of dimensionality.
pub fn divergence_approx<D>(
    pullback: impl Fn(&Array<f32, D>) -> Result<Array<f32, D>>,
    probe: &Array<f32, D>,
) -> Result<Array<f32, D::Smaller>>
where
    D: Dimension + RemoveAxis,
{
    let e_dzdx = pullback(probe)?;
    Ok((&e_dzdx * probe).sum_axis(Axis(probe.ndim() - 1)))
}

/// Exact trace of the state Jacobian, assembled one diagonal entry at a time:
/// the pullback of the `i`-th output basis vector is the `i`-th Jacobian row,
/// of which the `i`-th component is kept.
pub fn divergence_bf<D>(
    pullback: impl Fn(&Array<f32, D>) -> Result<Array<f32, D>>,
    like: &Array<f32, D>,
) -> Result<Array<f32, D::Smaller>>
where
    D: Dimension + RemoveAxis,
{
    let axis = Axis(like.ndim() - 1);
    let d = like.len_of(axis);
    let mut acc = Array::<f32, D::Smaller>::zeros(like.raw_dim().remove_axis(axis));
    for i in 0..d {
        let mut cot = Array::<f32, D>::zeros(like.raw_dim());
        cot.index_axis_mut(axis, i).fill(1.0);
        let g = pullback(&cot)?;
        acc += &g.index_axis(axis, i);
    }
    Ok(acc)
}
