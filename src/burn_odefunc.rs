//! Burn-backed (opt-in) drift and divergence utilities.
//!
//! This module is intentionally **additive**: it provides a concrete `burn`
//! backend path for the CNF step without changing the default `ndarray`-only
//! API surface of `cnflow`.
//!
//! Current scope:
//! - A tiny time-conditioned vector field (`BurnDriftMlp`).
//! - A Hutchinson divergence computed by the autodiff backend itself: one
//!   reverse pass of `(f ⊙ e).sum()` with respect to `y` yields `eᵀ ∂f/∂y`.
//!
//! The gradient lookup after a reverse pass can come back empty when the node
//! failed to attach to the graph. That is guarded the same way the taped
//! runtime contract demands: recompute up to a fixed bound, then panic with
//! the operand shapes and gradient-tracking flags.

use burn_core as burn;

use burn::module::Module;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_nn::{Linear, LinearConfig, Relu};

/// Default burn backend for this crate's examples: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

/// Bounded retry for a reverse pass whose gradient failed to attach.
const GRAD_ATTACH_RETRIES: usize = 10;

/// A tiny time-conditioned MLP drift `f(t, y)`.
///
/// Input features are concatenated as `[y, t]` (input dim `d + 1`); output is
/// a vector field in `R^d`.
#[derive(Module, Debug)]
pub struct BurnDriftMlp<B: Backend> {
    l1: Linear<B>,
    l2: Linear<B>,
}

impl<B: Backend> BurnDriftMlp<B> {
    /// Initialize a small 2-layer MLP for dimension `d`.
    pub fn new(device: &B::Device, d: usize, hidden: usize) -> Self {
        let l1 = LinearConfig::new(d + 1, hidden).init(device);
        let l2 = LinearConfig::new(hidden, d).init(device);
        Self { l1, l2 }
    }

    /// Forward pass for a batch.
    ///
    /// Shapes: `t` is `[batch, 1]`, `y` is `[batch, d]`; returns `[batch, d]`.
    pub fn forward(&self, t: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
        let feats = Tensor::cat(vec![y, t], 1);
        let h = Relu.forward(self.l1.forward(feats));
        self.l2.forward(h)
    }
}

/// Drift plus Hutchinson divergence in one autodiff evaluation.
///
/// Returns `(dy, e ⊙ (eᵀ ∂f/∂y) summed)` on the inner backend: the drift
/// `[batch, d]` and the divergence estimate `[batch, 1]`. The probe `e` must
/// be the integration's fixed probe; `t` is detached and re-marked as an
/// independent differentiation variable, mirroring how the state function
/// treats the solver clock.
pub fn drift_with_divergence_approx<B: AutodiffBackend>(
    model: &BurnDriftMlp<B>,
    t: Tensor<B, 2>,
    y: Tensor<B, 2>,
    e: Tensor<B, 2>,
) -> (
    Tensor<B::InnerBackend, 2>,
    Tensor<B::InnerBackend, 2>,
) {
    let t = t.detach().require_grad();
    let y = y.detach().require_grad();

    let mut attempt = 0;
    loop {
        let f = model.forward(t.clone(), y.clone());
        let quad = (f.clone() * e.clone()).sum();
        let grads = quad.backward();
        match y.grad(&grads) {
            Some(e_dzdx) => {
                let div = (e_dzdx * e.clone().inner()).sum_dim(1);
                return (f.inner(), div);
            }
            None if attempt < GRAD_ATTACH_RETRIES => attempt += 1,
            None => panic!(
                "failed to attach gradient after {GRAD_ATTACH_RETRIES} retries: \
                 f={:?} y={:?} (rgrad={}) e={:?}",
                f.dims(),
                y.dims(),
                y.is_require_grad(),
                e.dims(),
            ),
        }
    }
}
