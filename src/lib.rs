//! # cnflow
//!
//! Core pieces of a continuous normalizing flow (CNF): drift networks, their
//! divergence estimators, and the joint ODE state function an external solver
//! integrates.
//!
//! A CNF transforms a base density by flowing samples through
//! \[
//! \frac{dy}{dt} = f_\theta(t, y),
//! \qquad
//! \frac{d \log p(y(t))}{dt} = -\operatorname{tr}\frac{\partial f_\theta}{\partial y},
//! \]
//! so every solver step needs both the drift and (an estimate of) its
//! divergence. This crate is intentionally small:
//!
//! - it implements **drift evaluation** and **divergence estimation**, not
//!   training loops or checkpointing,
//! - the concrete ODE integrator is an external collaborator; `ode` ships a
//!   fixed-step stand-in used by the tests and sampling examples,
//! - no GPU framework types leak through the default API surface
//!   (`ndarray` only). An optional `burn` backend is **feature-gated**.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every stochastic entry point takes a
//!   `seed` or an RNG; the Hutchinson probe is fixed for the lifetime of one
//!   integration.
//! - **Constant channels integrate to constants**: conditioning context and
//!   hypernetwork weights always get an exact-zero derivative.
//! - **Configuration errors fail at construction**: unknown layer or
//!   nonlinearity keys, bad dimension lists, and weight-vector length
//!   mismatches never survive to the solver loop.
//!
//! ## Module map
//!
//! - `nonlin`: closed set of activation functions with derivatives
//! - `layers`: context-conditioned affine layers (the seven injection variants)
//! - `drift`: `CondDriftNet`, the plain drift network
//! - `hypernet`: flat-weight-vector drift networks + the weight layout descriptor
//! - `divergence`: Hutchinson and brute-force trace estimators
//! - `odefunc`: the state functions handed to the solver
//! - `ode`: fixed-step joint-state integrators (`Euler`, `Heun`)
//! - `dataset`: image/segmentation-mask pair loading
//! - `burn_odefunc` (feature `burn`): autodiff-backed drift + divergence

pub mod dataset;
pub mod divergence;
pub mod drift;
pub mod hypernet;
pub mod layers;
pub mod nonlin;
pub mod ode;
pub mod odefunc;

#[cfg(feature = "burn")]
pub mod burn_odefunc;

/// cnflow error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("weight vector length mismatch: expected {expected}, got {got}")]
    WeightLen { expected: usize, got: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;
