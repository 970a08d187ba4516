//! Activation functions for drift networks.
//!
//! The set is closed: a network is constructed with one [`Nonlinearity`] value
//! and applies it after every layer except the last. Divergence estimation
//! replays cotangents through the same stack, so each activation also exposes
//! its pointwise derivative.

use ndarray::{Array, Dimension};

use crate::{Error, Result};

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Pointwise nonlinearity applied between drift-network layers.
///
/// `Swish` carries its own gain `beta`; the value a network is constructed
/// with is shared across that network's layers and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Nonlinearity {
    Tanh,
    Relu,
    Softplus,
    Elu,
    Swish { beta: f32 },
    Square,
    Identity,
}

impl Nonlinearity {
    /// Resolve a configuration key. Unknown keys are a construction-time error.
    pub fn parse(key: &str) -> Result<Self> {
        match key {
            "tanh" => Ok(Self::Tanh),
            "relu" => Ok(Self::Relu),
            "softplus" => Ok(Self::Softplus),
            "elu" => Ok(Self::Elu),
            "swish" => Ok(Self::Swish { beta: 1.0 }),
            "square" => Ok(Self::Square),
            "identity" => Ok(Self::Identity),
            other => Err(Error::Config(format!("unknown nonlinearity {other:?}"))),
        }
    }

    /// All supported configuration keys.
    pub const KEYS: [&'static str; 7] = [
        "tanh",
        "relu",
        "softplus",
        "elu",
        "swish",
        "square",
        "identity",
    ];

    #[inline]
    pub fn eval(&self, x: f32) -> f32 {
        match *self {
            Self::Tanh => x.tanh(),
            Self::Relu => x.max(0.0),
            // Overflow-safe softplus: ln(1 + e^x) = max(x, 0) + ln(1 + e^{-|x|}).
            Self::Softplus => x.max(0.0) + (-x.abs()).exp().ln_1p(),
            Self::Elu => {
                if x > 0.0 {
                    x
                } else {
                    x.exp() - 1.0
                }
            }
            Self::Swish { beta } => x * sigmoid(beta * x),
            Self::Square => x * x,
            Self::Identity => x,
        }
    }

    /// Pointwise derivative at `x`.
    #[inline]
    pub fn derivative(&self, x: f32) -> f32 {
        match *self {
            Self::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            Self::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Softplus => sigmoid(x),
            Self::Elu => {
                if x > 0.0 {
                    1.0
                } else {
                    x.exp()
                }
            }
            Self::Swish { beta } => {
                let s = sigmoid(beta * x);
                s + beta * x * s * (1.0 - s)
            }
            Self::Square => 2.0 * x,
            Self::Identity => 1.0,
        }
    }

    /// Elementwise application over an array of any rank.
    pub fn apply<D: Dimension>(&self, x: &Array<f32, D>) -> Array<f32, D> {
        x.mapv(|v| self.eval(v))
    }

    /// Elementwise derivative over an array of any rank.
    pub fn apply_derivative<D: Dimension>(&self, x: &Array<f32, D>) -> Array<f32, D> {
        x.mapv(|v| self.derivative(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_round_trips_all_keys() {
        for key in Nonlinearity::KEYS {
            let nl = Nonlinearity::parse(key).unwrap();
            // Every parsed variant must be evaluable.
            assert!(nl.eval(0.3).is_finite());
        }
        assert!(Nonlinearity::parse("sigmoidal").is_err());
    }

    #[test]
    fn softplus_is_stable_at_extremes() {
        let sp = Nonlinearity::Softplus;
        assert!(sp.eval(100.0).is_finite());
        assert!((sp.eval(100.0) - 100.0).abs() < 1e-4);
        assert!(sp.eval(-100.0).abs() < 1e-4);
    }

    proptest! {
        // The analytic derivative must match a central finite difference.
        #[test]
        fn prop_derivative_matches_finite_difference(
            x in -3.0f32..3.0f32,
            which in 0usize..7,
        ) {
            let nl = Nonlinearity::parse(Nonlinearity::KEYS[which]).unwrap();
            // Relu's kink makes the comparison meaningless near 0.
            prop_assume!(!(matches!(nl, Nonlinearity::Relu | Nonlinearity::Elu) && x.abs() < 1e-2));
            let h = 1e-3f32;
            let fd = (nl.eval(x + h) - nl.eval(x - h)) / (2.0 * h);
            let an = nl.derivative(x);
            prop_assert!(
                (fd - an).abs() <= 1e-2 + 1e-2 * an.abs(),
                "fd={fd} analytic={an} at x={x}"
            );
        }
    }
}
