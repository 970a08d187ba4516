//! The ODE state functions handed to the solver.
//!
//! A CNF integration advances several channels jointly: the position, the
//! log-density accumulator, and any auxiliary channels (conditioning context,
//! hypernetwork weights) that must stay constant over the trajectory. The
//! solver owns the state tuple; these functions only read it and return the
//! joint derivative:
//!
//! - position: the drift `dy`,
//! - log-density: `-divergence(dy, y)`,
//! - every auxiliary channel: an exact-zero tensor of matching shape.
//!
//! Call protocol: `before_odeint` arms one integration (resets the evaluation
//! counter, fixes or clears the Hutchinson probe), then the solver calls
//! `forward(t, states)` as many times as it likes. The probe is sampled
//! lazily on the first call if it was not fixed, and is then held for the
//! rest of the trajectory; re-sampling mid-integration would break the
//! trace estimate's unbiasedness over the trajectory.

use ndarray::{concatenate, Array2, Array3, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::divergence::DivergenceKind;
use crate::drift::CondDriftNet;
use crate::hypernet::{HyperDriftNet, HyperDriftNet2d};
use crate::{Error, Result};

/// One channel of the joint ODE state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChannel {
    /// `(batch, k)`: flat positions, log-density columns, context, weights.
    Mat(Array2<f32>),
    /// `(batch, points, k)`: per-point positions and log-densities.
    Cube(Array3<f32>),
}

impl StateChannel {
    pub fn batch(&self) -> usize {
        match self {
            Self::Mat(a) => a.nrows(),
            Self::Cube(a) => a.dim().0,
        }
    }

    /// Exact-zero channel of the same shape; what constant channels get as
    /// their derivative.
    pub fn zeros_like(&self) -> Self {
        match self {
            Self::Mat(a) => Self::Mat(Array2::zeros(a.raw_dim())),
            Self::Cube(a) => Self::Cube(Array3::zeros(a.raw_dim())),
        }
    }

    /// `self += a * rhs`, the axpy the fixed-step driver needs.
    pub fn scaled_add(&mut self, a: f32, rhs: &Self) -> Result<()> {
        match (self, rhs) {
            (Self::Mat(x), Self::Mat(v)) if x.dim() == v.dim() => {
                x.scaled_add(a, v);
                Ok(())
            }
            (Self::Cube(x), Self::Cube(v)) if x.dim() == v.dim() => {
                x.scaled_add(a, v);
                Ok(())
            }
            _ => Err(Error::Shape("state and derivative channels disagree")),
        }
    }

    fn as_mat(&self) -> Result<&Array2<f32>> {
        match self {
            Self::Mat(a) => Ok(a),
            Self::Cube(_) => Err(Error::Shape("expected a (batch, k) channel")),
        }
    }

    fn as_cube(&self) -> Result<&Array3<f32>> {
        match self {
            Self::Cube(a) => Ok(a),
            Self::Mat(_) => Err(Error::Shape("expected a (batch, points, k) channel")),
        }
    }
}

fn time_column(batch: usize, t: f32) -> Array2<f32> {
    Array2::from_elem((batch, 1), t)
}

/// The plain CNF state function: wraps a [`CondDriftNet`] and a divergence
/// estimator. Accepts 2-channel `[y, logp]` or 3-channel `[y, logp, context]`
/// state tuples.
#[derive(Debug, Clone)]
pub struct OdeFunc {
    drift: CondDriftNet,
    divergence: DivergenceKind,
    probe: Option<Array2<f32>>,
    num_evals: u64,
    rng: ChaCha8Rng,
}

impl OdeFunc {
    pub fn new(drift: CondDriftNet, divergence: DivergenceKind, seed: u64) -> Self {
        Self {
            drift,
            divergence,
            probe: None,
            num_evals: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn drift(&self) -> &CondDriftNet {
        &self.drift
    }

    pub fn divergence(&self) -> DivergenceKind {
        self.divergence
    }

    /// Solver calls since the last [`Self::before_odeint`].
    pub fn num_evals(&self) -> u64 {
        self.num_evals
    }

    /// The Hutchinson probe currently in force, if any.
    pub fn probe(&self) -> Option<&Array2<f32>> {
        self.probe.as_ref()
    }

    /// Arm one integration: reset the evaluation counter and either fix the
    /// probe or clear it so the first `forward` samples a fresh one.
    pub fn before_odeint(&mut self, probe: Option<Array2<f32>>) {
        self.probe = probe;
        self.num_evals = 0;
    }

    /// Joint derivative of all channels at time `t`.
    pub fn forward(&mut self, t: f32, states: &[StateChannel]) -> Result<Vec<StateChannel>> {
        if states.len() != 2 && states.len() != 3 {
            return Err(Error::Config(format!(
                "state tuple length {} unsupported; expected 2 or 3",
                states.len()
            )));
        }
        self.num_evals += 1;

        let y = states[0].as_mat()?;
        let (batch, dim) = y.dim();
        if dim != self.drift.input_dim() {
            return Err(Error::Shape("position width does not match the drift net"));
        }

        let probe = match &self.probe {
            Some(e) => {
                if e.dim() != (batch, dim) {
                    return Err(Error::Shape("fixed probe shape does not match position"));
                }
                e.clone()
            }
            None => {
                let e =
                    Array2::from_shape_fn((batch, dim), |_| StandardNormal.sample(&mut self.rng));
                self.probe = Some(e.clone());
                e
            }
        };

        let t_col = time_column(batch, t);
        let layer_ctx = if states.len() == 3 {
            let context = states[2].as_mat()?;
            concatenate(Axis(1), &[t_col.view(), context.view()])
                .map_err(|_| Error::Shape("failed to concatenate time and context"))?
        } else {
            t_col
        };

        let tape = self.drift.tape(&layer_ctx.view(), &y.view())?;
        let div = self
            .divergence
            .estimate(|cot| tape.vjp_state(cot), &probe)?;
        let neg_div = div.mapv(|v| -v).insert_axis(Axis(1));
        let dy = tape.into_output();

        let mut derivs = vec![StateChannel::Mat(dy), StateChannel::Mat(neg_div)];
        if states.len() == 3 {
            derivs.push(states[2].zeros_like());
        }
        Ok(derivs)
    }
}

/// Hypernetwork CNF state function over `[y, logp, weights]`, with the
/// divergence estimator chosen independently for training and evaluation.
#[derive(Debug, Clone)]
pub struct OdeHyperFunc {
    drift: HyperDriftNet,
    use_approx_train: bool,
    use_approx_test: bool,
    training: bool,
    probe: Option<Array3<f32>>,
    num_evals: u64,
    rng: ChaCha8Rng,
}

impl OdeHyperFunc {
    pub fn new(
        drift: HyperDriftNet,
        use_approx_train: bool,
        use_approx_test: bool,
        seed: u64,
    ) -> Self {
        Self {
            drift,
            use_approx_train,
            use_approx_test,
            training: true,
            probe: None,
            num_evals: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn drift(&self) -> &HyperDriftNet {
        &self.drift
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn num_evals(&self) -> u64 {
        self.num_evals
    }

    pub fn before_odeint(&mut self, probe: Option<Array3<f32>>) {
        self.probe = probe;
        self.num_evals = 0;
    }

    fn divergence_kind(&self) -> DivergenceKind {
        let use_approx = if self.training {
            self.use_approx_train
        } else {
            self.use_approx_test
        };
        if use_approx {
            DivergenceKind::Approx
        } else {
            DivergenceKind::BruteForce
        }
    }

    pub fn forward(&mut self, t: f32, states: &[StateChannel]) -> Result<Vec<StateChannel>> {
        if states.len() != 3 {
            return Err(Error::Config(format!(
                "state tuple length {} unsupported; expected 3",
                states.len()
            )));
        }
        self.num_evals += 1;

        let y = states[0].as_cube()?;
        let weights = states[2].as_mat()?;
        let (batch, points, dim) = y.dim();

        let probe = match &self.probe {
            Some(e) => {
                if e.dim() != (batch, points, dim) {
                    return Err(Error::Shape("fixed probe shape does not match position"));
                }
                e.clone()
            }
            None => {
                let e = Array3::from_shape_fn((batch, points, dim), |_| {
                    StandardNormal.sample(&mut self.rng)
                });
                self.probe = Some(e.clone());
                e
            }
        };

        let t_col = time_column(batch, t);
        let tape = self.drift.tape(&t_col, y, weights)?;
        let div = self
            .divergence_kind()
            .estimate(|cot| tape.vjp_state(cot), &probe)?;
        let neg_div = div.mapv(|v| -v).insert_axis(Axis(2));
        let dy = tape.into_output();

        Ok(vec![
            StateChannel::Cube(dy),
            StateChannel::Cube(neg_div),
            states[2].zeros_like(),
        ])
    }
}

/// Planar hypernetwork CNF state function over `[y, logp, y_points, weights]`.
/// The point coordinates ride along as a constant channel and are re-appended
/// to the state inside every drift layer.
#[derive(Debug, Clone)]
pub struct OdeHyperFunc2d {
    drift: HyperDriftNet2d,
    divergence: DivergenceKind,
    probe: Option<Array3<f32>>,
    num_evals: u64,
    rng: ChaCha8Rng,
}

impl OdeHyperFunc2d {
    pub fn new(drift: HyperDriftNet2d, divergence: DivergenceKind, seed: u64) -> Self {
        Self {
            drift,
            divergence,
            probe: None,
            num_evals: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn drift(&self) -> &HyperDriftNet2d {
        &self.drift
    }

    pub fn num_evals(&self) -> u64 {
        self.num_evals
    }

    pub fn before_odeint(&mut self, probe: Option<Array3<f32>>) {
        self.probe = probe;
        self.num_evals = 0;
    }

    pub fn forward(&mut self, t: f32, states: &[StateChannel]) -> Result<Vec<StateChannel>> {
        if states.len() != 4 {
            return Err(Error::Config(format!(
                "state tuple length {} unsupported; expected 4",
                states.len()
            )));
        }
        self.num_evals += 1;

        let y = states[0].as_cube()?;
        let y_points = states[2].as_cube()?;
        let weights = states[3].as_mat()?;
        let (batch, points, dim) = y.dim();

        let probe = match &self.probe {
            Some(e) => {
                if e.dim() != (batch, points, dim) {
                    return Err(Error::Shape("fixed probe shape does not match position"));
                }
                e.clone()
            }
            None => {
                let e = Array3::from_shape_fn((batch, points, dim), |_| {
                    StandardNormal.sample(&mut self.rng)
                });
                self.probe = Some(e.clone());
                e
            }
        };

        let t_col = time_column(batch, t);
        let tape = self.drift.tape(&t_col, y, y_points, weights)?;
        let div = self
            .divergence
            .estimate(|cot| tape.vjp_state(cot), &probe)?;
        let neg_div = div.mapv(|v| -v).insert_axis(Axis(2));
        let dy = tape.into_output();

        Ok(vec![
            StateChannel::Cube(dy),
            StateChannel::Cube(neg_div),
            states[2].zeros_like(),
            states[3].zeros_like(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::DriftNetConfig;
    use crate::layers::CondLayerKind;
    use crate::nonlin::Nonlinearity;
    use rand_distr::{Distribution, StandardNormal};

    fn small_func(divergence: DivergenceKind) -> OdeFunc {
        let cfg = DriftNetConfig {
            hidden_dims: vec![8],
            input_dim: 2,
            context_dim: 0,
            layer_kind: CondLayerKind::Concat,
            nonlinearity: Nonlinearity::Tanh,
            seed: 3,
        };
        OdeFunc::new(CondDriftNet::new(&cfg).unwrap(), divergence, 11)
    }

    fn randn2(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| StandardNormal.sample(&mut rng))
    }

    #[test]
    fn counter_counts_forwards_and_resets() {
        let mut f = small_func(DivergenceKind::Approx);
        let states = vec![
            StateChannel::Mat(randn2(4, 2, 1)),
            StateChannel::Mat(Array2::zeros((4, 1))),
        ];
        f.before_odeint(None);
        for _ in 0..5 {
            f.forward(0.1, &states).unwrap();
        }
        assert_eq!(f.num_evals(), 5);
        f.before_odeint(None);
        assert_eq!(f.num_evals(), 0);
    }

    #[test]
    fn probe_is_sampled_once_and_held() {
        let mut f = small_func(DivergenceKind::Approx);
        let states = vec![
            StateChannel::Mat(randn2(4, 2, 2)),
            StateChannel::Mat(Array2::zeros((4, 1))),
        ];
        f.before_odeint(None);
        assert!(f.probe().is_none());
        f.forward(0.0, &states).unwrap();
        let e1 = f.probe().unwrap().clone();
        f.forward(0.5, &states).unwrap();
        let e2 = f.probe().unwrap().clone();
        assert_eq!(e1, e2);
    }

    #[test]
    fn unsupported_tuple_lengths_fail_fast() {
        let mut f = small_func(DivergenceKind::Approx);
        let y = StateChannel::Mat(randn2(4, 2, 3));
        for states in [vec![y.clone()], vec![y.clone(); 4], vec![y.clone(); 5]] {
            match f.forward(0.0, &states) {
                Err(Error::Config(msg)) => assert!(msg.contains("state tuple length")),
                other => panic!("expected Config error, got {other:?}"),
            }
        }
    }

    #[test]
    fn conditional_context_gets_exact_zero_derivative() {
        let cfg = DriftNetConfig {
            hidden_dims: vec![8],
            input_dim: 2,
            context_dim: 3,
            layer_kind: CondLayerKind::ConcatSquash,
            nonlinearity: Nonlinearity::Softplus,
            seed: 4,
        };
        let mut f = OdeFunc::new(
            CondDriftNet::new(&cfg).unwrap(),
            DivergenceKind::Approx,
            13,
        );
        let states = vec![
            StateChannel::Mat(randn2(4, 2, 5)),
            StateChannel::Mat(Array2::zeros((4, 1))),
            StateChannel::Mat(randn2(4, 3, 6)),
        ];
        f.before_odeint(None);
        let derivs = f.forward(0.3, &states).unwrap();
        assert_eq!(derivs.len(), 3);
        match &derivs[2] {
            StateChannel::Mat(z) => {
                assert_eq!(z.dim(), (4, 3));
                assert!(z.iter().all(|&v| v == 0.0));
            }
            other => panic!("context derivative has wrong rank: {other:?}"),
        }
    }
}
