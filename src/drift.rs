//! The plain conditional drift network.
//!
//! [`CondDriftNet`] stacks context-conditioned affine layers with a
//! nonlinearity between them and maps `(context, y)` back into the space `y`
//! lives in: layer widths run `dim -> hidden[0] -> ... -> hidden[n-1] -> dim`,
//! so the output is a valid state derivative.
//!
//! The `context` handed to [`CondDriftNet::tape`] is the full per-call layer
//! context: the broadcast time column, plus any conditioning signal the
//! enclosing state function concatenates onto it. `DriftNetConfig::context_dim`
//! counts only the conditioning part; the time column is always accounted for.

use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::layers::{CondLayerKind, CondLinear};
use crate::nonlin::Nonlinearity;
use crate::{Error, Result};

/// Construction parameters for [`CondDriftNet`].
#[derive(Debug, Clone)]
pub struct DriftNetConfig {
    /// Hidden layer widths; the final layer always maps back to `input_dim`.
    pub hidden_dims: Vec<usize>,
    /// Dimensionality of the flow state.
    pub input_dim: usize,
    /// Width of the conditioning signal, excluding the time column.
    pub context_dim: usize,
    pub layer_kind: CondLayerKind,
    pub nonlinearity: Nonlinearity,
    /// Seed for parameter initialization.
    pub seed: u64,
}

impl Default for DriftNetConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![64, 64],
            input_dim: 2,
            context_dim: 0,
            layer_kind: CondLayerKind::Concat,
            nonlinearity: Nonlinearity::Softplus,
            seed: 0,
        }
    }
}

/// A drift network for continuous normalizing flows: `(context, y) -> dy`.
#[derive(Debug, Clone)]
pub struct CondDriftNet {
    layers: Vec<CondLinear>,
    nonlinearity: Nonlinearity,
    input_dim: usize,
    ctx_width: usize,
}

impl CondDriftNet {
    pub fn new(cfg: &DriftNetConfig) -> Result<Self> {
        if cfg.input_dim == 0 {
            return Err(Error::Config("input_dim must be >= 1".into()));
        }
        if let Some(pos) = cfg.hidden_dims.iter().position(|&h| h == 0) {
            return Err(Error::Config(format!(
                "hidden_dims[{pos}] must be >= 1"
            )));
        }

        // One extra context column for the time channel.
        let ctx_width = cfg.context_dim + 1;
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);

        let mut layers = Vec::with_capacity(cfg.hidden_dims.len() + 1);
        let mut dim_in = cfg.input_dim;
        for &dim_out in cfg.hidden_dims.iter().chain([cfg.input_dim].iter()) {
            layers.push(CondLinear::new(
                cfg.layer_kind,
                dim_in,
                dim_out,
                ctx_width,
                &mut rng,
            ));
            dim_in = dim_out;
        }

        Ok(Self {
            layers,
            nonlinearity: cfg.nonlinearity,
            input_dim: cfg.input_dim,
            ctx_width,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Output width of the final layer; equals `input_dim` by construction.
    pub fn output_dim(&self) -> usize {
        self.layers
            .last()
            .map(|l| l.dim_out())
            .unwrap_or(self.input_dim)
    }

    /// Full layer-context width (conditioning plus the time column).
    pub fn ctx_width(&self) -> usize {
        self.ctx_width
    }

    /// Evaluate the drift.
    pub fn forward(&self, context: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Result<Array2<f32>> {
        Ok(self.tape(context, y)?.into_output())
    }

    /// Evaluate the drift and capture the per-layer values needed to replay
    /// cotangents through the evaluation.
    pub fn tape<'a>(
        &'a self,
        context: &ArrayView2<f32>,
        y: &ArrayView2<f32>,
    ) -> Result<DriftTape<'a>> {
        let mut gates = Vec::with_capacity(self.layers.len());
        let mut preacts = Vec::with_capacity(self.layers.len().saturating_sub(1));

        let mut dx = y.to_owned();
        let last = self.layers.len() - 1;
        for (l, layer) in self.layers.iter().enumerate() {
            let eval = layer.forward(context, &dx.view())?;
            gates.push(eval.gate);
            if l < last {
                // Keep the pre-activation; its pointwise derivative scales the
                // cotangent on the way back.
                preacts.push(eval.out.clone());
                dx = self.nonlinearity.apply(&eval.out);
            } else {
                dx = eval.out;
            }
        }

        Ok(DriftTape {
            net: self,
            gates,
            preacts,
            out: dx,
        })
    }
}

/// One recorded forward evaluation of a [`CondDriftNet`].
#[derive(Debug)]
pub struct DriftTape<'a> {
    net: &'a CondDriftNet,
    gates: Vec<Option<Array2<f32>>>,
    preacts: Vec<Array2<f32>>,
    out: Array2<f32>,
}

impl DriftTape<'_> {
    /// The drift `dy` captured by this tape.
    pub fn output(&self) -> &Array2<f32> {
        &self.out
    }

    pub fn into_output(self) -> Array2<f32> {
        self.out
    }

    /// Pullback of the recorded evaluation: maps a cotangent of `dy` to a
    /// cotangent of `y`.
    pub fn vjp_state(&self, cot: &Array2<f32>) -> Result<Array2<f32>> {
        if cot.dim() != self.out.dim() {
            return Err(Error::Shape("cotangent shape does not match drift output"));
        }
        let mut g = cot.clone();
        for l in (0..self.net.layers.len()).rev() {
            if l < self.net.layers.len() - 1 {
                g = g * self.net.nonlinearity.apply_derivative(&self.preacts[l]);
            }
            g = self.net.layers[l].vjp_state(self.gates[l].as_ref(), &g);
        }
        Ok(g)
    }
}
