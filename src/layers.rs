//! Context-conditioned affine layers.
//!
//! A drift network is a stack of these. Each layer maps `(context, x)` to an
//! affine transform of `x`, with the context injected in one of seven ways:
//! ignored, concatenated onto the input, used to squash (sigmoid gate) or
//! scale (linear gate) the output, or combined concat-style with a gate and a
//! context-driven bias. The set is closed; a configuration key resolves to a
//! [`CondLayerKind`] at construction time or not at all.
//!
//! Divergence estimation replays cotangents through the stack, so every layer
//! also exposes the pullback of its output with respect to `x`. The affine
//! part is linear in `x`, which keeps the pullback parameter-only: it needs
//! the applied gate but not `x` itself.

use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use rand::Rng;

use crate::nonlin::sigmoid;
use crate::{Error, Result};

/// How a layer injects its conditioning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondLayerKind {
    /// Plain affine map; context unused.
    Ignore,
    /// Affine map gated by `sigmoid(W_g c + b_g)`.
    Squash,
    /// Affine map gated by the linear `W_g c + b_g`.
    Scale,
    /// Affine map over the concatenation `[x; c]`.
    Concat,
    /// Affine map plus a context-driven bias `U c`.
    ConcatV2,
    /// Sigmoid gate and context-driven bias: `(Wx+b) ⊙ σ(W_g c + b_g) + U c`.
    ConcatSquash,
    /// Linear gate and context-driven bias: `(Wx+b) ⊙ (W_g c + b_g) + U c`.
    ConcatScale,
}

impl CondLayerKind {
    /// Resolve a configuration key. Unknown keys are a construction-time error.
    pub fn parse(key: &str) -> Result<Self> {
        match key {
            "ignore" => Ok(Self::Ignore),
            "squash" => Ok(Self::Squash),
            "scale" => Ok(Self::Scale),
            "concat" => Ok(Self::Concat),
            "concat_v2" => Ok(Self::ConcatV2),
            "concatsquash" => Ok(Self::ConcatSquash),
            "concatscale" => Ok(Self::ConcatScale),
            other => Err(Error::Config(format!("unknown layer type {other:?}"))),
        }
    }

    /// All supported configuration keys.
    pub const KEYS: [&'static str; 7] = [
        "ignore",
        "squash",
        "scale",
        "concat",
        "concat_v2",
        "concatsquash",
        "concatscale",
    ];

    fn has_gate(self) -> bool {
        matches!(
            self,
            Self::Squash | Self::Scale | Self::ConcatSquash | Self::ConcatScale
        )
    }

    fn gate_is_sigmoid(self) -> bool {
        matches!(self, Self::Squash | Self::ConcatSquash)
    }

    fn has_ctx_bias(self) -> bool {
        matches!(self, Self::ConcatV2 | Self::ConcatSquash | Self::ConcatScale)
    }
}

/// One forward evaluation of a layer: the output plus the multiplicative gate
/// that was applied to the affine part (`None` for ungated kinds). The gate is
/// what the pullback needs; the input itself is not.
#[derive(Debug, Clone)]
pub struct LayerEval {
    pub out: Array2<f32>,
    pub gate: Option<Array2<f32>>,
}

/// A context-conditioned affine layer `(context, x) -> out`.
#[derive(Debug, Clone)]
pub struct CondLinear {
    kind: CondLayerKind,
    /// `(dim_out, w_in)` where `w_in` is `dim_in`, or `dim_in + ctx_dim` for
    /// the `Concat` kind.
    w: Array2<f32>,
    b: Array1<f32>,
    /// Gate parameters `(W_g, b_g)`, shapes `(dim_out, ctx_dim)` / `(dim_out,)`.
    gate_w: Option<Array2<f32>>,
    gate_b: Option<Array1<f32>>,
    /// Context-driven bias `U`, shape `(dim_out, ctx_dim)`; carries no bias of
    /// its own.
    ctx_bias_w: Option<Array2<f32>>,
    dim_in: usize,
    ctx_dim: usize,
}

fn init_matrix(rows: usize, cols: usize, fan_in: usize, rng: &mut impl Rng) -> Array2<f32> {
    let k = 1.0 / (fan_in.max(1) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.random_range(-k..k))
}

fn init_bias(len: usize, fan_in: usize, rng: &mut impl Rng) -> Array1<f32> {
    let k = 1.0 / (fan_in.max(1) as f32).sqrt();
    Array1::from_shape_fn(len, |_| rng.random_range(-k..k))
}

impl CondLinear {
    /// Build a layer mapping `dim_in -> dim_out` with context width `ctx_dim`.
    pub fn new(
        kind: CondLayerKind,
        dim_in: usize,
        dim_out: usize,
        ctx_dim: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let w_in = match kind {
            CondLayerKind::Concat => dim_in + ctx_dim,
            _ => dim_in,
        };
        let (gate_w, gate_b) = if kind.has_gate() {
            (
                Some(init_matrix(dim_out, ctx_dim, ctx_dim, rng)),
                Some(init_bias(dim_out, ctx_dim, rng)),
            )
        } else {
            (None, None)
        };
        let ctx_bias_w = kind
            .has_ctx_bias()
            .then(|| init_matrix(dim_out, ctx_dim, ctx_dim, rng));
        Self {
            kind,
            w: init_matrix(dim_out, w_in, w_in, rng),
            b: init_bias(dim_out, w_in, rng),
            gate_w,
            gate_b,
            ctx_bias_w,
            dim_in,
            ctx_dim,
        }
    }

    pub fn kind(&self) -> CondLayerKind {
        self.kind
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    pub fn dim_out(&self) -> usize {
        self.w.nrows()
    }

    /// Evaluate the layer, keeping the applied gate for later cotangent replay.
    pub fn forward(&self, context: &ArrayView2<f32>, x: &ArrayView2<f32>) -> Result<LayerEval> {
        if x.ncols() != self.dim_in {
            return Err(Error::Shape("layer input width does not match dim_in"));
        }
        if context.ncols() != self.ctx_dim {
            return Err(Error::Shape("layer context width does not match ctx_dim"));
        }
        if context.nrows() != x.nrows() {
            return Err(Error::Shape("context and state batch sizes differ"));
        }

        let affine = match self.kind {
            CondLayerKind::Concat => {
                let xc = concatenate(Axis(1), &[x.view(), context.view()])
                    .map_err(|_| Error::Shape("failed to concatenate state and context"))?;
                xc.dot(&self.w.t()) + &self.b
            }
            _ => x.dot(&self.w.t()) + &self.b,
        };

        let gate = if self.kind.has_gate() {
            let gw = self.gate_w.as_ref().ok_or(Error::Shape("missing gate"))?;
            let gb = self.gate_b.as_ref().ok_or(Error::Shape("missing gate"))?;
            let mut g = context.dot(&gw.t()) + gb;
            if self.kind.gate_is_sigmoid() {
                g.mapv_inplace(sigmoid);
            }
            Some(g)
        } else {
            None
        };

        let mut out = match &gate {
            Some(g) => affine * g,
            None => affine,
        };
        if let Some(u) = &self.ctx_bias_w {
            out += &context.dot(&u.t());
        }
        Ok(LayerEval { out, gate })
    }

    /// Pullback with respect to `x`: maps a cotangent of the output to a
    /// cotangent of the input. `gate` must be the gate captured by the
    /// matching [`Self::forward`] call.
    pub fn vjp_state(&self, gate: Option<&Array2<f32>>, cot: &Array2<f32>) -> Array2<f32> {
        let cot_affine = match gate {
            Some(g) => cot * g,
            None => cot.clone(),
        };
        match self.kind {
            // Only the first dim_in columns of w touch x; the rest read the
            // concatenated context, a constant for this pullback.
            CondLayerKind::Concat => {
                cot_affine.dot(&self.w.slice(ndarray::s![.., ..self.dim_in]))
            }
            _ => cot_affine.dot(&self.w),
        }
    }
}
