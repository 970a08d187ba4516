//! Drift networks whose weights arrive at call time.
//!
//! A hypernetwork elsewhere in the model emits one flat parameter vector per
//! sample; [`HyperDriftNet`] unpacks it layer by layer into a weight matrix, a
//! bias, and FiLM-style gate/shift parameters, so every sample flows under its
//! own drift function. [`HyperDriftNet2d`] is the variant for planar point
//! clouds, which concatenates two fixed coordinate columns onto the state at
//! every layer.
//!
//! The unpacking order is a wire contract shared with whatever generates the
//! vector. It is captured once per network in a [`WeightLayout`]: an ordered
//! list of named segments with sizes and offsets, per layer
//! `Weight (din × dout), Bias (dout), WeightScale (dout), BiasScale (dout),
//! WeightShift (dout)`. Reads go through the descriptor, never through ad hoc
//! running offsets, and a flat vector whose width disagrees with
//! [`WeightLayout::total_len`] is rejected before any compute.

use ndarray::{concatenate, s, Array2, Array3, ArrayView1, ArrayView2, Axis};

use crate::nonlin::{sigmoid, Nonlinearity};
use crate::{Error, Result};

/// Names of the per-layer segments of the flat weight vector, in unpack order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Weight,
    Bias,
    WeightScale,
    BiasScale,
    WeightShift,
}

/// One named slice of the flat weight vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub layer: usize,
    pub rows: usize,
    pub cols: usize,
    pub offset: usize,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The full unpacking plan for one network, computed once from its dims.
#[derive(Debug, Clone)]
pub struct WeightLayout {
    segments: Vec<Segment>,
    total: usize,
}

impl WeightLayout {
    /// Layout for layer widths `dims`, with `extra_in` additional input
    /// columns per layer (2 for the planar variant, 0 otherwise).
    pub fn for_dims(dims: &[usize], extra_in: usize) -> Self {
        let mut segments = Vec::with_capacity(5 * dims.len().saturating_sub(1));
        let mut offset = 0;
        for l in 0..dims.len().saturating_sub(1) {
            let din = dims[l] + extra_in;
            let dout = dims[l + 1];
            for (kind, rows, cols) in [
                (SegmentKind::Weight, din, dout),
                (SegmentKind::Bias, 1, dout),
                (SegmentKind::WeightScale, 1, dout),
                (SegmentKind::BiasScale, 1, dout),
                (SegmentKind::WeightShift, 1, dout),
            ] {
                segments.push(Segment {
                    kind,
                    layer: l,
                    rows,
                    cols,
                    offset,
                });
                offset += rows * cols;
            }
        }
        Self {
            segments,
            total: offset,
        }
    }

    /// Expected width of the flat per-sample weight vector.
    pub fn total_len(&self) -> usize {
        self.total
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn segment(&self, layer: usize, kind: SegmentKind) -> Result<&Segment> {
        self.segments
            .iter()
            .find(|s| s.layer == layer && s.kind == kind)
            .ok_or(Error::Shape("weight layout has no such segment"))
    }

    /// Matrix view of one sample's segment, shape `(rows, cols)`.
    fn mat<'a>(
        &self,
        weights: &'a Array2<f32>,
        sample: usize,
        layer: usize,
        kind: SegmentKind,
    ) -> Result<ArrayView2<'a, f32>> {
        let seg = self.segment(layer, kind)?;
        weights
            .slice(s![sample, seg.offset..seg.offset + seg.len()])
            .into_shape_with_order((seg.rows, seg.cols))
            .map_err(|_| Error::Shape("weight segment view is not contiguous"))
    }

    /// Vector view of one sample's segment (for the `rows == 1` segments).
    fn vec<'a>(
        &self,
        weights: &'a Array2<f32>,
        sample: usize,
        layer: usize,
        kind: SegmentKind,
    ) -> Result<ArrayView1<'a, f32>> {
        let seg = self.segment(layer, kind)?;
        Ok(weights.slice(s![sample, seg.offset..seg.offset + seg.len()]))
    }
}

fn parse_dims(hidden: &str, input_dim: usize) -> Result<Vec<usize>> {
    if input_dim == 0 {
        return Err(Error::Config("input_dim must be >= 1".into()));
    }
    let mut dims = vec![input_dim];
    for tok in hidden.split('-') {
        let h: usize = tok
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid hidden width {tok:?} in dims string")))?;
        if h == 0 {
            return Err(Error::Config(format!("hidden width {tok:?} must be >= 1")));
        }
        dims.push(h);
    }
    // The drift must live in the same space as the state.
    dims.push(input_dim);
    Ok(dims)
}

/// Shared evaluation core for both hypernet variants.
#[derive(Debug, Clone)]
struct HyperCore {
    dims: Vec<usize>,
    layout: WeightLayout,
    activation: Nonlinearity,
    extra_in: usize,
}

impl HyperCore {
    fn new(hidden: &str, input_dim: usize, activation: Nonlinearity, extra_in: usize) -> Result<Self> {
        let dims = parse_dims(hidden, input_dim)?;
        let layout = WeightLayout::for_dims(&dims, extra_in);
        Ok(Self {
            dims,
            layout,
            activation,
            extra_in,
        })
    }

    fn validate(
        &self,
        context: &Array2<f32>,
        y: &Array3<f32>,
        points: Option<&Array3<f32>>,
        weights: &Array2<f32>,
    ) -> Result<()> {
        let (b, n, d) = y.dim();
        if d != self.dims[0] {
            return Err(Error::Shape("state width does not match input_dim"));
        }
        if weights.nrows() != b || context.nrows() != b {
            return Err(Error::Shape("batch sizes of state, context, weights differ"));
        }
        if weights.ncols() != self.layout.total_len() {
            return Err(Error::WeightLen {
                expected: self.layout.total_len(),
                got: weights.ncols(),
            });
        }
        let m = context.ncols();
        if m != 1 && m != n {
            return Err(Error::Shape(
                "context width must be 1 or match the point count",
            ));
        }
        if let Some(p) = points {
            if p.dim() != (b, n, self.extra_in) {
                return Err(Error::Shape("point coordinates must be (batch, points, 2)"));
            }
        }
        Ok(())
    }

    /// Forward pass recording gates and pre-activations for cotangent replay.
    fn tape<'a>(
        &'a self,
        context: &Array2<f32>,
        y: &Array3<f32>,
        points: Option<&Array3<f32>>,
        weights: &'a Array2<f32>,
    ) -> Result<HyperDriftTape<'a>> {
        self.validate(context, y, points, weights)?;
        let (b, n, _) = y.dim();
        let m = context.ncols();
        let last = self.dims.len() - 2;

        let mut gates = Vec::with_capacity(last + 1);
        let mut preacts = Vec::with_capacity(last);
        let mut dx = y.clone();

        for l in 0..=last {
            let dout = self.dims[l + 1];
            let mut out = Array3::<f32>::zeros((b, n, dout));
            let mut gate = Array3::<f32>::zeros((b, m, dout));

            for i in 0..b {
                let w = self.layout.mat(weights, i, l, SegmentKind::Weight)?;
                let bias = self.layout.vec(weights, i, l, SegmentKind::Bias)?;
                let wscale = self.layout.vec(weights, i, l, SegmentKind::WeightScale)?;
                let bscale = self.layout.vec(weights, i, l, SegmentKind::BiasScale)?;
                let wshift = self.layout.vec(weights, i, l, SegmentKind::WeightShift)?;

                let xi = dx.slice(s![i, .., ..]);
                let u = match points {
                    Some(p) => {
                        let cat = concatenate(Axis(1), &[xi, p.slice(s![i, .., ..])])
                            .map_err(|_| Error::Shape("failed to append point coordinates"))?;
                        cat.dot(&w)
                    }
                    None => xi.dot(&w),
                };

                for mi in 0..m {
                    for o in 0..dout {
                        gate[[i, mi, o]] = sigmoid(context[[i, mi]] * wscale[o] + bscale[o]);
                    }
                }
                for r in 0..n {
                    let mr = if m == 1 { 0 } else { r };
                    for o in 0..dout {
                        out[[i, r, o]] = (u[[r, o]] + bias[o]) * gate[[i, mr, o]]
                            + context[[i, mr]] * wshift[o];
                    }
                }
            }

            gates.push(gate);
            if l < last {
                preacts.push(out.clone());
                dx = self.activation.apply(&out);
            } else {
                dx = out;
            }
        }

        Ok(HyperDriftTape {
            core: self,
            weights,
            gates,
            preacts,
            out: dx,
        })
    }
}

/// One recorded forward evaluation of a hypernetwork drift.
#[derive(Debug)]
pub struct HyperDriftTape<'a> {
    core: &'a HyperCore,
    weights: &'a Array2<f32>,
    gates: Vec<Array3<f32>>,
    preacts: Vec<Array3<f32>>,
    out: Array3<f32>,
}

impl HyperDriftTape<'_> {
    /// The drift `dy` captured by this tape.
    pub fn output(&self) -> &Array3<f32> {
        &self.out
    }

    pub fn into_output(self) -> Array3<f32> {
        self.out
    }

    /// Pullback of the recorded evaluation with respect to the state `y`.
    /// Fixed point coordinates and the weight vector are constants here.
    pub fn vjp_state(&self, cot: &Array3<f32>) -> Result<Array3<f32>> {
        if cot.dim() != self.out.dim() {
            return Err(Error::Shape("cotangent shape does not match drift output"));
        }
        let core = self.core;
        let (b, n, _) = self.out.dim();
        let last = core.dims.len() - 2;

        let mut g = cot.clone();
        for l in (0..=last).rev() {
            if l < last {
                g = g * core.activation.apply_derivative(&self.preacts[l]);
            }
            let din = core.dims[l];
            let dout = core.dims[l + 1];
            let gate = &self.gates[l];
            let m = gate.dim().1;

            let mut g_prev = Array3::<f32>::zeros((b, n, din));
            for i in 0..b {
                let w = core.layout.mat(self.weights, i, l, SegmentKind::Weight)?;
                // Cotangent of the pre-gate affine output.
                let mut gu = Array2::<f32>::zeros((n, dout));
                for r in 0..n {
                    let mr = if m == 1 { 0 } else { r };
                    for o in 0..dout {
                        gu[[r, o]] = g[[i, r, o]] * gate[[i, mr, o]];
                    }
                }
                // Back through the matmul; the appended coordinate columns (if
                // any) belong to the fixed points, so only the first din rows
                // of the weight matrix touch the state.
                let gx = gu.dot(&w.slice(s![..din, ..]).t());
                g_prev.slice_mut(s![i, .., ..]).assign(&gx);
            }
            g = g_prev;
        }
        Ok(g)
    }
}

/// Drift network with externally supplied weights: `(context, y, weights) -> dy`.
///
/// `y` is `(batch, points, input_dim)`; `weights` is one flat vector per batch
/// sample, laid out per [`WeightLayout`]. The context is typically the
/// broadcast time column `(batch, 1)`.
#[derive(Debug, Clone)]
pub struct HyperDriftNet {
    core: HyperCore,
}

impl HyperDriftNet {
    /// `hidden` is a dash-delimited list of hidden widths, e.g. `"64-64"`.
    pub fn new(hidden: &str, input_dim: usize, nonlinearity: Nonlinearity) -> Result<Self> {
        Ok(Self {
            core: HyperCore::new(hidden, input_dim, nonlinearity, 0)?,
        })
    }

    /// Layer widths, `[input_dim, hidden..., input_dim]`.
    pub fn dims(&self) -> &[usize] {
        &self.core.dims
    }

    pub fn layout(&self) -> &WeightLayout {
        &self.core.layout
    }

    /// Expected width of the flat per-sample weight vector.
    pub fn weight_len(&self) -> usize {
        self.core.layout.total_len()
    }

    pub fn forward(
        &self,
        context: &Array2<f32>,
        y: &Array3<f32>,
        weights: &Array2<f32>,
    ) -> Result<Array3<f32>> {
        Ok(self.tape(context, y, weights)?.into_output())
    }

    pub fn tape<'a>(
        &'a self,
        context: &Array2<f32>,
        y: &Array3<f32>,
        weights: &'a Array2<f32>,
    ) -> Result<HyperDriftTape<'a>> {
        self.core.tape(context, y, None, weights)
    }
}

/// Planar variant: `(context, y, y_points, weights) -> dy`, with the two
/// fixed coordinate columns of `y_points` appended to the state before every
/// layer's matmul.
#[derive(Debug, Clone)]
pub struct HyperDriftNet2d {
    core: HyperCore,
}

impl HyperDriftNet2d {
    pub fn new(hidden: &str, input_dim: usize, nonlinearity: Nonlinearity) -> Result<Self> {
        Ok(Self {
            core: HyperCore::new(hidden, input_dim, nonlinearity, 2)?,
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.core.dims
    }

    pub fn layout(&self) -> &WeightLayout {
        &self.core.layout
    }

    pub fn weight_len(&self) -> usize {
        self.core.layout.total_len()
    }

    pub fn forward(
        &self,
        context: &Array2<f32>,
        y: &Array3<f32>,
        y_points: &Array3<f32>,
        weights: &Array2<f32>,
    ) -> Result<Array3<f32>> {
        Ok(self.tape(context, y, y_points, weights)?.into_output())
    }

    pub fn tape<'a>(
        &'a self,
        context: &Array2<f32>,
        y: &Array3<f32>,
        y_points: &Array3<f32>,
        weights: &'a Array2<f32>,
    ) -> Result<HyperDriftTape<'a>> {
        self.core.tape(context, y, Some(y_points), weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn randn2(rows: usize, cols: usize, rng: &mut ChaCha8Rng) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |_| StandardNormal.sample(rng))
    }

    fn randn3(a: usize, b: usize, c: usize, rng: &mut ChaCha8Rng) -> Array3<f32> {
        Array3::from_shape_fn((a, b, c), |_| StandardNormal.sample(rng))
    }

    #[test]
    fn layout_matches_closed_form() {
        // Per layer: (din + extra) * dout + 4 * dout.
        for (dims, extra) in [
            (vec![3usize, 8, 3], 0usize),
            (vec![2, 16, 16, 2], 0),
            (vec![1, 4, 1], 2),
            (vec![3, 8, 3], 2),
        ] {
            let layout = WeightLayout::for_dims(&dims, extra);
            let mut expect = 0;
            for l in 0..dims.len() - 1 {
                expect += (dims[l] + extra) * dims[l + 1] + 4 * dims[l + 1];
            }
            assert_eq!(layout.total_len(), expect, "dims {dims:?} extra {extra}");
            // Segments tile the vector exactly, in order, with no gaps.
            let mut cursor = 0;
            for seg in layout.segments() {
                assert_eq!(seg.offset, cursor);
                cursor += seg.len();
            }
            assert_eq!(cursor, layout.total_len());
        }
    }

    #[test]
    fn weight_width_mismatch_is_rejected() {
        let net = HyperDriftNet::new("8", 3, Nonlinearity::Softplus).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let y = randn3(2, 5, 3, &mut rng);
        let ctx = randn2(2, 1, &mut rng);
        for delta in [-1i64, 1] {
            let w = randn2(2, (net.weight_len() as i64 + delta) as usize, &mut rng);
            match net.forward(&ctx, &y, &w) {
                Err(Error::WeightLen { expected, got }) => {
                    assert_eq!(expected, net.weight_len());
                    assert_eq!(got as i64, net.weight_len() as i64 + delta);
                }
                other => panic!("expected WeightLen error, got {other:?}"),
            }
        }
        let w = randn2(2, net.weight_len(), &mut rng);
        assert!(net.forward(&ctx, &y, &w).is_ok());
    }

    #[test]
    fn bad_dims_strings_are_configuration_errors() {
        assert!(HyperDriftNet::new("8-x-4", 3, Nonlinearity::Tanh).is_err());
        assert!(HyperDriftNet::new("8-0", 3, Nonlinearity::Tanh).is_err());
        assert!(HyperDriftNet::new("", 3, Nonlinearity::Tanh).is_err());
        assert!(HyperDriftNet::new("8", 0, Nonlinearity::Tanh).is_err());
    }

    #[test]
    fn forward_shapes_and_dims_round_trip() {
        let net = HyperDriftNet::new("16-8", 3, Nonlinearity::Softplus).unwrap();
        assert_eq!(net.dims(), &[3, 16, 8, 3]);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let y = randn3(2, 7, 3, &mut rng);
        let ctx = randn2(2, 1, &mut rng);
        let w = randn2(2, net.weight_len(), &mut rng);
        let dy = net.forward(&ctx, &y, &w).unwrap();
        assert_eq!(dy.dim(), (2, 7, 3));
    }

    #[test]
    fn planar_variant_accounts_for_coordinate_columns() {
        let net = HyperDriftNet2d::new("8", 3, Nonlinearity::Tanh).unwrap();
        let plain = HyperDriftNet::new("8", 3, Nonlinearity::Tanh).unwrap();
        // Two extra input columns per layer.
        assert_eq!(net.weight_len(), plain.weight_len() + 2 * 8 + 2 * 3);

        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let y = randn3(2, 5, 3, &mut rng);
        let pts = randn3(2, 5, 2, &mut rng);
        let ctx = randn2(2, 1, &mut rng);
        let w = randn2(2, net.weight_len(), &mut rng);
        let dy = net.forward(&ctx, &y, &pts, &w).unwrap();
        assert_eq!(dy.dim(), (2, 5, 3));
    }

    #[test]
    fn tape_vjp_matches_finite_differences() {
        let net = HyperDriftNet::new("6", 2, Nonlinearity::Tanh).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let y = randn3(2, 3, 2, &mut rng);
        let ctx = randn2(2, 1, &mut rng);
        // Keep weights modest so finite differences stay in range.
        let w = randn2(2, net.weight_len(), &mut rng).mapv(|v| 0.5 * v);
        let cot = randn3(2, 3, 2, &mut rng);

        let tape = net.tape(&ctx, &y, &w).unwrap();
        let grad = tape.vjp_state(&cot).unwrap();

        let h = 1e-3f32;
        for i in 0..2 {
            for r in 0..3 {
                for k in 0..2 {
                    let mut yp = y.clone();
                    let mut ym = y.clone();
                    yp[[i, r, k]] += h;
                    ym[[i, r, k]] -= h;
                    let fp = net.forward(&ctx, &yp, &w).unwrap();
                    let fm = net.forward(&ctx, &ym, &w).unwrap();
                    let mut fd = 0.0f32;
                    for rr in 0..3 {
                        for o in 0..2 {
                            fd += cot[[i, rr, o]] * (fp[[i, rr, o]] - fm[[i, rr, o]]) / (2.0 * h);
                        }
                    }
                    assert!(
                        (fd - grad[[i, r, k]]).abs() <= 2e-2 + 2e-2 * grad[[i, r, k]].abs(),
                        "fd={fd} vjp={} at ({i},{r},{k})",
                        grad[[i, r, k]]
                    );
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        // The layout width always equals what one forward pass consumes: an
        // exact-width vector is accepted and every segment lies inside it.
        #[test]
        fn prop_layout_total_is_consumed_exactly(
            d in 1usize..5,
            h1 in 1usize..9,
            h2 in 1usize..9,
            extra in 0usize..3usize,
        ) {
            let dims = vec![d, h1, h2, d];
            let layout = WeightLayout::for_dims(&dims, extra);
            let mut consumed = 0usize;
            for seg in layout.segments() {
                prop_assert_eq!(seg.offset, consumed);
                consumed += seg.len();
            }
            prop_assert_eq!(consumed, layout.total_len());
        }
    }
}
