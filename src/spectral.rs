//! Spectral normalisation of weight tensors by power iteration.
//!
//! The weight is viewed as a matrix with the configured axis as rows and the
//! remaining axes flattened into columns. Two unit vectors `u` and `v` are
//! refined by power iteration whenever the owning layer runs in training mode,
//! and the weight is rescaled by `sigma = u^T W v`, the estimate of its
//! largest singular value.

use crate::{
    error::{GanError, Result},
    layers::WeightedLayer,
    shape::Shape,
    tensor::{dot, matvec, matvec_transposed, outer, Tensor},
};

pub const DEFAULT_EPS: f32 = 1e-12;

#[derive(Clone, Debug, PartialEq)]
pub struct SpectralNormConfig {
    pub name: String,
    pub n_power_iterations: usize,
    /// Axis holding the output channels, `None` uses the layer's default.
    pub dim: Option<usize>,
    pub eps: f32,
}

impl Default for SpectralNormConfig {
    fn default() -> Self {
        Self { name: "weight".to_string(), n_power_iterations: 1, dim: None, eps: DEFAULT_EPS }
    }
}

impl SpectralNormConfig {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn with_power_iterations(mut self, n_power_iterations: usize) -> Self {
        self.n_power_iterations = n_power_iterations;
        self
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }
}

/// `x / sqrt(max(|x|^2, eps^2))`, the divisor is never smaller than `eps`.
pub fn normalize(x: &[f32], eps: f32) -> Vec<f32> {
    let sum_sq = x.iter().map(|v| v * v).sum::<f32>();
    let norm = sum_sq.max(eps * eps).sqrt();
    x.iter().map(|v| v / norm).collect()
}

/// Singular vector estimates.
///
/// After at least one iteration `u ~ normalize(W v)` and `v ~ normalize(W^T u)`.
#[derive(Clone, Debug, PartialEq)]
pub struct PowerIterationState {
    pub u: Vec<f32>,
    pub v: Vec<f32>,
}

impl PowerIterationState {
    pub fn random(height: usize, width: usize, eps: f32) -> Self {
        let u = Tensor::random(Shape::new(&[height]), 0.0, 1.0, true);
        let v = Tensor::random(Shape::new(&[width]), 0.0, 1.0, true);
        Self { u: normalize(u.values(), eps), v: normalize(v.values(), eps) }
    }
}

/// A rescaled weight together with the (detached) estimates it was computed from.
#[derive(Clone, Debug)]
pub struct NormalisedWeight {
    pub weight: Tensor,
    pub sigma: f32,
    u: Vec<f32>,
    v: Vec<f32>,
}

/// Owns the original weight and the power iteration state for it.
#[derive(Clone, Debug)]
pub struct SpectralNorm {
    weight_orig: Tensor,
    state: PowerIterationState,
    sigma: f32,
    n_power_iterations: usize,
    dim: usize,
    eps: f32,
}

impl SpectralNorm {
    pub fn new(weight: Tensor, n_power_iterations: usize, dim: usize, eps: f32) -> Result<Self> {
        if n_power_iterations == 0 {
            return Err(GanError::InvalidArgument(
                "Expected n_power_iterations to be positive, but got n_power_iterations=0".to_string(),
            ));
        }

        if !(eps > 0.0) {
            return Err(GanError::InvalidArgument(format!("Expected a positive eps, got {eps}")));
        }

        let shape = weight.shape();
        if shape.rank() < 2 {
            return Err(GanError::InvalidArgument(format!("Cannot normalise a weight of shape {shape}")));
        }

        if dim >= shape.rank() {
            return Err(GanError::InvalidArgument(format!("Axis {dim} out of range for weight of shape {shape}")));
        }

        let (height, width) = shape.as_matrix(dim);
        let state = PowerIterationState::random(height, width, eps);

        let mut res = Self { weight_orig: weight, state, sigma: 0.0, n_power_iterations, dim, eps };
        res.sigma = res.estimate_sigma(&res.weight_matrix());

        Ok(res)
    }

    pub fn from_config(weight: Tensor, config: &SpectralNormConfig, default_dim: usize) -> Result<Self> {
        Self::new(weight, config.n_power_iterations, config.dim.unwrap_or(default_dim), config.eps)
    }

    pub fn weight_orig(&self) -> &Tensor {
        &self.weight_orig
    }

    /// The learnable parameter, for optimisers to update in place.
    pub fn weight_orig_mut(&mut self) -> &mut Tensor {
        &mut self.weight_orig
    }

    pub fn state(&self) -> &PowerIterationState {
        &self.state
    }

    /// Replaces the singular vector estimates, e.g. with the canonical copy
    /// after an external coordinator has merged replicas.
    pub fn load_state(&mut self, state: PowerIterationState) -> Result<()> {
        let (height, width) = self.matrix_shape();
        if state.u.len() != height || state.v.len() != width {
            return Err(GanError::InvalidArgument(format!(
                "Expected state of sizes ({height}, {width}), got ({}, {})",
                state.u.len(),
                state.v.len()
            )));
        }

        self.state = state;
        self.sigma = self.estimate_sigma(&self.weight_matrix());

        Ok(())
    }

    /// Last estimate of the largest singular value.
    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    pub fn n_power_iterations(&self) -> usize {
        self.n_power_iterations
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    pub fn matrix_shape(&self) -> (usize, usize) {
        self.weight_orig.shape().as_matrix(self.dim)
    }

    fn weight_matrix(&self) -> Tensor {
        self.weight_orig.move_axis_to_front(self.dim)
    }

    fn estimate_sigma(&self, mat: &Tensor) -> f32 {
        let (height, width) = self.matrix_shape();
        dot(&self.state.u, &matvec(mat.values(), height, width, &self.state.v))
    }

    /// `W / sigma`, refining `u` and `v` first if `do_power_iteration` is set.
    pub fn compute_weight(&mut self, do_power_iteration: bool) -> Tensor {
        self.forward(do_power_iteration).weight
    }

    pub fn forward(&mut self, do_power_iteration: bool) -> NormalisedWeight {
        let mat = self.weight_matrix();
        let (height, width) = self.matrix_shape();

        if do_power_iteration {
            let PowerIterationState { mut u, mut v } = self.state.clone();

            for _ in 0..self.n_power_iterations {
                v = normalize(&matvec_transposed(mat.values(), height, width, &u), self.eps);
                u = normalize(&matvec(mat.values(), height, width, &v), self.eps);
            }

            self.state = PowerIterationState { u, v };
        }

        self.sigma = self.estimate_sigma(&mat);

        let sigma = self.sigma;
        NormalisedWeight {
            weight: self.weight_orig.map(|x| x / sigma),
            sigma,
            u: self.state.u.clone(),
            v: self.state.v.clone(),
        }
    }

    /// Gradient with respect to the original weight given the gradient with
    /// respect to `normalised.weight`. The singular vectors are constants:
    /// `dW = G / sigma - <G, W> / sigma^2 * u v^T`.
    pub fn backward(&self, normalised: &NormalisedWeight, grad: &Tensor) -> Tensor {
        assert_eq!(grad.shape(), self.weight_orig.shape());

        let sigma = normalised.sigma;
        let inner = dot(grad.values(), self.weight_orig.values());

        let matrix_shape = self.weight_orig.shape().with_axis_first(self.dim);
        let uv = Tensor::from_vec(matrix_shape, outer(&normalised.u, &normalised.v)).move_front_axis_to(self.dim);

        grad.zip_map(&uv, |g, o| g / sigma - inner / (sigma * sigma) * o)
    }

    /// Discards the estimator state, returning the weight computed from the
    /// last seen singular vectors.
    pub fn remove(mut self) -> Tensor {
        self.compute_weight(false)
    }
}

/// A learnable weight, either used as-is or rescaled by its spectral norm.
#[derive(Clone, Debug)]
pub enum Weight {
    Plain(Tensor),
    Normalised(Box<SpectralNorm>),
}

impl Weight {
    /// The learnable tensor (the original weight when normalised).
    pub fn param(&self) -> &Tensor {
        match self {
            Self::Plain(weight) => weight,
            Self::Normalised(sn) => sn.weight_orig(),
        }
    }

    pub fn param_mut(&mut self) -> &mut Tensor {
        match self {
            Self::Plain(weight) => weight,
            Self::Normalised(sn) => sn.weight_orig_mut(),
        }
    }

    pub fn spectral_norm(&self) -> Option<&SpectralNorm> {
        match self {
            Self::Plain(_) => None,
            Self::Normalised(sn) => Some(&**sn),
        }
    }

    pub fn spectral_norm_mut(&mut self) -> Option<&mut SpectralNorm> {
        match self {
            Self::Plain(_) => None,
            Self::Normalised(sn) => Some(&mut **sn),
        }
    }

    /// The weight a layer should use; power iteration only runs in training mode.
    pub fn current_weight(&mut self, training: bool) -> Tensor {
        self.resolve(training).0
    }

    pub(crate) fn resolve(&mut self, training: bool) -> (Tensor, Option<NormalisedWeight>) {
        match self {
            Self::Plain(weight) => (weight.clone(), None),
            Self::Normalised(sn) => {
                let normalised = sn.forward(training);
                (normalised.weight.clone(), Some(normalised))
            }
        }
    }

    /// Maps a gradient with respect to the resolved weight onto the learnable tensor.
    pub(crate) fn param_grad(&self, normalised: Option<&NormalisedWeight>, grad: Tensor) -> Tensor {
        match (self, normalised) {
            (Self::Normalised(sn), Some(normalised)) => sn.backward(normalised, &grad),
            _ => grad,
        }
    }
}

/// Attaches a spectral norm estimator to the named weight of `layer`.
pub fn spectral_norm<L: WeightedLayer>(mut layer: L, config: &SpectralNormConfig) -> Result<L> {
    let default_dim = layer.output_axis();
    let name = config.name.as_str();

    let slot = layer.weight_slot(name).ok_or_else(|| {
        GanError::InvalidArgument(format!("`SpectralNorm` cannot be applied as parameter `{name}` is None"))
    })?;

    match slot {
        Weight::Plain(weight) => {
            let sn = SpectralNorm::from_config(weight.clone(), config, default_dim)?;
            *slot = Weight::Normalised(Box::new(sn));
            Ok(layer)
        }
        Weight::Normalised(_) => Err(GanError::InvalidState(format!(
            "Cannot register two spectral norm estimators on the same parameter `{name}`"
        ))),
    }
}

/// Replaces the named weight by the plain tensor last computed from it.
pub fn remove_spectral_norm<L: WeightedLayer>(layer: &mut L, name: &str) -> Result<()> {
    let not_found = || GanError::InvalidState(format!("spectral norm of `{name}` not found"));
    let slot = layer.weight_slot(name).ok_or_else(not_found)?;

    match slot {
        Weight::Plain(_) => Err(not_found()),
        Weight::Normalised(sn) => {
            let weight = (**sn).clone().remove();
            *slot = Weight::Plain(weight);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        weight: Weight,
        bias: Option<Weight>,
    }

    impl WeightedLayer for Dummy {
        fn weight_slot(&mut self, name: &str) -> Option<&mut Weight> {
            match name {
                "weight" => Some(&mut self.weight),
                "bias" => self.bias.as_mut(),
                _ => None,
            }
        }
    }

    fn dummy(shape: &[usize]) -> Dummy {
        Dummy { weight: Weight::Plain(Tensor::random(Shape::new(shape), 0.0, 1.0, true)), bias: None }
    }

    #[rustfmt::skip]
    fn diagonal() -> Tensor {
        Tensor::from_slice(
            Shape::new(&[3, 4]),
            &[
                3.0, 0.0, 0.0, 0.0,
                0.0, 1.0, 0.0, 0.0,
                0.0, 0.0, 0.5, 0.0,
            ],
        )
    }

    #[test]
    fn normalize_zero_vector_is_finite() {
        let out = normalize(&[0.0; 5], DEFAULT_EPS);
        assert!(out.iter().all(|x| x.is_finite()));
        assert!(out.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn normalize_never_divides_below_eps() {
        let eps = 1e-6;
        let out = normalize(&[1e-9, 0.0], eps);
        assert!((out[0] - 1e-3).abs() < 1e-9);

        let out = normalize(&[3.0, 4.0], eps);
        assert_eq!(out, vec![0.6, 0.8]);
    }

    #[test]
    fn rejects_bad_arguments() {
        let weight = Tensor::zeroed(Shape::new(&[2, 2]));
        assert!(matches!(SpectralNorm::new(weight.clone(), 0, 0, DEFAULT_EPS), Err(GanError::InvalidArgument(_))));
        assert!(matches!(SpectralNorm::new(weight.clone(), 1, 2, DEFAULT_EPS), Err(GanError::InvalidArgument(_))));
        assert!(matches!(SpectralNorm::new(weight, 1, 0, 0.0), Err(GanError::InvalidArgument(_))));

        let vector = Tensor::zeroed(Shape::new(&[4]));
        assert!(matches!(SpectralNorm::new(vector, 1, 0, DEFAULT_EPS), Err(GanError::InvalidArgument(_))));
    }

    #[test]
    fn state_dims_follow_axis() {
        let weight = Tensor::random(Shape::new(&[2, 3, 4]), 0.0, 1.0, true);

        let sn = SpectralNorm::new(weight.clone(), 1, 0, DEFAULT_EPS).unwrap();
        assert_eq!(sn.state().u.len(), 2);
        assert_eq!(sn.state().v.len(), 12);

        let sn = SpectralNorm::new(weight, 1, 1, DEFAULT_EPS).unwrap();
        assert_eq!(sn.state().u.len(), 3);
        assert_eq!(sn.state().v.len(), 8);
    }

    #[test]
    fn converges_to_largest_singular_value() {
        let mut sn = SpectralNorm::new(diagonal(), 30, 0, DEFAULT_EPS).unwrap();
        let weight = sn.compute_weight(true);

        assert!((sn.sigma().abs() - 3.0).abs() < 1e-4, "sigma = {}", sn.sigma());
        assert!((weight.values()[0].abs() - 1.0).abs() < 1e-4);

        // the rescaled weight has spectral norm one
        let mut check = SpectralNorm::new(weight, 30, 0, DEFAULT_EPS).unwrap();
        check.compute_weight(true);
        assert!((check.sigma().abs() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn fixed_point_after_training_pass() {
        for shape in [[8, 5], [5, 8], [16, 16]] {
            let weight = Tensor::random(Shape::new(&shape), 0.0, 1.0, true);
            let mut sn = SpectralNorm::new(weight, 200, 0, DEFAULT_EPS).unwrap();

            sn.compute_weight(true);
            let estimated = sn.sigma();
            let state = sn.state().clone();

            sn.compute_weight(false);
            assert_eq!(sn.state(), &state);
            assert!((sn.sigma() / estimated - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn singular_vector_invariant() {
        let mut sn = SpectralNorm::new(diagonal(), 30, 0, DEFAULT_EPS).unwrap();
        sn.compute_weight(true);

        let (h, w) = sn.matrix_shape();
        let mat = sn.weight_orig().values().to_vec();
        let PowerIterationState { u, v } = sn.state().clone();

        let u_again = normalize(&matvec(&mat, h, w, &v), DEFAULT_EPS);
        let v_again = normalize(&matvec_transposed(&mat, h, w, &u), DEFAULT_EPS);

        assert!(u.iter().zip(u_again.iter()).all(|(a, b)| (a - b).abs() < 1e-4));
        assert!(v.iter().zip(v_again.iter()).all(|(a, b)| (a - b).abs() < 1e-4));
    }

    #[test]
    fn eval_mode_keeps_state() {
        let mut sn = SpectralNorm::new(Tensor::random(Shape::new(&[4, 6]), 0.0, 1.0, true), 1, 0, DEFAULT_EPS).unwrap();
        let before = sn.state().clone();
        let a = sn.compute_weight(false);
        let b = sn.compute_weight(false);
        assert_eq!(sn.state(), &before);
        assert_eq!(a, b);
    }

    #[test]
    fn load_state() {
        let mut sn = SpectralNorm::new(diagonal(), 1, 0, DEFAULT_EPS).unwrap();

        let bad = PowerIterationState { u: vec![1.0; 4], v: vec![1.0; 3] };
        assert!(matches!(sn.load_state(bad), Err(GanError::InvalidArgument(_))));

        let exact = PowerIterationState { u: vec![1.0, 0.0, 0.0], v: vec![1.0, 0.0, 0.0, 0.0] };
        sn.load_state(exact).unwrap();
        assert_eq!(sn.sigma(), 3.0);
    }

    #[test]
    fn backward_matches_finite_differences() {
        // permuted axis so the gradient has to travel back through the permutation
        let shape = Shape::new(&[3, 2, 2]);
        let weight = Tensor::random(shape.clone(), 0.0, 1.0, true);
        let upstream = Tensor::random(shape, 0.0, 1.0, true);

        let mut sn = SpectralNorm::new(weight, 5, 1, DEFAULT_EPS).unwrap();
        let normalised = sn.forward(true);
        let grad = sn.backward(&normalised, &upstream);

        let loss = |sn: &mut SpectralNorm| dot(sn.compute_weight(false).values(), upstream.values()) as f64;

        let h = 1e-2;
        for i in 0..grad.size() {
            let mut plus = sn.clone();
            plus.weight_orig_mut().values_mut()[i] += h;
            let mut minus = sn.clone();
            minus.weight_orig_mut().values_mut()[i] -= h;

            let numeric = (loss(&mut plus) - loss(&mut minus)) / (2.0 * f64::from(h));
            let analytic = f64::from(grad.values()[i]);
            assert!((numeric - analytic).abs() < 1e-2 * (1.0 + analytic.abs()), "{i}: {numeric} vs {analytic}");
        }
    }

    #[test]
    fn attach_and_remove() {
        let layer = spectral_norm(dummy(&[4, 3]), &SpectralNormConfig::default()).unwrap();
        let sn = layer.weight.spectral_norm().unwrap();
        assert_eq!(sn.n_power_iterations(), 1);
        assert_eq!(sn.state().u.len(), 4);

        let mut layer = layer;
        let expected = layer.weight.spectral_norm().unwrap().clone().compute_weight(false);
        remove_spectral_norm(&mut layer, "weight").unwrap();
        assert!(layer.weight.spectral_norm().is_none());
        assert_eq!(layer.weight.param(), &expected);
    }

    #[test]
    fn attach_errors() {
        let config = SpectralNormConfig::default().with_power_iterations(0);
        assert!(matches!(spectral_norm(dummy(&[4, 3]), &config), Err(GanError::InvalidArgument(_))));

        let config = SpectralNormConfig::new("bias");
        assert!(matches!(spectral_norm(dummy(&[4, 3]), &config), Err(GanError::InvalidArgument(_))));

        let config = SpectralNormConfig::new("gamma");
        assert!(matches!(spectral_norm(dummy(&[4, 3]), &config), Err(GanError::InvalidArgument(_))));

        let layer = spectral_norm(dummy(&[4, 3]), &SpectralNormConfig::default()).unwrap();
        assert!(matches!(spectral_norm(layer, &SpectralNormConfig::default()), Err(GanError::InvalidState(_))));
    }

    #[test]
    fn remove_never_applied() {
        let mut layer = dummy(&[4, 3]);
        assert!(matches!(remove_spectral_norm(&mut layer, "weight"), Err(GanError::InvalidState(_))));
        assert!(matches!(remove_spectral_norm(&mut layer, "bias"), Err(GanError::InvalidState(_))));
        assert!(matches!(remove_spectral_norm(&mut layer, "gain"), Err(GanError::InvalidState(_))));
    }
}
