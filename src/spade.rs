//! Spatially-adaptive normalisation.
//!
//! Activations are normalised without learnable affine, then modulated by a
//! per-channel, per-location scale and shift predicted from the semantic map:
//! `out = norm(x) * (1 + gamma(seg)) + beta(seg)`.

mod config;
mod positional;

pub use config::{NoiseMode, SpadeConfig, SpadeOptions, SPADE_HIDDEN};
pub use positional::{sincos_2d, PositionalCache};

use crate::{
    error::Result,
    layers::{Conv2d, ConvCache, NormCache, ParamFreeNorm},
    shape::Shape,
    tensor::{resize_nearest, Tensor},
};

#[derive(Clone, Debug)]
pub struct Spade {
    config: SpadeConfig,
    options: SpadeOptions,
    norm: ParamFreeNorm,
    mlp_shared: Conv2d,
    mlp_gamma: Conv2d,
    mlp_beta: Conv2d,
    pos_proj: Option<Conv2d>,
    seg_noise: Option<Conv2d>,
    noise_var: Option<(Tensor, Tensor)>,
    positional: PositionalCache,
}

#[derive(Clone, Debug)]
enum NoiseCache {
    None,
    PerChannel { sample: Tensor },
    Segmentation { sample: Tensor, scale: ConvCache },
}

#[derive(Clone, Debug)]
pub struct SpadeCache {
    noise: NoiseCache,
    norm: NormCache,
    normalised: Tensor,
    shared: ConvCache,
    shared_pre: Tensor,
    pos_proj: Option<ConvCache>,
    gamma: Tensor,
    gamma_cache: ConvCache,
    beta_cache: ConvCache,
}

/// `x[b, c, y, x] + sample[b, 0, y, x] * scale(b, c, y, x)`
fn add_broadcast_noise<F: Fn(usize, usize, usize) -> f32>(x: &Tensor, sample: &Tensor, scale: F) -> Tensor {
    let (n, c, _, _) = x.shape().as_nchw();
    let mut out = x.clone();
    for b in 0..n {
        let noise = sample.plane(b, 0);
        for ch in 0..c {
            for (i, (o, &s)) in out.plane_mut(b, ch).iter_mut().zip(noise.iter()).enumerate() {
                *o += s * scale(b, ch, i);
            }
        }
    }
    out
}

/// Adds a `[1, c, h, w]` tensor to every batch item.
fn add_to_batch(x: &mut Tensor, single: &Tensor) {
    for item in x.values_mut().chunks_exact_mut(single.size()) {
        item.iter_mut().zip(single.values().iter()).for_each(|(o, &p)| *o += p);
    }
}

fn sum_over_batch(x: &Tensor) -> Tensor {
    let (_, c, h, w) = x.shape().as_nchw();
    let mut out = Tensor::zeroed(Shape::nchw(1, c, h, w));
    for item in x.values().chunks_exact(out.size()) {
        out.values_mut().iter_mut().zip(item.iter()).for_each(|(o, &g)| *o += g);
    }
    out
}

impl Spade {
    pub fn new(config: SpadeConfig, norm_nc: usize, label_nc: usize, options: SpadeOptions) -> Result<Self> {
        options.validate()?;

        let hidden = options.hidden_channels;
        let kernel = config.kernel;

        let pos_proj = (options.use_pos && options.use_pos_proj).then(|| Conv2d::new(hidden, hidden, 1));

        let seg_noise = (options.noise == NoiseMode::Segmentation).then(|| {
            let k = options.seg_noise_kernel;
            Conv2d::new(label_nc, norm_nc, k).with_padding((k - 1) / 2).zero_initialised()
        });

        let noise_var = (options.noise == NoiseMode::PerChannel).then(|| {
            let shape = Shape::new(&[norm_nc]);
            (Tensor::zeroed(shape.clone()), Tensor::zeroed(shape))
        });

        Ok(Self {
            config,
            options,
            norm: ParamFreeNorm::new(config.norm, norm_nc),
            mlp_shared: Conv2d::new(label_nc, hidden, kernel),
            mlp_gamma: Conv2d::new(hidden, norm_nc, kernel),
            mlp_beta: Conv2d::new(hidden, norm_nc, kernel),
            pos_proj,
            seg_noise,
            noise_var,
            positional: PositionalCache::default(),
        })
    }

    /// Parses the config from e.g. `spadeinstance3x3`.
    pub fn from_spec(spec: &str, norm_nc: usize, label_nc: usize, options: SpadeOptions) -> Result<Self> {
        Self::new(spec.parse()?, norm_nc, label_nc, options)
    }

    pub fn config(&self) -> SpadeConfig {
        self.config
    }

    pub fn options(&self) -> SpadeOptions {
        self.options
    }

    pub fn norm(&self) -> &ParamFreeNorm {
        &self.norm
    }

    pub fn norm_mut(&mut self) -> &mut ParamFreeNorm {
        &mut self.norm
    }

    pub fn mlp_shared(&self) -> &Conv2d {
        &self.mlp_shared
    }

    pub fn mlp_shared_mut(&mut self) -> &mut Conv2d {
        &mut self.mlp_shared
    }

    pub fn mlp_gamma(&self) -> &Conv2d {
        &self.mlp_gamma
    }

    pub fn mlp_gamma_mut(&mut self) -> &mut Conv2d {
        &mut self.mlp_gamma
    }

    pub fn mlp_beta(&self) -> &Conv2d {
        &self.mlp_beta
    }

    pub fn mlp_beta_mut(&mut self) -> &mut Conv2d {
        &mut self.mlp_beta
    }

    pub fn pos_proj(&self) -> Option<&Conv2d> {
        self.pos_proj.as_ref()
    }

    pub fn pos_proj_mut(&mut self) -> Option<&mut Conv2d> {
        self.pos_proj.as_mut()
    }

    pub fn seg_noise(&self) -> Option<&Conv2d> {
        self.seg_noise.as_ref()
    }

    pub fn seg_noise_mut(&mut self) -> Option<&mut Conv2d> {
        self.seg_noise.as_mut()
    }

    pub fn noise_var(&self) -> Option<&Tensor> {
        self.noise_var.as_ref().map(|(var, _)| var)
    }

    pub fn noise_var_mut(&mut self) -> Option<&mut Tensor> {
        self.noise_var.as_mut().map(|(var, _)| var)
    }

    pub fn noise_var_grad(&self) -> Option<&Tensor> {
        self.noise_var.as_ref().map(|(_, grad)| grad)
    }

    pub fn positional(&self) -> &PositionalCache {
        &self.positional
    }

    fn convs_mut(&mut self) -> impl Iterator<Item = &mut Conv2d> {
        [&mut self.mlp_shared, &mut self.mlp_gamma, &mut self.mlp_beta]
            .into_iter()
            .chain(self.pos_proj.as_mut())
            .chain(self.seg_noise.as_mut())
    }

    pub fn set_training(&mut self, training: bool) {
        self.norm.set_training(training);
        self.convs_mut().for_each(|conv| conv.set_training(training));
    }

    pub fn zero_grad(&mut self) {
        self.convs_mut().for_each(Conv2d::zero_grad);
        if let Some((_, grad)) = self.noise_var.as_mut() {
            grad.set_zero();
        }
    }

    /// `x` is `[n, norm_nc, h, w]`, `segmap` is `[n, label_nc, H, W]` at any resolution.
    pub fn forward(&mut self, x: &Tensor, segmap: &Tensor) -> (Tensor, SpadeCache) {
        let (n, _, h, w) = x.shape().as_nchw();
        let sample =
            (self.options.noise != NoiseMode::None).then(|| Tensor::random(Shape::nchw(n, 1, h, w), 0.0, 1.0, true));
        self.forward_with_sample(x, segmap, sample)
    }

    fn forward_with_sample(&mut self, x: &Tensor, segmap: &Tensor, sample: Option<Tensor>) -> (Tensor, SpadeCache) {
        let (h, w) = x.shape().spatial();
        let seg = resize_nearest(segmap, (h, w));

        // parameter-free normalisation of the (possibly perturbed) activation
        let (perturbed, noise) = match (sample, self.seg_noise.as_mut(), self.noise_var.as_ref()) {
            (Some(sample), Some(conv), _) => {
                let (scale, scale_cache) = conv.forward(&seg);
                let perturbed = add_broadcast_noise(x, &sample, |b, ch, i| scale.plane(b, ch)[i]);
                (perturbed, NoiseCache::Segmentation { sample, scale: scale_cache })
            }
            (Some(sample), None, Some((var, _))) => {
                let perturbed = add_broadcast_noise(x, &sample, |_, ch, _| var.values()[ch]);
                (perturbed, NoiseCache::PerChannel { sample })
            }
            _ => (x.clone(), NoiseCache::None),
        };

        let (normalised, norm) = self.norm.forward(&perturbed);

        // shared embedding of the semantic map
        let (shared_pre, shared) = self.mlp_shared.forward(&seg);
        let mut actv = shared_pre.relu();

        let mut pos_proj = None;
        if self.options.use_pos {
            let (_, hidden, _, _) = actv.shape().as_nchw();
            let encoding = self.positional.get(hidden, h, w).clone();

            match self.pos_proj.as_mut() {
                Some(conv) => {
                    let (projected, cache) = conv.forward(&encoding);
                    add_to_batch(&mut actv, &projected);
                    pos_proj = Some(cache);
                }
                None => add_to_batch(&mut actv, &encoding),
            }
        }

        let (gamma, gamma_cache) = self.mlp_gamma.forward(&actv);
        let (beta, beta_cache) = self.mlp_beta.forward(&actv);

        let mut output = normalised.zip_map(&gamma, |n, g| n * (1.0 + g));
        output.add_scaled(1.0, &beta);

        let cache = SpadeCache { noise, norm, normalised, shared, shared_pre, pos_proj, gamma, gamma_cache, beta_cache };

        (output, cache)
    }

    /// Accumulates gradients of every learned parameter and returns the
    /// gradient with respect to the activation. The semantic map gets none.
    pub fn backward(&mut self, cache: &SpadeCache, output_grad: &Tensor) -> Tensor {
        let normalised_grad = output_grad.zip_map(&cache.gamma, |g, gamma| g * (1.0 + gamma));
        let gamma_grad = output_grad.zip_map(&cache.normalised, |g, n| g * n);

        let mut actv_grad = self.mlp_gamma.backward(&cache.gamma_cache, &gamma_grad);
        actv_grad.add_scaled(1.0, &self.mlp_beta.backward(&cache.beta_cache, output_grad));

        if let (Some(conv), Some(proj_cache)) = (self.pos_proj.as_mut(), cache.pos_proj.as_ref()) {
            conv.backward_params(proj_cache, &sum_over_batch(&actv_grad));
        }

        let mut shared_grad = Tensor::zeroed(cache.shared_pre.shape().clone());
        Tensor::relu_backward(&cache.shared_pre, &mut shared_grad, &actv_grad);
        self.mlp_shared.backward_params(&cache.shared, &shared_grad);

        let input_grad = self.norm.backward(&cache.norm, &normalised_grad);

        match &cache.noise {
            NoiseCache::None => {}
            NoiseCache::PerChannel { sample } => {
                if let Some((_, var_grad)) = self.noise_var.as_mut() {
                    let (n, c, _, _) = input_grad.shape().as_nchw();
                    for b in 0..n {
                        let noise = sample.plane(b, 0);
                        for ch in 0..c {
                            let g = input_grad.plane(b, ch).iter().zip(noise.iter()).map(|(g, s)| g * s).sum::<f32>();
                            var_grad.values_mut()[ch] += g;
                        }
                    }
                }
            }
            NoiseCache::Segmentation { sample, scale } => {
                if let Some(conv) = self.seg_noise.as_mut() {
                    let (n, c, _, _) = input_grad.shape().as_nchw();
                    let mut scale_grad = input_grad.clone();
                    for b in 0..n {
                        let noise = sample.plane(b, 0);
                        for ch in 0..c {
                            scale_grad.plane_mut(b, ch).iter_mut().zip(noise.iter()).for_each(|(g, &s)| *g *= s);
                        }
                    }
                    conv.backward_params(scale, &scale_grad);
                }
            }
        }

        input_grad
    }
}
