use std::{fmt::Debug, sync::Arc};

use crate::tensor::Tensor;

pub const NORM_EPS: f32 = 1e-5;
const MOMENTUM: f32 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormKind {
    Instance,
    Batch,
    SyncBatch,
}

/// Elementwise sum of a statistics buffer across data-parallel replicas.
pub trait StatReducer: Debug + Send + Sync {
    fn all_reduce(&self, values: &mut [f32]);
}

/// Single replica, nothing to reduce.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalReducer;

impl StatReducer for LocalReducer {
    fn all_reduce(&self, _: &mut [f32]) {}
}

/// Zero-mean, unit-variance normalisation without learnable affine.
#[derive(Clone, Debug)]
pub struct ParamFreeNorm {
    kind: NormKind,
    channels: usize,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
    eps: f32,
    training: bool,
    reducer: Arc<dyn StatReducer>,
}

#[derive(Clone, Debug)]
pub struct NormCache {
    normalised: Tensor,
    /// Per plane for instance norm, per channel otherwise.
    inv_std: Vec<f32>,
    batch_stats: bool,
}

impl ParamFreeNorm {
    pub fn new(kind: NormKind, channels: usize) -> Self {
        Self {
            kind,
            channels,
            running_mean: vec![0.0; channels],
            running_var: vec![1.0; channels],
            eps: NORM_EPS,
            training: true,
            reducer: Arc::new(LocalReducer),
        }
    }

    /// Only consulted by [`NormKind::SyncBatch`].
    pub fn with_reducer(mut self, reducer: Arc<dyn StatReducer>) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn kind(&self) -> NormKind {
        self.kind
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn running_mean(&self) -> &[f32] {
        &self.running_mean
    }

    pub fn running_var(&self) -> &[f32] {
        &self.running_var
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn reduce(&self, values: &mut [f32]) {
        if self.kind == NormKind::SyncBatch {
            self.reducer.all_reduce(values);
        }
    }

    pub fn forward(&mut self, input: &Tensor) -> (Tensor, NormCache) {
        let (n, c, _, _) = input.shape().as_nchw();
        assert_eq!(c, self.channels, "Expected {} channels, got {}!", self.channels, input.shape());

        let mut output = Tensor::zeroed(input.shape().clone());

        if self.kind == NormKind::Instance {
            let mut inv_std = Vec::with_capacity(n * c);

            for b in 0..n {
                for ch in 0..c {
                    let plane = input.plane(b, ch);
                    let count = plane.len() as f32;
                    let mean = plane.iter().sum::<f32>() / count;
                    let var = plane.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / count;
                    let istd = 1.0 / (var + self.eps).sqrt();

                    for (o, &x) in output.plane_mut(b, ch).iter_mut().zip(plane.iter()) {
                        *o = (x - mean) * istd;
                    }

                    inv_std.push(istd);
                }
            }

            return (output.clone(), NormCache { normalised: output, inv_std, batch_stats: true });
        }

        let (mean, var) = if self.training {
            let (mean, var, count) = self.batch_moments(input);

            let unbias = if count > 1.0 { count / (count - 1.0) } else { 1.0 };
            for ch in 0..c {
                self.running_mean[ch] = (1.0 - MOMENTUM) * self.running_mean[ch] + MOMENTUM * mean[ch];
                self.running_var[ch] = (1.0 - MOMENTUM) * self.running_var[ch] + MOMENTUM * var[ch] * unbias;
            }

            (mean, var)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };

        let inv_std = var.iter().map(|v| 1.0 / (v + self.eps).sqrt()).collect::<Vec<_>>();

        for b in 0..n {
            for ch in 0..c {
                let plane = input.plane(b, ch);
                for (o, &x) in output.plane_mut(b, ch).iter_mut().zip(plane.iter()) {
                    *o = (x - mean[ch]) * inv_std[ch];
                }
            }
        }

        (output.clone(), NormCache { normalised: output, inv_std, batch_stats: self.training })
    }

    /// Per-channel biased mean and variance, with the element count.
    fn batch_moments(&self, input: &Tensor) -> (Vec<f32>, Vec<f32>, f32) {
        let (n, c, h, w) = input.shape().as_nchw();

        let mut stats = vec![0.0; 2 * c + 1];
        for b in 0..n {
            for ch in 0..c {
                let plane = input.plane(b, ch);
                stats[ch] += plane.iter().sum::<f32>();
                stats[c + ch] += plane.iter().map(|x| x * x).sum::<f32>();
            }
        }
        stats[2 * c] = (n * h * w) as f32;

        self.reduce(&mut stats);

        let count = stats[2 * c];
        let mean = stats[..c].iter().map(|s| s / count).collect::<Vec<_>>();
        let var = stats[c..2 * c].iter().zip(mean.iter()).map(|(sq, m)| (sq / count - m * m).max(0.0)).collect();

        (mean, var, count)
    }

    pub fn backward(&self, cache: &NormCache, output_grad: &Tensor) -> Tensor {
        let (n, c, _, _) = output_grad.shape().as_nchw();
        assert_eq!(output_grad.shape(), cache.normalised.shape());

        let mut input_grad = Tensor::zeroed(output_grad.shape().clone());

        if !cache.batch_stats {
            for b in 0..n {
                for ch in 0..c {
                    let istd = cache.inv_std[ch];
                    for (ig, &og) in input_grad.plane_mut(b, ch).iter_mut().zip(output_grad.plane(b, ch).iter()) {
                        *ig = og * istd;
                    }
                }
            }

            return input_grad;
        }

        // dx = istd * (dy - mean(dy) - xhat * mean(dy * xhat)) over each statistics group
        let apply = |input_grad: &mut Tensor, b: usize, ch: usize, istd: f32, mean_dy: f32, mean_dyx: f32| {
            let xhat = cache.normalised.plane(b, ch);
            let dy = output_grad.plane(b, ch);
            for ((ig, &og), &x) in input_grad.plane_mut(b, ch).iter_mut().zip(dy.iter()).zip(xhat.iter()) {
                *ig = istd * (og - mean_dy - x * mean_dyx);
            }
        };

        if self.kind == NormKind::Instance {
            for b in 0..n {
                for ch in 0..c {
                    let dy = output_grad.plane(b, ch);
                    let xhat = cache.normalised.plane(b, ch);
                    let count = dy.len() as f32;
                    let mean_dy = dy.iter().sum::<f32>() / count;
                    let mean_dyx = dy.iter().zip(xhat.iter()).map(|(g, x)| g * x).sum::<f32>() / count;
                    apply(&mut input_grad, b, ch, cache.inv_std[b * c + ch], mean_dy, mean_dyx);
                }
            }

            return input_grad;
        }

        let mut stats = vec![0.0; 2 * c + 1];
        for b in 0..n {
            for ch in 0..c {
                let dy = output_grad.plane(b, ch);
                let xhat = cache.normalised.plane(b, ch);
                stats[ch] += dy.iter().sum::<f32>();
                stats[c + ch] += dy.iter().zip(xhat.iter()).map(|(g, x)| g * x).sum::<f32>();
            }
        }
        stats[2 * c] = (output_grad.size() / c) as f32;

        self.reduce(&mut stats);
        let count = stats[2 * c];

        for b in 0..n {
            for ch in 0..c {
                apply(&mut input_grad, b, ch, cache.inv_std[ch], stats[ch] / count, stats[c + ch] / count);
            }
        }

        input_grad
    }
}
