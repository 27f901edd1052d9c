use std::{fmt::Display, str::FromStr};

use crate::{
    error::{GanError, Result},
    shape::Shape,
    spectral::{spectral_norm, SpectralNormConfig},
    tensor::Tensor,
};

use super::{Conv2d, ConvCache, NormCache, NormKind, ParamFreeNorm};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubNorm {
    None,
    Instance,
    Batch,
    SyncBatch,
}

/// Non-conditional normalisation following a convolution, written
/// `[spectral]<instance|batch|sync_batch|none>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NormSpec {
    pub spectral: bool,
    pub sub: SubNorm,
}

impl FromStr for NormSpec {
    type Err = GanError;

    fn from_str(s: &str) -> Result<Self> {
        let (spectral, rest) = match s.strip_prefix("spectral") {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let sub = match rest {
            "" | "none" => SubNorm::None,
            "instance" => SubNorm::Instance,
            "batch" => SubNorm::Batch,
            "sync_batch" => SubNorm::SyncBatch,
            _ => return Err(GanError::Configuration(format!("normalization layer `{rest}` is not recognized"))),
        };

        Ok(Self { spectral, sub })
    }
}

impl Display for NormSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sub = match self.sub {
            SubNorm::None => "none",
            SubNorm::Instance => "instance",
            SubNorm::Batch => "batch",
            SubNorm::SyncBatch => "sync_batch",
        };

        if self.spectral {
            write!(f, "spectral{sub}")
        } else {
            write!(f, "{sub}")
        }
    }
}

impl NormSpec {
    fn kind(&self) -> Option<NormKind> {
        match self.sub {
            SubNorm::None => None,
            SubNorm::Instance => Some(NormKind::Instance),
            SubNorm::Batch => Some(NormKind::Batch),
            SubNorm::SyncBatch => Some(NormKind::SyncBatch),
        }
    }
}

/// Per-channel learnable scale and shift.
#[derive(Clone, Debug)]
struct Affine {
    weight: Tensor,
    bias: Tensor,
    weight_grad: Tensor,
    bias_grad: Tensor,
}

impl Affine {
    fn new(channels: usize) -> Self {
        let shape = Shape::new(&[channels]);
        Self {
            weight: Tensor::full(shape.clone(), 1.0),
            bias: Tensor::zeroed(shape.clone()),
            weight_grad: Tensor::zeroed(shape.clone()),
            bias_grad: Tensor::zeroed(shape),
        }
    }

    fn forward(&self, input: &Tensor) -> Tensor {
        let (n, c, _, _) = input.shape().as_nchw();
        let mut output = input.clone();
        for b in 0..n {
            for ch in 0..c {
                let (w, bias) = (self.weight.values()[ch], self.bias.values()[ch]);
                output.plane_mut(b, ch).iter_mut().for_each(|x| *x = *x * w + bias);
            }
        }
        output
    }

    fn backward(&mut self, input: &Tensor, output_grad: &Tensor) -> Tensor {
        let (n, c, _, _) = input.shape().as_nchw();
        let mut input_grad = output_grad.clone();
        for b in 0..n {
            for ch in 0..c {
                let og = output_grad.plane(b, ch);
                self.weight_grad.values_mut()[ch] += og.iter().zip(input.plane(b, ch)).map(|(g, x)| g * x).sum::<f32>();
                self.bias_grad.values_mut()[ch] += og.iter().sum::<f32>();

                let w = self.weight.values()[ch];
                input_grad.plane_mut(b, ch).iter_mut().for_each(|g| *g *= w);
            }
        }
        input_grad
    }
}

/// A convolution followed by an optional non-conditional normalisation.
#[derive(Clone, Debug)]
pub struct NormalisedConv {
    conv: Conv2d,
    norm: Option<ParamFreeNorm>,
    affine: Option<Affine>,
}

#[derive(Clone, Debug)]
pub struct NormalisedConvCache {
    conv: ConvCache,
    norm: Option<(NormCache, Tensor)>,
}

impl NormalisedConv {
    /// Attaches spectral norm if requested. A following normalisation makes
    /// the conv bias redundant, so it is dropped.
    pub fn new(conv: Conv2d, spec: &NormSpec) -> Result<Self> {
        let mut conv = if spec.spectral { spectral_norm(conv, &SpectralNormConfig::default())? } else { conv };

        let Some(kind) = spec.kind() else {
            return Ok(Self { conv, norm: None, affine: None });
        };

        conv = conv.without_bias();
        let channels = conv.out_channels();
        let affine = (kind != NormKind::Instance).then(|| Affine::new(channels));

        Ok(Self { conv, norm: Some(ParamFreeNorm::new(kind, channels)), affine })
    }

    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    pub fn conv_mut(&mut self) -> &mut Conv2d {
        &mut self.conv
    }

    pub fn norm(&self) -> Option<&ParamFreeNorm> {
        self.norm.as_ref()
    }

    pub fn has_affine(&self) -> bool {
        self.affine.is_some()
    }

    pub fn set_training(&mut self, training: bool) {
        self.conv.set_training(training);
        if let Some(norm) = self.norm.as_mut() {
            norm.set_training(training);
        }
    }

    pub fn zero_grad(&mut self) {
        self.conv.zero_grad();
        if let Some(affine) = self.affine.as_mut() {
            affine.weight_grad.set_zero();
            affine.bias_grad.set_zero();
        }
    }

    pub fn forward(&mut self, input: &Tensor) -> (Tensor, NormalisedConvCache) {
        let (hidden, conv) = self.conv.forward(input);

        let Some(norm) = self.norm.as_mut() else {
            return (hidden, NormalisedConvCache { conv, norm: None });
        };

        let (normalised, norm_cache) = norm.forward(&hidden);
        let output = match self.affine.as_ref() {
            Some(affine) => affine.forward(&normalised),
            None => normalised.clone(),
        };

        (output, NormalisedConvCache { conv, norm: Some((norm_cache, normalised)) })
    }

    pub fn backward(&mut self, cache: &NormalisedConvCache, output_grad: &Tensor) -> Tensor {
        let hidden_grad = match (&cache.norm, self.norm.as_ref()) {
            (Some((norm_cache, normalised)), Some(norm)) => {
                let grad = match self.affine.as_mut() {
                    Some(affine) => affine.backward(normalised, output_grad),
                    None => output_grad.clone(),
                };
                norm.backward(norm_cache, &grad)
            }
            _ => output_grad.clone(),
        };

        self.conv.backward(&cache.conv, &hidden_grad)
    }
}
