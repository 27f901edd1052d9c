use crate::{
    error::{GanError, Result},
    tensor::Tensor,
};

use super::DiscriminatorOutput;

/// Layer weights of the VGG19 perceptual loss, shallow to deep.
pub const VGG_WEIGHTS: [f32; 5] = [1.0 / 32.0, 1.0 / 16.0, 1.0 / 8.0, 1.0 / 4.0, 1.0];

pub fn l1_loss(a: &Tensor, b: &Tensor) -> f32 {
    a.zip_map(b, |x, y| (x - y).abs()).mean()
}

/// Gradient of [`l1_loss`] with respect to `a`.
pub fn l1_gradient(a: &Tensor, b: &Tensor) -> Tensor {
    let scale = 1.0 / a.size() as f32;
    a.zip_map(b, |x, y| scale * (x - y).signum() * f32::from(x != y))
}

fn nested<'a>(output: &'a DiscriminatorOutput, which: &str) -> Result<&'a [Vec<Tensor>]> {
    match output {
        DiscriminatorOutput::NestedMultiScale(scales) => Ok(scales.as_slice()),
        _ => Err(GanError::InvalidArgument(format!("Feature matching needs intermediate features of the {which} output"))),
    }
}

fn paired<'a>(
    fake: &'a DiscriminatorOutput,
    real: &'a DiscriminatorOutput,
) -> Result<(&'a [Vec<Tensor>], &'a [Vec<Tensor>])> {
    let (fake, real) = (nested(fake, "fake")?, nested(real, "real")?);

    if fake.len() != real.len() || fake.iter().zip(real.iter()).any(|(f, r)| f.len() != r.len()) {
        return Err(GanError::InvalidArgument("Fake and real discriminator outputs differ in structure".to_string()));
    }

    Ok((fake, real))
}

/// Discriminator feature matching: per scale, the L1 distance between every
/// intermediate feature map of the fake and real passes (the final prediction
/// excluded), summed, then averaged over scales and scaled by `lambda_feat`.
pub fn feature_matching_loss(fake: &DiscriminatorOutput, real: &DiscriminatorOutput, lambda_feat: f32) -> Result<f32> {
    let (fake, real) = paired(fake, real)?;
    let num_d = fake.len() as f32;

    let mut total = 0.0;
    for (f, r) in fake.iter().zip(real.iter()) {
        let intermediate = f.len().saturating_sub(1);
        for (ff, rf) in f.iter().zip(r.iter()).take(intermediate) {
            total += l1_loss(ff, rf) * lambda_feat / num_d;
        }
    }

    Ok(total)
}

/// Gradient of [`feature_matching_loss`] with respect to the fake features,
/// shaped like `fake`. Real features are constants.
pub fn feature_matching_gradient(
    fake: &DiscriminatorOutput,
    real: &DiscriminatorOutput,
    lambda_feat: f32,
) -> Result<DiscriminatorOutput> {
    let (fake, real) = paired(fake, real)?;
    let num_d = fake.len() as f32;

    let mut grads = Vec::with_capacity(fake.len());
    for (f, r) in fake.iter().zip(real.iter()) {
        let intermediate = f.len().saturating_sub(1);
        let scale = f
            .iter()
            .zip(r.iter())
            .enumerate()
            .map(|(i, (ff, rf))| {
                if i < intermediate {
                    l1_gradient(ff, rf).map(|g| g * lambda_feat / num_d)
                } else {
                    Tensor::zeroed(ff.shape().clone())
                }
            })
            .collect();
        grads.push(scale);
    }

    Ok(DiscriminatorOutput::NestedMultiScale(grads))
}

/// Produces the feature maps compared by [`PerceptualLoss`], e.g. the
/// activations of a fixed, pretrained classification network.
pub trait FeatureExtractor {
    fn features(&mut self, image: &Tensor) -> Vec<Tensor>;
}

/// Weighted L1 distance between the features of two images.
#[derive(Clone, Debug)]
pub struct PerceptualLoss<F: FeatureExtractor> {
    extractor: F,
    weights: Vec<f32>,
}

impl<F: FeatureExtractor> PerceptualLoss<F> {
    pub fn new(extractor: F) -> Self {
        Self { extractor, weights: VGG_WEIGHTS.to_vec() }
    }

    pub fn with_weights(mut self, weights: &[f32]) -> Self {
        self.weights = weights.to_vec();
        self
    }

    pub fn extractor(&self) -> &F {
        &self.extractor
    }

    /// `target` features are treated as constants.
    pub fn loss(&mut self, image: &Tensor, target: &Tensor) -> Result<f32> {
        let image_features = self.extractor.features(image);
        let target_features = self.extractor.features(target);

        if image_features.len() != self.weights.len() || target_features.len() != self.weights.len() {
            return Err(GanError::InvalidArgument(format!(
                "Expected {} feature maps, got {} and {}",
                self.weights.len(),
                image_features.len(),
                target_features.len()
            )));
        }

        let mut total = 0.0;
        for ((weight, x), y) in self.weights.iter().zip(image_features.iter()).zip(target_features.iter()) {
            total += weight * l1_loss(x, y);
        }

        Ok(total)
    }
}
