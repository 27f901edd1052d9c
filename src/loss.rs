//! Adversarial losses and the auxiliary generator losses trained alongside them.

mod feature;
mod gan;
mod kld;

pub use feature::{
    feature_matching_gradient, feature_matching_loss, l1_gradient, l1_loss, FeatureExtractor, PerceptualLoss,
    VGG_WEIGHTS,
};
pub use gan::{DiscriminatorOutput, GanLoss, GanMode, LossValue};
pub use kld::{kld_backward, kld_loss};
