//! Numerical building blocks for conditional GAN training:
//! - [`spectral`]: spectral normalisation of layer weights by power iteration
//! - [`spade`]: spatially-adaptive modulation of normalised activations
//! - [`loss`]: adversarial, feature matching, perceptual and KL losses
//!
//! Every layer runs on the CPU and exposes a hand-written backward pass
//! alongside its forward pass.

pub mod error;
pub mod layers;
pub mod logger;
pub mod loss;
pub mod shape;
pub mod spade;
pub mod spectral;
pub mod tensor;

pub use error::{GanError, Result};
pub use layers::{Conv2d, NormKind, NormSpec, NormalisedConv, ParamFreeNorm};
pub use loss::{DiscriminatorOutput, GanLoss, GanMode, LossValue};
pub use shape::Shape;
pub use spade::{NoiseMode, Spade, SpadeConfig, SpadeOptions};
pub use spectral::{remove_spectral_norm, spectral_norm, SpectralNorm, SpectralNormConfig, Weight};
pub use tensor::Tensor;
