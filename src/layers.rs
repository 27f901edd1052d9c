mod conv;
mod linear;
mod norm;
mod norm_layer;

pub use conv::{Conv2d, ConvCache};
pub use linear::{Linear, LinearCache};
pub use norm::{LocalReducer, NormCache, NormKind, ParamFreeNorm, StatReducer, NORM_EPS};
pub use norm_layer::{NormSpec, NormalisedConv, NormalisedConvCache, SubNorm};

use crate::spectral::Weight;

/// A layer exposing named learnable weights, so that a spectral norm
/// estimator can be attached to one of them.
pub trait WeightedLayer {
    fn weight_slot(&mut self, name: &str) -> Option<&mut Weight>;

    /// Axis of the weight holding output channels.
    fn output_axis(&self) -> usize {
        0
    }
}

/// Default `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` initialisation.
fn fan_in_bound(fan_in: usize) -> f32 {
    1.0 / (fan_in as f32).sqrt()
}
