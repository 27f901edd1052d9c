use crate::{
    shape::Shape,
    spectral::{NormalisedWeight, Weight},
    tensor::{sgemm, Tensor},
};

use super::{fan_in_bound, WeightedLayer};

/// Affine layer `y = x W^T + b` with `W` stored `[out, in]`, inputs `[batch, in]`.
#[derive(Clone, Debug)]
pub struct Linear {
    weight: Weight,
    bias: Option<Tensor>,
    weight_grad: Tensor,
    bias_grad: Option<Tensor>,
    inputs: usize,
    outputs: usize,
    training: bool,
}

#[derive(Clone, Debug)]
pub struct LinearCache {
    input: Tensor,
    weight: Tensor,
    normalised: Option<NormalisedWeight>,
}

impl WeightedLayer for Linear {
    fn weight_slot(&mut self, name: &str) -> Option<&mut Weight> {
        (name == "weight").then_some(&mut self.weight)
    }
}

impl Linear {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        let shape = Shape::new(&[outputs, inputs]);
        let bound = fan_in_bound(inputs);

        Self {
            weight: Weight::Plain(Tensor::random(shape.clone(), 0.0, bound, false)),
            bias: Some(Tensor::random(Shape::new(&[outputs]), 0.0, bound, false)),
            weight_grad: Tensor::zeroed(shape),
            bias_grad: Some(Tensor::zeroed(Shape::new(&[outputs]))),
            inputs,
            outputs,
            training: true,
        }
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self.bias_grad = None;
        self
    }

    pub fn weight(&self) -> &Weight {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut Weight {
        &mut self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn weight_grad(&self) -> &Tensor {
        &self.weight_grad
    }

    pub fn bias_grad(&self) -> Option<&Tensor> {
        self.bias_grad.as_ref()
    }

    pub fn zero_grad(&mut self) {
        self.weight_grad.set_zero();
        if let Some(grad) = self.bias_grad.as_mut() {
            grad.set_zero();
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward(&mut self, input: &Tensor) -> (Tensor, LinearCache) {
        let batch_size = input.shape().batch_size();
        assert_eq!(input.size(), batch_size * self.inputs, "Expected {} inputs, got {}!", self.inputs, input.shape());

        let (weight, normalised) = self.weight.resolve(self.training);

        let mut output = Tensor::zeroed(Shape::new(&[batch_size, self.outputs]));
        sgemm::<false, true>(
            batch_size,
            self.inputs,
            self.outputs,
            1.0,
            input.values(),
            weight.values(),
            0.0,
            output.values_mut(),
        );

        if let Some(bias) = self.bias.as_ref() {
            for row in output.values_mut().chunks_exact_mut(self.outputs) {
                row.iter_mut().zip(bias.values().iter()).for_each(|(o, &b)| *o += b);
            }
        }

        (output, LinearCache { input: input.clone(), weight, normalised })
    }

    pub fn backward(&mut self, cache: &LinearCache, output_grad: &Tensor) -> Tensor {
        let batch_size = cache.input.shape().batch_size();
        assert_eq!(output_grad.shape(), &Shape::new(&[batch_size, self.outputs]));

        let mut weight_grad = Tensor::zeroed(cache.weight.shape().clone());
        sgemm::<true, false>(
            self.outputs,
            batch_size,
            self.inputs,
            1.0,
            output_grad.values(),
            cache.input.values(),
            0.0,
            weight_grad.values_mut(),
        );

        let grad = self.weight.param_grad(cache.normalised.as_ref(), weight_grad);
        self.weight_grad.add_scaled(1.0, &grad);

        if let Some(bias_grad) = self.bias_grad.as_mut() {
            for row in output_grad.values().chunks_exact(self.outputs) {
                bias_grad.values_mut().iter_mut().zip(row.iter()).for_each(|(g, &o)| *g += o);
            }
        }

        let mut input_grad = Tensor::zeroed(cache.input.shape().clone());
        sgemm::<false, false>(
            batch_size,
            self.outputs,
            self.inputs,
            1.0,
            output_grad.values(),
            cache.weight.values(),
            0.0,
            input_grad.values_mut(),
        );

        input_grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values() {
        let mut layer = Linear::new(3, 2);
        *layer.weight_mut().param_mut() = Tensor::from_slice(Shape::new(&[2, 3]), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        layer.bias = Some(Tensor::from_slice(Shape::new(&[2]), &[0.5, -0.5]));

        let input = Tensor::from_slice(Shape::new(&[2, 3]), &[1.0, 0.0, -1.0, 1.0, 1.0, 1.0]);
        let (output, cache) = layer.forward(&input);
        assert_eq!(output.values(), &[-1.5, -2.5, 6.5, 14.5]);

        let output_grad = Tensor::from_slice(Shape::new(&[2, 2]), &[1.0, 0.0, 0.0, 1.0]);
        let input_grad = layer.backward(&cache, &output_grad);

        assert_eq!(input_grad.values(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(layer.weight_grad().values(), &[1.0, 0.0, -1.0, 1.0, 1.0, 1.0]);
        assert_eq!(layer.bias_grad().unwrap().values(), &[1.0, 1.0]);
    }
}
