use crate::{
    shape::Shape,
    spectral::{NormalisedWeight, Weight},
    tensor::{ConvolutionDescription, Tensor},
};

use super::{fan_in_bound, WeightedLayer};

/// 2-d convolution over NCHW tensors with filters `[out, in, k, k]`.
#[derive(Clone, Debug)]
pub struct Conv2d {
    weight: Weight,
    bias: Option<Tensor>,
    weight_grad: Tensor,
    bias_grad: Option<Tensor>,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    padding: usize,
    stride: usize,
    training: bool,
}

/// Everything the backward pass needs from a forward pass.
#[derive(Clone, Debug)]
pub struct ConvCache {
    desc: ConvolutionDescription,
    input: Tensor,
    filters: Tensor,
    normalised: Option<NormalisedWeight>,
}

impl ConvCache {
    pub fn input(&self) -> &Tensor {
        &self.input
    }
}

impl WeightedLayer for Conv2d {
    fn weight_slot(&mut self, name: &str) -> Option<&mut Weight> {
        (name == "weight").then_some(&mut self.weight)
    }
}

impl Conv2d {
    /// Stride 1 with `kernel / 2` padding.
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        let shape = Shape::new(&[out_channels, in_channels, kernel, kernel]);
        let bound = fan_in_bound(in_channels * kernel * kernel);

        Self {
            weight: Weight::Plain(Tensor::random(shape.clone(), 0.0, bound, false)),
            bias: Some(Tensor::random(Shape::new(&[out_channels]), 0.0, bound, false)),
            weight_grad: Tensor::zeroed(shape),
            bias_grad: Some(Tensor::zeroed(Shape::new(&[out_channels]))),
            in_channels,
            out_channels,
            kernel,
            padding: kernel / 2,
            stride: 1,
            training: true,
        }
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        assert!(stride > 0, "Cannot have stride 0!");
        self.stride = stride;
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self.bias_grad = None;
        self
    }

    /// Zero weight and bias, so the layer initially outputs zeros.
    pub fn zero_initialised(mut self) -> Self {
        self.weight.param_mut().set_zero();
        if let Some(bias) = self.bias.as_mut() {
            bias.set_zero();
        }
        self
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel(&self) -> usize {
        self.kernel
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

    pub fn bias_mut(&mut self) -> Option<&mut Tensor> {
        self.bias.as_mut()
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

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn describe(&self, input_shape: (usize, usize)) -> ConvolutionDescription {
        ConvolutionDescription::new(
            input_shape,
            self.in_channels,
            self.out_channels,
            (self.kernel, self.kernel),
            (self.padding, self.padding),
            (self.stride, self.stride),
        )
    }

    pub fn forward(&mut self, input: &Tensor) -> (Tensor, ConvCache) {
        let desc = self.describe(input.shape().spatial());
        let (filters, normalised) = self.weight.resolve(self.training);

        let output = Tensor::convolution_forward(&desc, &filters, self.bias.as_ref(), input);

        (output, ConvCache { desc, input: input.clone(), filters, normalised })
    }

    /// Accumulates parameter gradients and returns the input gradient.
    pub fn backward(&mut self, cache: &ConvCache, output_grad: &Tensor) -> Tensor {
        let mut input_grad = Tensor::zeroed(cache.input.shape().clone());
        self.backward_impl(cache, output_grad, Some(&mut input_grad));
        input_grad
    }

    /// Accumulates parameter gradients only.
    pub fn backward_params(&mut self, cache: &ConvCache, output_grad: &Tensor) {
        self.backward_impl(cache, output_grad, None);
    }

    fn backward_impl(&mut self, cache: &ConvCache, output_grad: &Tensor, input_grad: Option<&mut Tensor>) {
        let mut filters_grad = Tensor::zeroed(cache.filters.shape().clone());

        Tensor::convolution_backward(
            &cache.desc,
            &cache.filters,
            Some(&mut filters_grad),
            self.bias_grad.as_mut(),
            &cache.input,
            input_grad,
            output_grad,
        );

        let grad = self.weight.param_grad(cache.normalised.as_ref(), filters_grad);
        self.weight_grad.add_scaled(1.0, &grad);
    }
}
