use super::Tensor;

fn backprop<F: Fn(f32) -> f32>(input: &Tensor, input_grad: &mut Tensor, output_grad: &Tensor, f: F) {
    assert_eq!(input.shape(), output_grad.shape());
    assert_eq!(input.shape(), input_grad.shape());

    for ((ig, &og), &i) in input_grad.values_mut().iter_mut().zip(output_grad.values().iter()).zip(input.values().iter())
    {
        *ig += f(i) * og;
    }
}

impl Tensor {
    pub fn relu(&self) -> Tensor {
        self.map(|x| x.max(0.0))
    }

    /// `input` is the pre-activation value.
    pub fn relu_backward(input: &Tensor, input_grad: &mut Tensor, output_grad: &Tensor) {
        backprop(input, input_grad, output_grad, |x| f32::from(x > 0.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn relu() {
        let shape = Shape::new(&[2, 2]);
        let input = Tensor::from_slice(shape.clone(), &[-1.0, 0.5, 2.0, -2.0]);

        let output = input.relu();
        assert_eq!(output.values(), &[0.0, 0.5, 2.0, 0.0]);

        let mut input_grad = Tensor::full(shape.clone(), 1.0);
        let output_grad = Tensor::from_slice(shape, &[1.0, 2.0, 3.0, 4.0]);
        Tensor::relu_backward(&input, &mut input_grad, &output_grad);
        assert_eq!(input_grad.values(), &[1.0, 3.0, 4.0, 1.0]);
    }
}
