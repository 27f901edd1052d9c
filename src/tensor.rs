mod activate;
mod blas;
mod conv;
mod interpolate;
mod rng;

pub use blas::{dot, matvec, matvec_transposed, outer, sgemm};
pub use conv::ConvolutionDescription;
pub use interpolate::resize_nearest;

use crate::shape::Shape;

/// Dense row-major `f32` tensor living on the CPU.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Shape,
    values: Vec<f32>,
}

impl Tensor {
    pub fn zeroed(shape: Shape) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: Shape, val: f32) -> Self {
        let values = vec![val; shape.size()];
        Self { shape, values }
    }

    pub fn from_slice(shape: Shape, values: &[f32]) -> Self {
        Self::from_vec(shape, values.to_vec())
    }

    pub fn from_vec(shape: Shape, values: Vec<f32>) -> Self {
        assert_eq!(shape.size(), values.len(), "Cannot load {} values into {shape}!", values.len());
        Self { shape, values }
    }

    pub fn random(shape: Shape, mean: f32, stdev: f32, use_gaussian: bool) -> Self {
        let values = rng::vec_f32(shape.size(), mean, stdev, use_gaussian);
        Self { shape, values }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Self {
        Self { shape: self.shape.clone(), values: self.values.iter().map(|&x| f(x)).collect() }
    }

    pub fn zip_map<F: Fn(f32, f32) -> f32>(&self, other: &Self, f: F) -> Self {
        assert_eq!(self.shape, other.shape, "Mismatched shapes {} and {}!", self.shape, other.shape);
        let values = self.values.iter().zip(other.values.iter()).map(|(&a, &b)| f(a, b)).collect();
        Self { shape: self.shape.clone(), values }
    }

    /// Accumulates `alpha * other` into `self`, as gradients are accumulated.
    pub fn add_scaled(&mut self, alpha: f32, other: &Self) {
        assert_eq!(self.shape, other.shape, "Mismatched shapes {} and {}!", self.shape, other.shape);
        for (o, &i) in self.values.iter_mut().zip(other.values.iter()) {
            *o += alpha * i;
        }
    }

    pub fn set_zero(&mut self) {
        self.values.iter_mut().for_each(|x| *x = 0.0);
    }

    pub fn sum(&self) -> f32 {
        self.values.iter().sum()
    }

    pub fn mean(&self) -> f32 {
        self.sum() / self.size() as f32
    }

    /// Mean over every non-batch dimension, one value per batch item.
    pub fn batch_means(&self) -> Vec<f32> {
        let per_item = self.size() / self.shape.batch_size();
        self.values.chunks_exact(per_item).map(|item| item.iter().sum::<f32>() / per_item as f32).collect()
    }

    /// Contiguous `h x w` plane of an NCHW tensor.
    pub fn plane(&self, n: usize, c: usize) -> &[f32] {
        let (_, channels, h, w) = self.shape.as_nchw();
        let start = (n * channels + c) * h * w;
        &self.values[start..start + h * w]
    }

    pub fn plane_mut(&mut self, n: usize, c: usize) -> &mut [f32] {
        let (_, channels, h, w) = self.shape.as_nchw();
        let start = (n * channels + c) * h * w;
        &mut self.values[start..start + h * w]
    }

    /// Permutes `axis` to the front, keeping the relative order of the other axes.
    pub fn move_axis_to_front(&self, axis: usize) -> Self {
        if axis == 0 {
            return self.clone();
        }

        let dims = self.shape.dims();
        let len = dims[axis];
        let outer = dims[..axis].iter().product::<usize>();
        let inner = dims[axis + 1..].iter().product::<usize>();

        let mut values = Vec::with_capacity(self.size());
        for a in 0..len {
            for o in 0..outer {
                let base = (o * len + a) * inner;
                values.extend_from_slice(&self.values[base..base + inner]);
            }
        }

        Self { shape: self.shape.with_axis_first(axis), values }
    }

    /// Inverse of [`Tensor::move_axis_to_front`].
    pub fn move_front_axis_to(&self, axis: usize) -> Self {
        if axis == 0 {
            return self.clone();
        }

        let dims = self.shape.dims();
        let len = dims[0];
        let mut out_dims = dims[1..].to_vec();
        out_dims.insert(axis, len);
        let outer = out_dims[..axis].iter().product::<usize>();
        let inner = out_dims[axis + 1..].iter().product::<usize>();

        let mut values = vec![0.0; self.size()];
        for a in 0..len {
            for o in 0..outer {
                let src = (a * outer + o) * inner;
                let dst = (o * len + a) * inner;
                values[dst..dst + inner].copy_from_slice(&self.values[src..src + inner]);
            }
        }

        Self { shape: Shape::new(&out_dims), values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_permutation_round_trips() {
        let shape = Shape::new(&[2, 3, 4]);
        let tensor = Tensor::from_vec(shape.clone(), (0..24).map(|x| x as f32).collect());

        let permuted = tensor.move_axis_to_front(1);
        assert_eq!(permuted.shape(), &Shape::new(&[3, 2, 4]));
        // element [0][1][2] of the source is [1][0][2] of the permuted tensor
        assert_eq!(permuted.values()[4 * 2 + 2], tensor.values()[4 + 2]);
        assert_eq!(permuted.move_front_axis_to(1), tensor);
    }

    #[test]
    fn batch_means() {
        let tensor = Tensor::from_slice(Shape::nchw(2, 1, 1, 2), &[1.0, 3.0, -2.0, 6.0]);
        assert_eq!(tensor.batch_means(), vec![2.0, 2.0]);
        assert_eq!(tensor.mean(), 2.0);
    }

    #[test]
    fn planes() {
        let mut tensor = Tensor::zeroed(Shape::nchw(2, 3, 2, 2));
        tensor.plane_mut(1, 2).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(tensor.plane(1, 2), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(tensor.sum(), 10.0);
    }

    #[test]
    #[should_panic]
    fn mismatched_zip() {
        let a = Tensor::zeroed(Shape::new(&[2, 2]));
        let b = Tensor::zeroed(Shape::new(&[4]));
        a.zip_map(&b, |x, y| x + y);
    }
}
