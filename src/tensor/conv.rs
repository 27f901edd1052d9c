use crate::shape::Shape;

use super::{sgemm, Tensor};

/// Geometry of a 2-d convolution over NCHW tensors, filters are `[out, in, fh, fw]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvolutionDescription {
    pub input_shape: (usize, usize),
    pub input_channels: usize,
    pub output_shape: (usize, usize),
    pub output_channels: usize,
    pub filter_shape: (usize, usize),
    /// Can be (0, 0)
    pub padding_shape: (usize, usize),
    pub stride_shape: (usize, usize),
}

impl ConvolutionDescription {
    pub fn new(
        input_shape: (usize, usize),
        input_channels: usize,
        output_channels: usize,
        filter_shape: (usize, usize),
        padding_shape: (usize, usize),
        stride_shape: (usize, usize),
    ) -> Self {
        assert!(stride_shape.0 > 0 && stride_shape.1 > 0, "Cannot have stride 0!");
        assert!(input_shape.0 + 2 * padding_shape.0 >= filter_shape.0, "Filter taller than padded input!");
        assert!(input_shape.1 + 2 * padding_shape.1 >= filter_shape.1, "Filter wider than padded input!");

        let hout = (input_shape.0 + 2 * padding_shape.0 - filter_shape.0) / stride_shape.0 + 1;
        let wout = (input_shape.1 + 2 * padding_shape.1 - filter_shape.1) / stride_shape.1 + 1;

        Self {
            input_shape,
            input_channels,
            output_shape: (hout, wout),
            output_channels,
            filter_shape,
            padding_shape,
            stride_shape,
        }
    }

    pub fn filter_tensor_shape(&self) -> Shape {
        Shape::new(&[self.output_channels, self.input_channels, self.filter_shape.0, self.filter_shape.1])
    }

    fn patch_size(&self) -> usize {
        self.input_channels * self.filter_shape.0 * self.filter_shape.1
    }

    fn output_pixels(&self) -> usize {
        self.output_shape.0 * self.output_shape.1
    }

    /// Calls `f(row, col, input_idx)` for every in-bounds tap of the unrolled input.
    fn for_each_tap<F: FnMut(usize, usize, usize)>(&self, mut f: F) {
        let (ih, iw) = self.input_shape;
        let (fh, fw) = self.filter_shape;
        let (oh, ow) = self.output_shape;
        let (ph, pw) = self.padding_shape;
        let (sh, sw) = self.stride_shape;

        for c in 0..self.input_channels {
            for ky in 0..fh {
                for kx in 0..fw {
                    let row = (c * fh + ky) * fw + kx;
                    for oy in 0..oh {
                        let iy = (oy * sh + ky) as isize - ph as isize;
                        if iy < 0 || iy >= ih as isize {
                            continue;
                        }

                        for ox in 0..ow {
                            let ix = (ox * sw + kx) as isize - pw as isize;
                            if ix < 0 || ix >= iw as isize {
                                continue;
                            }

                            let input_idx = (c * ih + iy as usize) * iw + ix as usize;
                            f(row, oy * ow + ox, input_idx);
                        }
                    }
                }
            }
        }
    }

    fn im2col(&self, input: &[f32]) -> Vec<f32> {
        let cols = self.output_pixels();
        let mut out = vec![0.0; self.patch_size() * cols];
        self.for_each_tap(|row, col, idx| out[row * cols + col] = input[idx]);
        out
    }

    fn col2im_add(&self, unrolled: &[f32], output: &mut [f32]) {
        let cols = self.output_pixels();
        self.for_each_tap(|row, col, idx| output[idx] += unrolled[row * cols + col]);
    }
}

impl Tensor {
    pub fn convolution_forward(
        desc: &ConvolutionDescription,
        filters: &Tensor,
        bias: Option<&Tensor>,
        input: &Tensor,
    ) -> Tensor {
        let (n, c, h, w) = input.shape().as_nchw();
        assert_eq!(filters.shape(), &desc.filter_tensor_shape());
        assert_eq!(c, desc.input_channels, "Expected {} input channels, got {c}!", desc.input_channels);
        assert_eq!((h, w), desc.input_shape, "Input {} does not match {desc:?}!", input.shape());

        let (oh, ow) = desc.output_shape;
        let pixels = desc.output_pixels();
        let single_in = c * h * w;
        let single_out = desc.output_channels * pixels;

        let mut output = Tensor::zeroed(Shape::nchw(n, desc.output_channels, oh, ow));

        for (inp, out) in input.values().chunks_exact(single_in).zip(output.values_mut().chunks_exact_mut(single_out)) {
            let unrolled = desc.im2col(inp);
            sgemm::<false, false>(
                desc.output_channels,
                desc.patch_size(),
                pixels,
                1.0,
                filters.values(),
                &unrolled,
                0.0,
                out,
            );

            if let Some(bias) = bias {
                for (plane, &b) in out.chunks_exact_mut(pixels).zip(bias.values().iter()) {
                    plane.iter_mut().for_each(|x| *x += b);
                }
            }
        }

        output
    }

    /// Accumulates into whichever gradients are provided.
    pub fn convolution_backward(
        desc: &ConvolutionDescription,
        filters: &Tensor,
        filters_grad: Option<&mut Tensor>,
        bias_grad: Option<&mut Tensor>,
        input: &Tensor,
        input_grad: Option<&mut Tensor>,
        output_grad: &Tensor,
    ) {
        let (n, c, h, w) = input.shape().as_nchw();
        let (oh, ow) = desc.output_shape;
        assert_eq!(output_grad.shape(), &Shape::nchw(n, desc.output_channels, oh, ow));
        assert_eq!(filters.shape(), &desc.filter_tensor_shape());

        let pixels = desc.output_pixels();
        let single_in = c * h * w;
        let single_out = desc.output_channels * pixels;

        let inputs = input.values().chunks_exact(single_in);
        let grads = output_grad.values().chunks_exact(single_out);

        if let Some(grad) = filters_grad {
            assert_eq!(grad.shape(), filters.shape());
            for (inp, grd) in inputs.clone().zip(grads.clone()) {
                let unrolled = desc.im2col(inp);
                sgemm::<false, true>(
                    desc.output_channels,
                    pixels,
                    desc.patch_size(),
                    1.0,
                    grd,
                    &unrolled,
                    1.0,
                    grad.values_mut(),
                );
            }
        }

        if let Some(grad) = bias_grad {
            assert_eq!(grad.size(), desc.output_channels);
            for grd in grads.clone() {
                for (b, plane) in grad.values_mut().iter_mut().zip(grd.chunks_exact(pixels)) {
                    *b += plane.iter().sum::<f32>();
                }
            }
        }

        if let Some(grad) = input_grad {
            assert_eq!(grad.shape(), input.shape());
            let mut unrolled = vec![0.0; desc.patch_size() * pixels];
            for (out, grd) in grad.values_mut().chunks_exact_mut(single_in).zip(grads) {
                sgemm::<true, false>(
                    desc.patch_size(),
                    desc.output_channels,
                    pixels,
                    1.0,
                    filters.values(),
                    grd,
                    0.0,
                    &mut unrolled,
                );
                desc.col2im_add(&unrolled, out);
            }
        }
    }
}
