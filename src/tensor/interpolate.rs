use crate::shape::Shape;

use super::Tensor;

/// Nearest-neighbour resize of an NCHW tensor, source index `floor(dst * in / out)`.
pub fn resize_nearest(input: &Tensor, size: (usize, usize)) -> Tensor {
    let (n, c, ih, iw) = input.shape().as_nchw();
    let (oh, ow) = size;

    if (ih, iw) == (oh, ow) {
        return input.clone();
    }

    let rows = (0..oh).map(|y| y * ih / oh).collect::<Vec<_>>();
    let cols = (0..ow).map(|x| x * iw / ow).collect::<Vec<_>>();

    let mut output = Tensor::zeroed(Shape::nchw(n, c, oh, ow));
    for b in 0..n {
        for ch in 0..c {
            let src = input.plane(b, ch).to_vec();
            let dst = output.plane_mut(b, ch);
            for (y, &sy) in rows.iter().enumerate() {
                for (x, &sx) in cols.iter().enumerate() {
                    dst[y * ow + x] = src[sy * iw + sx];
                }
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    #[test]
    fn upsample_2x() {
        let input = Tensor::from_slice(Shape::nchw(1, 1, 2, 2), &[1.0, 2.0, 3.0, 4.0]);
        let output = resize_nearest(&input, (4, 4));
        assert_eq!(
            output.values(),
            &[
                1.0, 1.0, 2.0, 2.0,
                1.0, 1.0, 2.0, 2.0,
                3.0, 3.0, 4.0, 4.0,
                3.0, 3.0, 4.0, 4.0,
            ],
        );
    }

    #[test]
    fn downsample_picks_top_left() {
        let input = Tensor::from_vec(Shape::nchw(1, 2, 4, 4), (0..32).map(|x| x as f32).collect());
        let output = resize_nearest(&input, (2, 2));
        assert_eq!(output.values(), &[0.0, 2.0, 8.0, 10.0, 16.0, 18.0, 24.0, 26.0]);
    }

    #[test]
    fn non_integer_ratio() {
        let input = Tensor::from_vec(Shape::nchw(1, 1, 1, 3), vec![1.0, 2.0, 3.0]);
        let output = resize_nearest(&input, (2, 7));
        assert_eq!(output.shape(), &Shape::nchw(1, 1, 2, 7));
        assert_eq!(&output.values()[..7], &[1.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
    }
}
