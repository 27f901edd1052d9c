use crate::{logger, shape::Shape, tensor::Tensor};

const MAX_PERIOD: f32 = 10000.0;

/// 1-d encoding of `positions` into `dim` channels: `dim / 2` sines followed
/// by `dim / 2` cosines of `pos / 10000^(i / (dim / 2))`.
fn sincos_1d(dim: usize, positions: usize) -> Vec<Vec<f32>> {
    let half = dim / 2;
    let omega = (0..half).map(|i| 1.0 / MAX_PERIOD.powf(i as f32 / half as f32)).collect::<Vec<_>>();

    let mut channels = vec![vec![0.0; positions]; dim];
    for (i, &w) in omega.iter().enumerate() {
        for pos in 0..positions {
            let angle = pos as f32 * w;
            channels[i][pos] = angle.sin();
            channels[half + i][pos] = angle.cos();
        }
    }

    channels
}

/// Fixed 2-d sinusoidal encoding of shape `[1, channels, height, width]`.
/// The first half of the channels encodes the column, the second half the row.
pub fn sincos_2d(channels: usize, height: usize, width: usize) -> Tensor {
    assert!(channels % 4 == 0, "Positional encoding needs a multiple of 4 channels, got {channels}!");

    let half = channels / 2;
    let cols = sincos_1d(half, width);
    let rows = sincos_1d(half, height);

    let mut encoding = Tensor::zeroed(Shape::nchw(1, channels, height, width));

    for (ch, col) in cols.iter().enumerate() {
        for plane_row in encoding.plane_mut(0, ch).chunks_exact_mut(width) {
            plane_row.copy_from_slice(col);
        }
    }

    for (ch, row) in rows.iter().enumerate() {
        for (plane_row, &val) in encoding.plane_mut(0, half + ch).chunks_exact_mut(width).zip(row.iter()) {
            plane_row.iter_mut().for_each(|x| *x = val);
        }
    }

    encoding
}

/// Built on first use and rebuilt only when the requested size changes.
#[derive(Clone, Debug, Default)]
pub struct PositionalCache {
    cached: Option<((usize, usize, usize), Tensor)>,
}

impl PositionalCache {
    pub fn get(&mut self, channels: usize, height: usize, width: usize) -> &Tensor {
        let key = (channels, height, width);

        let stale = self.cached.as_ref().map(|(old, _)| *old).filter(|old| *old != key);
        if let Some(old) = stale {
            logger::report_positional_rebuild(old, key);
            self.cached = None;
        }

        &self.cached.get_or_insert_with(|| (key, sincos_2d(channels, height, width))).1
    }

    pub fn size(&self) -> Option<(usize, usize, usize)> {
        self.cached.as_ref().map(|(key, _)| *key)
    }
}
