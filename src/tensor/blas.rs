#![allow(clippy::too_many_arguments)]

/// Row-major `c = alpha * op(a) * op(b) + beta * c`,
/// where `op(a)` is `m x n` and `op(b)` is `n x k`.
pub fn sgemm<const TA: bool, const TB: bool>(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) {
    assert_eq!(a.len(), m * n, "Invalid lhs size!");
    assert_eq!(b.len(), n * k, "Invalid rhs size!");
    assert_eq!(c.len(), m * k, "Invalid output size!");

    // forward optimisation
    if !TA && !TB && beta == 0.0 {
        return mm_nn(n, k, alpha, a, b, c);
    }

    for mi in 0..m {
        for ki in 0..k {
            let mut sum = 0.0;
            for ni in 0..n {
                let aidx = if TA { m * ni + mi } else { n * mi + ni };
                let bidx = if TB { n * ki + ni } else { k * ni + ki };
                sum += a[aidx] * b[bidx];
            }
            c[k * mi + ki] = alpha * sum + beta * c[k * mi + ki];
        }
    }
}

fn mm_nn(n: usize, k: usize, alpha: f32, a: &[f32], b: &[f32], c: &mut [f32]) {
    c.iter_mut().for_each(|x| *x = 0.0);

    for (row, out) in a.chunks_exact(n).zip(c.chunks_exact_mut(k)) {
        for (&ta, brow) in row.iter().zip(b.chunks_exact(k)) {
            if ta != 0.0 {
                for (o, &tb) in out.iter_mut().zip(brow.iter()) {
                    *o += ta * tb;
                }
            }
        }

        if alpha != 1.0 {
            out.iter_mut().for_each(|x| *x *= alpha);
        }
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// `mat * v` for a row-major `rows x cols` matrix.
pub fn matvec(mat: &[f32], rows: usize, cols: usize, v: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; rows];
    sgemm::<false, false>(rows, cols, 1, 1.0, mat, v, 0.0, &mut out);
    out
}

/// `mat^T * u` for a row-major `rows x cols` matrix.
pub fn matvec_transposed(mat: &[f32], rows: usize, cols: usize, u: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; cols];
    sgemm::<true, false>(cols, rows, 1, 1.0, mat, u, 0.0, &mut out);
    out
}

/// Row-major `u v^T`.
pub fn outer(u: &[f32], v: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; u.len() * v.len()];
    sgemm::<false, true>(u.len(), 1, v.len(), 1.0, u, v, 0.0, &mut out);
    out
}
