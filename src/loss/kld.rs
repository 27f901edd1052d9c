use crate::tensor::Tensor;

/// KL divergence of `N(mu, exp(logvar))` from the standard normal,
/// `-0.5 * sum(1 + logvar - mu^2 - exp(logvar))`.
pub fn kld_loss(mu: &Tensor, logvar: &Tensor) -> f32 {
    -0.5 * mu.zip_map(logvar, |m, lv| 1.0 + lv - m * m - lv.exp()).sum()
}

/// Gradients of [`kld_loss`] with respect to `mu` and `logvar`.
pub fn kld_backward(mu: &Tensor, logvar: &Tensor) -> (Tensor, Tensor) {
    let mu_grad = mu.clone();
    let logvar_grad = logvar.map(|lv| 0.5 * (lv.exp() - 1.0));
    (mu_grad, logvar_grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn standard_normal_is_zero() {
        let zeros = Tensor::zeroed(Shape::new(&[2, 8]));
        assert_eq!(kld_loss(&zeros, &zeros), 0.0);
    }

    #[test]
    fn known_value() {
        let mu = Tensor::from_slice(Shape::new(&[1, 2]), &[1.0, -2.0]);
        let logvar = Tensor::zeroed(Shape::new(&[1, 2]));
        // -0.5 * ((1 - 1 - 1) + (1 - 4 - 1))
        assert_eq!(kld_loss(&mu, &logvar), 2.5);
    }

    #[test]
    fn gradient() {
        let mu = Tensor::from_slice(Shape::new(&[1, 3]), &[0.3, -1.2, 0.7]);
        let logvar = Tensor::from_slice(Shape::new(&[1, 3]), &[-0.5, 0.4, 1.1]);
        let (mu_grad, logvar_grad) = kld_backward(&mu, &logvar);

        let h = 1e-3;
        for i in 0..3 {
            let mut plus = logvar.clone();
            plus.values_mut()[i] += h;
            let mut minus = logvar.clone();
            minus.values_mut()[i] -= h;
            let numeric = (kld_loss(&mu, &plus) - kld_loss(&mu, &minus)) / (2.0 * h);
            assert!((numeric - logvar_grad.values()[i]).abs() < 1e-2);

            let mut plus = mu.clone();
            plus.values_mut()[i] += h;
            let mut minus = mu.clone();
            minus.values_mut()[i] -= h;
            let numeric = (kld_loss(&plus, &logvar) - kld_loss(&minus, &logvar)) / (2.0 * h);
            assert!((numeric - mu_grad.values()[i]).abs() < 1e-2);
        }
    }
}
