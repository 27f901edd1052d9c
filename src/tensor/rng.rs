use rand::thread_rng;
use rand_distr::{Distribution, StandardNormal, Uniform};

/// `length` samples from `N(mean, stdev^2)`, or from `U[mean - stdev, mean + stdev]`
/// when `use_gaussian` is unset.
pub fn vec_f32(length: usize, mean: f32, stdev: f32, use_gaussian: bool) -> Vec<f32> {
    assert!(stdev.is_finite() && stdev >= 0.0, "Invalid standard deviation {stdev}!");

    let rng = thread_rng();

    if use_gaussian {
        Distribution::<f32>::sample_iter(StandardNormal, rng).take(length).map(|x| mean + stdev * x).collect()
    } else {
        Uniform::new_inclusive(mean - stdev, mean + stdev).sample_iter(rng).take(length).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_in_range() {
        let values = vec_f32(1000, 1.0, 0.5, false);
        assert_eq!(values.len(), 1000);
        assert!(values.iter().all(|&x| (0.5..=1.5).contains(&x)));
    }

    #[test]
    fn gaussian_moments() {
        let values = vec_f32(20000, 0.0, 1.0, true);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.1);
    }

    #[test]
    fn zero_stdev_is_constant() {
        assert!(vec_f32(16, 3.0, 0.0, true).iter().all(|&x| x == 3.0));
    }
}
