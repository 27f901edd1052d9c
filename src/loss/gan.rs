use std::{fmt::Display, str::FromStr};

use crate::{
    error::{GanError, Result},
    shape::Shape,
    tensor::Tensor,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GanMode {
    LeastSquares,
    /// Binary cross-entropy with logits.
    Original,
    Wasserstein,
    Hinge,
}

impl FromStr for GanMode {
    type Err = GanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ls" | "least-squares" => Ok(Self::LeastSquares),
            "original" => Ok(Self::Original),
            "w" | "wasserstein" => Ok(Self::Wasserstein),
            "hinge" => Ok(Self::Hinge),
            _ => Err(GanError::Configuration(format!("Unexpected gan_mode `{s}`"))),
        }
    }
}

impl Display for GanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LeastSquares => "ls",
            Self::Original => "original",
            Self::Wasserstein => "w",
            Self::Hinge => "hinge",
        };

        write!(f, "{name}")
    }
}

/// Output of a (possibly multiscale) discriminator.
#[derive(Clone, Debug, PartialEq)]
pub enum DiscriminatorOutput {
    Single(Tensor),
    /// One prediction per scale.
    MultiScale(Vec<Tensor>),
    /// Per scale, the intermediate feature maps followed by the final prediction.
    NestedMultiScale(Vec<Vec<Tensor>>),
}

impl DiscriminatorOutput {
    pub fn num_scales(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::MultiScale(scales) => scales.len(),
            Self::NestedMultiScale(scales) => scales.len(),
        }
    }

    /// The final prediction of every scale.
    pub fn predictions(&self) -> Result<Vec<&Tensor>> {
        match self {
            Self::Single(pred) => Ok(vec![pred]),
            Self::MultiScale(scales) => Ok(scales.iter().collect()),
            Self::NestedMultiScale(scales) => scales
                .iter()
                .map(|scale| scale.last().ok_or_else(|| GanError::InvalidArgument("Empty discriminator scale".into())))
                .collect(),
        }
    }
}

/// Loss of a single tensor, or one value per batch item for multiscale outputs.
#[derive(Clone, Debug, PartialEq)]
pub enum LossValue {
    Scalar(f32),
    PerSample(Vec<f32>),
}

impl LossValue {
    /// Reduces to a single scalar.
    pub fn mean(&self) -> f32 {
        match self {
            Self::Scalar(x) => *x,
            Self::PerSample(xs) => xs.iter().sum::<f32>() / xs.len() as f32,
        }
    }
}

/// Adversarial loss under one of the [`GanMode`]s.
#[derive(Clone, Debug)]
pub struct GanLoss {
    mode: GanMode,
    real_label: f32,
    fake_label: f32,
    real_target: Option<Tensor>,
    fake_target: Option<Tensor>,
}

impl GanLoss {
    pub fn new(mode: GanMode) -> Self {
        Self { mode, real_label: 1.0, fake_label: 0.0, real_target: None, fake_target: None }
    }

    pub fn with_labels(mut self, real_label: f32, fake_label: f32) -> Self {
        self.real_label = real_label;
        self.fake_label = fake_label;
        self.real_target = None;
        self.fake_target = None;
        self
    }

    pub fn mode(&self) -> GanMode {
        self.mode
    }

    /// Constant label tensor shaped like the prediction, built on first use.
    fn target(&mut self, shape: &Shape, target_is_real: bool) -> &Tensor {
        let (slot, label) = if target_is_real {
            (&mut self.real_target, self.real_label)
        } else {
            (&mut self.fake_target, self.fake_label)
        };

        if slot.as_ref().map(Tensor::shape) != Some(shape) {
            *slot = Some(Tensor::full(shape.clone(), label));
        }

        slot.get_or_insert_with(|| Tensor::full(shape.clone(), label))
    }

    fn check_role(&self, target_is_real: bool, for_discriminator: bool) -> Result<()> {
        if self.mode == GanMode::Hinge && !for_discriminator && !target_is_real {
            return Err(GanError::InvariantViolation(
                "The generator's hinge loss must be aiming for real".to_string(),
            ));
        }

        Ok(())
    }

    /// Unreduced loss, one value per prediction element.
    fn elementwise(&mut self, pred: &Tensor, target_is_real: bool, for_discriminator: bool) -> Result<Tensor> {
        self.check_role(target_is_real, for_discriminator)?;

        let mode = self.mode;
        Ok(match mode {
            GanMode::LeastSquares => pred.zip_map(self.target(pred.shape(), target_is_real), |p, t| (p - t).powi(2)),
            GanMode::Original => pred.zip_map(self.target(pred.shape(), target_is_real), |p, t| {
                p.max(0.0) - p * t + (-p.abs()).exp().ln_1p()
            }),
            GanMode::Hinge if !for_discriminator => pred.map(|p| -p),
            GanMode::Hinge if target_is_real => pred.map(|p| -(p - 1.0).min(0.0)),
            GanMode::Hinge => pred.map(|p| -(-p - 1.0).min(0.0)),
            GanMode::Wasserstein if target_is_real => pred.map(|p| -p),
            GanMode::Wasserstein => pred.clone(),
        })
    }

    /// Derivative of [`GanLoss::elementwise`] with respect to each prediction.
    fn elementwise_grad(&mut self, pred: &Tensor, target_is_real: bool, for_discriminator: bool) -> Result<Tensor> {
        self.check_role(target_is_real, for_discriminator)?;

        let mode = self.mode;
        Ok(match mode {
            GanMode::LeastSquares => pred.zip_map(self.target(pred.shape(), target_is_real), |p, t| 2.0 * (p - t)),
            GanMode::Original => {
                pred.zip_map(self.target(pred.shape(), target_is_real), |p, t| 1.0 / (1.0 + (-p).exp()) - t)
            }
            GanMode::Hinge if !for_discriminator => pred.map(|_| -1.0),
            GanMode::Hinge if target_is_real => pred.map(|p| if p < 1.0 { -1.0 } else { 0.0 }),
            GanMode::Hinge => pred.map(|p| if p > -1.0 { 1.0 } else { 0.0 }),
            GanMode::Wasserstein if target_is_real => pred.map(|_| -1.0),
            GanMode::Wasserstein => pred.map(|_| 1.0),
        })
    }

    /// Mean loss of a single prediction tensor.
    pub fn loss(&mut self, pred: &Tensor, target_is_real: bool, for_discriminator: bool) -> Result<f32> {
        Ok(self.elementwise(pred, target_is_real, for_discriminator)?.mean())
    }

    /// Gradient of [`GanLoss::loss`] with respect to `pred`.
    pub fn gradient(&mut self, pred: &Tensor, target_is_real: bool, for_discriminator: bool) -> Result<Tensor> {
        let scale = 1.0 / pred.size() as f32;
        Ok(self.elementwise_grad(pred, target_is_real, for_discriminator)?.map(|g| g * scale))
    }

    /// A single tensor gives its mean loss. Multiscale outputs give, per batch
    /// item, the loss averaged over that item's elements and then over scales.
    pub fn call(
        &mut self,
        output: &DiscriminatorOutput,
        target_is_real: bool,
        for_discriminator: bool,
    ) -> Result<LossValue> {
        if let DiscriminatorOutput::Single(pred) = output {
            return self.loss(pred, target_is_real, for_discriminator).map(LossValue::Scalar);
        }

        let preds = output.predictions()?;
        if preds.is_empty() {
            return Err(GanError::InvalidArgument("No discriminator scales".to_string()));
        }

        let mut total: Option<Vec<f32>> = None;
        for pred in &preds {
            let per_sample = self.elementwise(pred, target_is_real, for_discriminator)?.batch_means();

            match total.as_mut() {
                None => total = Some(per_sample),
                Some(total) => {
                    assert_eq!(total.len(), per_sample.len(), "Batch size differs across scales!");
                    total.iter_mut().zip(per_sample.iter()).for_each(|(t, &l)| *t += l);
                }
            }
        }

        let scales = preds.len() as f32;
        Ok(LossValue::PerSample(total.unwrap_or_default().into_iter().map(|t| t / scales).collect()))
    }

    /// Gradient of `call(..).mean()`, shaped like `output`. Intermediate
    /// feature maps of nested outputs get zero gradient.
    pub fn backward(
        &mut self,
        output: &DiscriminatorOutput,
        target_is_real: bool,
        for_discriminator: bool,
    ) -> Result<DiscriminatorOutput> {
        if output.num_scales() == 0 {
            return Err(GanError::InvalidArgument("No discriminator scales".to_string()));
        }

        let scales = output.num_scales() as f32;
        let mut grad =
            |pred: &Tensor| self.gradient(pred, target_is_real, for_discriminator).map(|g| g.map(|x| x / scales));

        Ok(match output {
            DiscriminatorOutput::Single(pred) => DiscriminatorOutput::Single(grad(pred)?),
            DiscriminatorOutput::MultiScale(preds) => {
                DiscriminatorOutput::MultiScale(preds.iter().map(grad).collect::<Result<_>>()?)
            }
            DiscriminatorOutput::NestedMultiScale(nested) => {
                let mut grads = Vec::with_capacity(nested.len());
                for scale in nested {
                    let Some((last, features)) = scale.split_last() else {
                        return Err(GanError::InvalidArgument("Empty discriminator scale".to_string()));
                    };

                    let mut scale_grads = features.iter().map(|f| Tensor::zeroed(f.shape().clone())).collect::<Vec<_>>();
                    scale_grads.push(grad(last)?);
                    grads.push(scale_grads);
                }
                DiscriminatorOutput::NestedMultiScale(grads)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(val: f32) -> Tensor {
        Tensor::full(Shape::nchw(2, 1, 3, 3), val)
    }

    fn column(values: &[f32]) -> Tensor {
        Tensor::from_slice(Shape::new(&[values.len(), 1]), values)
    }

    const MODES: [GanMode; 4] = [GanMode::LeastSquares, GanMode::Original, GanMode::Wasserstein, GanMode::Hinge];

    #[test]
    fn parse_modes() {
        assert_eq!("ls".parse::<GanMode>().unwrap(), GanMode::LeastSquares);
        assert_eq!("original".parse::<GanMode>().unwrap(), GanMode::Original);
        assert_eq!("wasserstein".parse::<GanMode>().unwrap(), GanMode::Wasserstein);
        assert_eq!("hinge".parse::<GanMode>().unwrap(), GanMode::Hinge);
        assert!(matches!("vanilla".parse::<GanMode>(), Err(GanError::Configuration(_))));

        for mode in MODES {
            assert_eq!(mode.to_string().parse::<GanMode>().unwrap(), mode);
        }
    }

    #[test]
    fn least_squares_perfect_real() {
        let mut loss = GanLoss::new(GanMode::LeastSquares);
        assert_eq!(loss.loss(&constant(1.0), true, true).unwrap(), 0.0);
        assert_eq!(loss.loss(&constant(1.0), false, true).unwrap(), 1.0);
        assert_eq!(loss.loss(&constant(0.5), true, false).unwrap(), 0.25);
    }

    #[test]
    fn hinge_discriminator() {
        let mut loss = GanLoss::new(GanMode::Hinge);
        assert_eq!(loss.loss(&constant(2.0), true, true).unwrap(), 0.0);
        assert_eq!(loss.loss(&constant(0.0), true, true).unwrap(), 1.0);
        assert_eq!(loss.loss(&constant(-2.0), false, true).unwrap(), 0.0);
        assert_eq!(loss.loss(&constant(0.5), false, true).unwrap(), 1.5);
    }

    #[test]
    fn hinge_generator() {
        let mut loss = GanLoss::new(GanMode::Hinge);
        assert_eq!(loss.loss(&constant(0.5), true, false).unwrap(), -0.5);

        for val in [-1.0, 0.0, 3.0] {
            assert!(matches!(loss.loss(&constant(val), false, false), Err(GanError::InvariantViolation(_))));
            let output = DiscriminatorOutput::MultiScale(vec![constant(val)]);
            assert!(matches!(loss.call(&output, false, false), Err(GanError::InvariantViolation(_))));
            assert!(matches!(loss.backward(&output, false, false), Err(GanError::InvariantViolation(_))));
        }
    }

    #[test]
    fn wasserstein() {
        let mut loss = GanLoss::new(GanMode::Wasserstein);
        assert_eq!(loss.loss(&constant(0.75), true, true).unwrap(), -0.75);
        assert_eq!(loss.loss(&constant(0.75), false, true).unwrap(), 0.75);
    }

    #[test]
    fn original_is_cross_entropy() {
        let mut loss = GanLoss::new(GanMode::Original);
        let ln2 = std::f32::consts::LN_2;
        assert!((loss.loss(&constant(0.0), true, true).unwrap() - ln2).abs() < 1e-6);

        let pred = column(&[2.0, -3.0]);
        let expected = (-(1.0 / (1.0 + (-2.0f32).exp())).ln() - (1.0 / (1.0 + 3.0f32.exp())).ln()) / 2.0;
        assert!((loss.loss(&pred, true, false).unwrap() - expected).abs() < 1e-5);

        // large logits stay finite
        assert!(loss.loss(&constant(100.0), false, true).unwrap().is_finite());
        assert!(loss.loss(&constant(-100.0), true, true).unwrap().is_finite());
    }

    #[test]
    fn custom_labels() {
        let mut loss = GanLoss::new(GanMode::LeastSquares).with_labels(0.9, 0.1);
        assert!(loss.loss(&constant(0.9), true, true).unwrap().abs() < 1e-12);
        assert!(loss.loss(&constant(0.1), false, true).unwrap().abs() < 1e-12);
    }

    #[test]
    fn targets_follow_prediction_shape() {
        let mut loss = GanLoss::new(GanMode::LeastSquares);
        assert_eq!(loss.loss(&constant(1.0), true, true).unwrap(), 0.0);
        assert_eq!(loss.loss(&column(&[1.0, 1.0, 1.0]), true, true).unwrap(), 0.0);
        assert_eq!(loss.loss(&constant(1.0), true, true).unwrap(), 0.0);
    }

    #[test]
    fn multiscale_averages_scales_per_sample() {
        let mut loss = GanLoss::new(GanMode::Wasserstein);
        let scales = vec![column(&[1.0, 2.0]), column(&[3.0, 4.0]), column(&[5.0, 6.0])];

        let output = DiscriminatorOutput::MultiScale(scales.clone());
        assert_eq!(loss.call(&output, false, true).unwrap(), LossValue::PerSample(vec![3.0, 4.0]));

        // only the last entry of each nested scale is a prediction
        let nested = scales.into_iter().map(|pred| vec![constant(100.0), pred]).collect();
        let output = DiscriminatorOutput::NestedMultiScale(nested);
        let value = loss.call(&output, false, true).unwrap();
        assert_eq!(value, LossValue::PerSample(vec![3.0, 4.0]));
        assert_eq!(value.mean(), 3.5);
    }

    #[test]
    fn multiscale_means_over_non_batch_dims() {
        let mut loss = GanLoss::new(GanMode::Wasserstein);
        let pred = Tensor::from_slice(Shape::nchw(2, 1, 1, 2), &[1.0, 3.0, 10.0, 20.0]);
        let output = DiscriminatorOutput::MultiScale(vec![pred]);
        assert_eq!(loss.call(&output, false, true).unwrap(), LossValue::PerSample(vec![2.0, 15.0]));
    }

    #[test]
    fn single_is_scalar() {
        let mut loss = GanLoss::new(GanMode::Hinge);
        let output = DiscriminatorOutput::Single(constant(0.0));
        assert_eq!(loss.call(&output, true, true).unwrap(), LossValue::Scalar(1.0));
    }

    #[test]
    fn empty_outputs() {
        let mut loss = GanLoss::new(GanMode::LeastSquares);
        let output = DiscriminatorOutput::MultiScale(Vec::new());
        assert!(matches!(loss.call(&output, true, true), Err(GanError::InvalidArgument(_))));

        let output = DiscriminatorOutput::NestedMultiScale(vec![Vec::new()]);
        assert!(matches!(loss.call(&output, true, true), Err(GanError::InvalidArgument(_))));
        assert!(matches!(loss.backward(&output, true, true), Err(GanError::InvalidArgument(_))));
    }

    #[test]
    fn gradients_match_finite_differences() {
        let pred = Tensor::from_slice(Shape::nchw(2, 1, 1, 3), &[-1.7, -0.4, 0.3, 0.8, 1.6, 2.9]);

        for mode in MODES {
            for (real, disc) in [(true, true), (false, true), (true, false)] {
                let mut loss = GanLoss::new(mode);
                let grad = loss.gradient(&pred, real, disc).unwrap();

                let h = 1e-3;
                for i in 0..pred.size() {
                    let mut plus = pred.clone();
                    plus.values_mut()[i] += h;
                    let mut minus = pred.clone();
                    minus.values_mut()[i] -= h;

                    let numeric =
                        (loss.loss(&plus, real, disc).unwrap() - loss.loss(&minus, real, disc).unwrap()) / (2.0 * h);
                    let analytic = grad.values()[i];
                    assert!((numeric - analytic).abs() < 1e-3, "{mode} {real} {disc} {i}: {numeric} vs {analytic}");
                }
            }
        }
    }

    #[test]
    fn backward_mirrors_output() {
        let mut loss = GanLoss::new(GanMode::LeastSquares);
        let output = DiscriminatorOutput::NestedMultiScale(vec![
            vec![constant(5.0), column(&[2.0, 0.0])],
            vec![constant(5.0), constant(5.0), column(&[1.0, 3.0])],
        ]);

        let DiscriminatorOutput::NestedMultiScale(grads) = loss.backward(&output, true, true).unwrap() else {
            panic!("Expected nested gradients!");
        };

        assert_eq!(grads.len(), 2);
        assert_eq!(grads[1].len(), 3);
        assert!(grads[0][0].values().iter().all(|&g| g == 0.0));
        assert!(grads[1][1].values().iter().all(|&g| g == 0.0));

        // d/dp of mean over 2 samples and 2 scales of (p - 1)^2
        assert_eq!(grads[0][1].values(), &[0.5, -0.5]);
        assert_eq!(grads[1][1].shape(), &Shape::nchw(2, 1, 3, 3));
        assert_eq!(grads[1][2].values(), &[0.0, 1.0]);
    }
}
