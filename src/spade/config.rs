use std::{fmt::Display, str::FromStr};

use crate::{
    error::{GanError, Result},
    layers::NormKind,
};

/// Width of the hidden embedding predicted from the semantic map.
pub const SPADE_HIDDEN: usize = 128;

/// Parsed from `spade<norm><k>x<k>`, e.g. `spadesyncbatch3x3` or `spadeinstance5x5`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpadeConfig {
    pub norm: NormKind,
    pub kernel: usize,
}

impl FromStr for SpadeConfig {
    type Err = GanError;

    fn from_str(s: &str) -> Result<Self> {
        let err = |msg: String| GanError::Configuration(format!("invalid SPADE config `{s}`: {msg}"));

        let rest = s.strip_prefix("spade").ok_or_else(|| err("expected `spade` prefix".to_string()))?;
        let split = rest.find(|c: char| c.is_ascii_digit()).ok_or_else(|| err("missing kernel size".to_string()))?;
        let (norm, dims) = rest.split_at(split);

        let norm = match norm {
            "instance" => NormKind::Instance,
            "batch" => NormKind::Batch,
            "syncbatch" => NormKind::SyncBatch,
            _ => return Err(err(format!("`{norm}` is not a recognized param-free norm type"))),
        };

        let kernel = match dims.as_bytes() {
            [k, b'x', k2] if k.is_ascii_digit() && k2.is_ascii_digit() => usize::from(k - b'0'),
            _ => return Err(err(format!("expected `<k>x<k>`, got `{dims}`"))),
        };

        if kernel % 2 == 0 {
            return Err(err(format!("kernel size must be odd, got {kernel}")));
        }

        Ok(Self { norm, kernel })
    }
}

impl Display for SpadeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let norm = match self.norm {
            NormKind::Instance => "instance",
            NormKind::Batch => "batch",
            NormKind::SyncBatch => "syncbatch",
        };

        write!(f, "spade{norm}{k}x{k}", k = self.kernel)
    }
}

/// At most one noise source perturbs the activation before normalisation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NoiseMode {
    #[default]
    None,
    /// Learned per-channel scale of a per-pixel Gaussian sample.
    PerChannel,
    /// Per-location scale predicted from the semantic map.
    Segmentation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpadeOptions {
    pub use_pos: bool,
    /// Pass the positional encoding through a learned 1x1 conv first.
    pub use_pos_proj: bool,
    pub noise: NoiseMode,
    /// Kernel of the conv predicting the segmentation noise scale.
    pub seg_noise_kernel: usize,
    pub hidden_channels: usize,
}

impl Default for SpadeOptions {
    fn default() -> Self {
        Self {
            use_pos: false,
            use_pos_proj: false,
            noise: NoiseMode::None,
            seg_noise_kernel: 3,
            hidden_channels: SPADE_HIDDEN,
        }
    }
}

impl SpadeOptions {
    pub fn with_positional(mut self, project: bool) -> Self {
        self.use_pos = true;
        self.use_pos_proj = project;
        self
    }

    pub fn with_noise(mut self, noise: NoiseMode) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_seg_noise_kernel(mut self, kernel: usize) -> Self {
        self.seg_noise_kernel = kernel;
        self
    }

    pub fn with_hidden_channels(mut self, hidden_channels: usize) -> Self {
        self.hidden_channels = hidden_channels;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_channels == 0 {
            return Err(GanError::Configuration("SPADE needs at least one hidden channel".to_string()));
        }

        if self.use_pos_proj && !self.use_pos {
            return Err(GanError::Configuration("positional projection requires positional encoding".to_string()));
        }

        if self.use_pos && self.hidden_channels % 4 != 0 {
            return Err(GanError::Configuration(format!(
                "positional encoding needs a multiple of 4 hidden channels, got {}",
                self.hidden_channels
            )));
        }

        if self.noise == NoiseMode::Segmentation && self.seg_noise_kernel % 2 == 0 {
            return Err(GanError::Configuration(format!(
                "segmentation noise kernel must be odd, got {}",
                self.seg_noise_kernel
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let cases = [
            ("spadeinstance3x3", NormKind::Instance, 3),
            ("spadesyncbatch3x3", NormKind::SyncBatch, 3),
            ("spadebatch5x5", NormKind::Batch, 5),
            ("spadeinstance1x1", NormKind::Instance, 1),
        ];

        for (s, norm, kernel) in cases {
            let config = s.parse::<SpadeConfig>().unwrap();
            assert_eq!(config, SpadeConfig { norm, kernel });
            assert_eq!(config.to_string(), s);
        }
    }

    #[test]
    fn parse_errors() {
        for s in ["spadegroup3x3", "spadeinstance4x4", "spadeinstance", "instance3x3", "spadeinstance3x", "spade3x3"] {
            assert!(matches!(s.parse::<SpadeConfig>(), Err(GanError::Configuration(_))), "{s}");
        }
    }

    #[test]
    fn validate() {
        assert!(SpadeOptions::default().validate().is_ok());
        assert!(SpadeOptions::default().with_positional(true).validate().is_ok());

        let bad = [
            SpadeOptions { use_pos_proj: true, ..Default::default() },
            SpadeOptions::default().with_positional(false).with_hidden_channels(6),
            SpadeOptions::default().with_noise(NoiseMode::Segmentation).with_seg_noise_kernel(2),
            SpadeOptions::default().with_hidden_channels(0),
        ];

        for options in bad {
            assert!(matches!(options.validate(), Err(GanError::Configuration(_))), "{options:?}");
        }
    }
}
