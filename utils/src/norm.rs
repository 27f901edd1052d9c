use anyhow::{bail, Context};
use spade_gan::{Conv2d, NormSpec, NormalisedConv, SpadeConfig};
use structopt::StructOpt;

/// Parses a normalisation string and describes the layers it builds.
#[derive(StructOpt)]
pub struct NormOptions {
    /// e.g. `spadesyncbatch3x3` or `spectralinstance`
    #[structopt(required = true, short, long)]
    spec: String,
    #[structopt(short, long, default_value = "64")]
    channels: usize,
}

impl NormOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        if self.spec.starts_with("spade") {
            let config = self.spec.parse::<SpadeConfig>().with_context(|| "Failed to parse SPADE config.")?;
            println!("SPADE [{config}]");
            println!("  param-free norm: {:?}", config.norm);
            println!("  kernel: {0}x{0}", config.kernel);
            return Ok(());
        }

        if self.channels == 0 {
            bail!("Channel count must be positive, got 0!");
        }

        let spec = self.spec.parse::<NormSpec>().with_context(|| "Failed to parse norm type.")?;
        let layer = NormalisedConv::new(Conv2d::new(self.channels, self.channels, 3), &spec)?;

        println!("Normalised conv [{spec}]");
        println!("  spectral norm: {}", layer.conv().weight().spectral_norm().is_some());
        println!("  conv bias: {}", layer.conv().bias().is_some());
        println!("  norm: {:?}", layer.norm().map(|norm| norm.kind()));
        println!("  affine: {}", layer.has_affine());

        Ok(())
    }
}
