mod norm;
mod sigma;

use structopt::StructOpt;

#[derive(StructOpt)]
pub enum Options {
    Sigma(sigma::SigmaOptions),
    Norm(norm::NormOptions),
}

fn main() -> anyhow::Result<()> {
    match Options::from_args() {
        Options::Sigma(options) => options.run(),
        Options::Norm(options) => options.run(),
    }
}
