use std::{
    fmt::Display,
    sync::atomic::{AtomicBool, Ordering::SeqCst},
};

static CBCS: AtomicBool = AtomicBool::new(false);

pub fn ansi<T: Display, U: Display>(x: T, y: U) -> String {
    format!("\x1b[{y}m{x}\x1b[0m{}", esc())
}

/// Colour-blind-safe palette.
pub fn set_cbcs(val: bool) {
    CBCS.store(val, SeqCst)
}

pub fn num_cs() -> i32 {
    if CBCS.load(SeqCst) {
        35
    } else {
        36
    }
}

fn esc() -> &'static str {
    if CBCS.load(SeqCst) {
        "\x1b[38;5;225m"
    } else {
        ""
    }
}

/// e.g. `(epoch: 3, iters: 1200, time: 0.412) GAN: 1.023 D_Fake: 0.311`
pub fn format_losses(epoch: usize, iter: usize, losses: &[(&str, f32)], time_per_iter: f32) -> String {
    let num_cs = num_cs();

    let mut line = format!(
        "(epoch: {}, iters: {}, time: {})",
        ansi(epoch, num_cs),
        ansi(iter, num_cs),
        ansi(format!("{time_per_iter:.3}"), num_cs),
    );

    for (name, value) in losses {
        line.push_str(&format!(" {name}: {}", ansi(format!("{value:.3}"), num_cs)));
    }

    line
}

pub fn report_losses(epoch: usize, iter: usize, losses: &[(&str, f32)], time_per_iter: f32) {
    println!("{}", format_losses(epoch, iter, losses, time_per_iter));
}

pub fn format_spectral_norm(name: &str, sigma: f32, iterations: usize) -> String {
    let num_cs = num_cs();
    format!(
        "spectral norm of {} after {} iterations: sigma {}",
        ansi(name, "34;1"),
        ansi(iterations, num_cs),
        ansi(format!("{sigma:.6}"), num_cs),
    )
}

pub fn report_spectral_norm(name: &str, sigma: f32, iterations: usize) {
    println!("{}", format_spectral_norm(name, sigma, iterations));
}

/// Sizes are `(channels, height, width)`.
pub fn format_positional_rebuild(old: (usize, usize, usize), new: (usize, usize, usize)) -> String {
    format!(
        "Rebuilding positional encoding: {} -> {}",
        ansi(format!("{}x{}x{}", old.0, old.1, old.2), 31),
        ansi(format!("{}x{}x{}", new.0, new.1, new.2), num_cs()),
    )
}

pub fn report_positional_rebuild(old: (usize, usize, usize), new: (usize, usize, usize)) {
    println!("{}", format_positional_rebuild(old, new));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                for c in chars.by_ref() {
                    if c == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn losses_line() {
        let line = format_losses(3, 1200, &[("GAN", 1.0234), ("D_Fake", 0.3111)], 0.4123);
        assert_eq!(strip(&line), "(epoch: 3, iters: 1200, time: 0.412) GAN: 1.023 D_Fake: 0.311");
    }

    #[test]
    fn rebuild_line() {
        let line = format_positional_rebuild((128, 8, 8), (128, 16, 16));
        assert_eq!(strip(&line), "Rebuilding positional encoding: 128x8x8 -> 128x16x16");
    }

    #[test]
    fn sigma_line() {
        let line = format_spectral_norm("weight", 2.5, 4);
        assert_eq!(strip(&line), "spectral norm of weight after 4 iterations: sigma 2.500000");
    }
}
