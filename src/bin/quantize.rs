use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use biogpt_core::quantize::quantize_file;
use biogpt_core::utils::progress_dots;
use biogpt_core::WeightType;

#[derive(Parser, Debug)]
#[command(
    name = "biogpt-quantize",
    about = "Rewrite a BioGPT model with block-quantized weight matrices"
)]
struct Args {
    /// Input model file
    input: PathBuf,

    /// Output model file
    output: PathBuf,

    /// Target type: q4_0, q4_1, q5_0, q5_1 or q8_0
    #[arg(value_parser = parse_weight_type)]
    target: WeightType,
}

fn parse_weight_type(s: &str) -> std::result::Result<WeightType, String> {
    let t: WeightType = s.parse().map_err(|e| format!("{e}"))?;
    if !t.is_quantized() {
        return Err(format!("{t} is not a quantized type"));
    }
    Ok(t)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let stats = quantize_file(&args.input, &args.output, args.target, &mut progress_dots(40))?;
    info!(
        original_mb = stats.original_bytes as f64 / (1024.0 * 1024.0),
        quantized_mb = stats.quantized_bytes as f64 / (1024.0 * 1024.0),
        "wrote {}",
        args.output.display()
    );
    Ok(())
}
