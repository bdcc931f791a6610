use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use biogpt_core::generation::GenerationConfig;
use biogpt_core::utils::{progress_dots, select_device};
use biogpt_core::{DecodeEngine, Model, ModelForCausalLM, TokenId};

#[derive(Parser, Debug)]
#[command(
    name = "biogpt-generate",
    about = "Continue a sequence of BioGPT token ids"
)]
struct Args {
    /// Model file; repeat for each shard of a split model, in order
    #[arg(short, long, required = true)]
    model: Vec<PathBuf>,

    /// Prompt token ids, comma separated
    #[arg(short, long, value_delimiter = ',', required = true)]
    prompt: Vec<TokenId>,

    /// JSON file with generation settings; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    seed: Option<u64>,

    #[arg(short, long)]
    threads: Option<usize>,

    /// Number of tokens to predict
    #[arg(short, long)]
    n_predict: Option<usize>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    temp: Option<f32>,

    /// Prompt tokens per decode call
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Use CPU even if GPU is available
    #[arg(long)]
    cpu: bool,
}

impl Args {
    fn generation_config(&self) -> Result<GenerationConfig> {
        let mut config = match &self.config {
            Some(path) => GenerationConfig::from_json_file(path)?,
            None => GenerationConfig::default(),
        };
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.n_threads = self.threads.unwrap_or(config.n_threads);
        config.n_predict = self.n_predict.unwrap_or(config.n_predict);
        config.top_k = self.top_k.unwrap_or(config.top_k);
        config.top_p = self.top_p.unwrap_or(config.top_p);
        config.temperature = self.temp.unwrap_or(config.temperature);
        config.n_batch = self.batch_size.unwrap_or(config.n_batch);
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.generation_config()?;
    let device = select_device(args.cpu)?;
    info!(?config, ?device, "starting");

    let model = Model::load_shards(&args.model, &device, &mut progress_dots(40))
        .with_context(|| format!("failed to load model from {:?}", args.model))?;
    let mut engine = DecodeEngine::new(model, config.n_threads)?;
    let mut rng = config.rng();

    let mut stdout = std::io::stdout().lock();
    let generated = engine.generate(&args.prompt, &config, &mut rng, &mut |token| {
        write!(stdout, "{token} ")?;
        stdout.flush()?;
        Ok(())
    })?;
    writeln!(stdout)?;

    info!(n_generated = generated.len(), "done");
    Ok(())
}
