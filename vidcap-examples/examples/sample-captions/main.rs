//! Generates token sequences for the videos stored in a safetensors file.
//!
//! The features file holds one tensor per modality named `feats.0`, `feats.1`, ... each with
//! shape `(batch, 1, dim)` or `(batch, dim)`. Without `--weights` the model is randomly
//! initialised, which is mostly useful to check a configuration.
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use vidcap::{CaptionModel, Config, SampleOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// The model configuration, json.
    #[arg(long)]
    config: PathBuf,

    /// Model weights, safetensors.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Per-modality video features, safetensors.
    #[arg(long)]
    features: PathBuf,

    #[arg(long, default_value_t = 1)]
    beam_size: usize,

    /// Sample with this temperature rather than taking the most likely token.
    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long, default_value_t = 299792458)]
    seed: u64,
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };
    let device = vidcap_examples::device(args.cpu)?;

    let config = std::fs::read_to_string(&args.config)?;
    let config: Config = serde_json::from_str(&config)?;
    let start = std::time::Instant::now();
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = CaptionModel::new(&config, vb)?;
    if let Some(weights) = &args.weights {
        varmap.load(weights)?;
    }
    println!("loaded the model in {:?}", start.elapsed());

    let mut tensors = candle::safetensors::load(&args.features, &device)?;
    let feats = (0..config.num_feats())
        .map(|i| {
            let name = format!("feats.{i}");
            tensors
                .remove(&name)
                .with_context(|| format!("missing {name} in {:?}", args.features))
                .and_then(|t| Ok(t.to_dtype(DType::F32)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let opts = SampleOptions {
        sample_max: args.temperature.is_none(),
        beam_size: args.beam_size,
        temperature: args.temperature.unwrap_or(1.0),
        seed: args.seed,
        ..Default::default()
    };
    let start = std::time::Instant::now();
    let output = model.sample(&feats, &opts)?;
    println!("sampled in {:?}", start.elapsed());
    let lines = vidcap_examples::format_sequences(&output.seq)?;
    let lengths = output.lengths()?;
    let logprobs = output.seq_logprobs.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    for (i, line) in lines.iter().enumerate() {
        let lp = logprobs[i][..lengths[i]].iter().sum::<f32>();
        println!("{i}: {line} ({lp:.3})")
    }
    if let Some(done_beams) = &output.done_beams {
        for (i, done) in done_beams.iter().enumerate() {
            let best = done.best()?;
            println!(
                "{i}: {} finished beams, best perplexity {:.3}",
                done.len(),
                best.perplexity
            )
        }
    }
    Ok(())
}
