//! Scores a prediction file against COCO format references with CIDEr-D and CIDEr.
//!
//! CIDEr usually scores noticeably higher than CIDEr-D on the same predictions, the scores are
//! computed several times to get a rough timing.
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use vidcap::{Cider, CiderD, Scorer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Json file with a `predictions` list of `{image_id, caption}` entries.
    pred_file: PathBuf,

    /// COCO format annotation file holding the reference captions.
    cocofmt_file: PathBuf,

    /// Number of times the CIDEr-D score is computed.
    #[arg(long, default_value_t = 5)]
    iterations: usize,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// Print the debug events on stderr.
    #[arg(long)]
    verbose: bool,
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
        if args.verbose {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_writer(std::io::stderr)
                .init();
        }
        None
    };
    if args.iterations == 0 {
        anyhow::bail!("--iterations should be at least 1")
    }

    let start = std::time::Instant::now();
    let preds = vidcap::load_predictions(&args.pred_file)?;
    let refs = vidcap::load_gt_refs(&args.cocofmt_file)?;
    println!(
        "loaded {} predictions and references for {} items in {:?}",
        preds.len(),
        refs.len(),
        start.elapsed()
    );

    let ciderd = CiderD::default();
    let mut score = 0.;
    for i in 0..args.iterations {
        let iter_start = std::time::Instant::now();
        (score, _) = ciderd.compute_score(&refs, &preds)?;
        tracing::debug!(iteration = i, elapsed = ?iter_start.elapsed(), "scored");
    }
    println!("{}: {score:.6}", ciderd.name());

    let cider = Cider::default();
    let (cider_score, _) = cider.compute_score(&refs, &preds)?;
    println!("{}: {cider_score:.6}", cider.name());
    println!("time: {:?}", start.elapsed());
    Ok(())
}
