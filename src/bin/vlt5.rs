#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::{anyhow, Result};
use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_vlt5::models::vlt5::{
    CheckpointWeights, Config, GenerationConfig, VisualFeatures, VlT5ForConditionalGeneration,
};
use clap::Parser;

const DTYPE: DType = DType::F32;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// Model configuration, HF-style config.json.
    #[arg(long)]
    config: String,

    /// Safetensors weights using this crate's parameter names.
    #[arg(long)]
    weights: Option<String>,

    /// Safetensors dump using the original slash-separated naming scheme.
    #[arg(long)]
    checkpoint: Option<String>,

    /// Safetensors file holding visual `features` and `boxes` tensors.
    #[arg(long)]
    visual: Option<String>,

    /// Comma-separated input token ids.
    #[arg(long)]
    tokens: String,

    #[arg(long, default_value = "20")]
    max_length: usize,

    #[arg(long, default_value = "0")]
    min_length: usize,

    #[arg(long, default_value = "1")]
    num_beams: usize,

    /// Sample from the filtered distribution instead of taking the arg-max.
    #[arg(long)]
    sample: bool,

    #[arg(long, default_value = "1.0")]
    temperature: f64,

    #[arg(long, default_value = "50")]
    top_k: usize,

    #[arg(long, default_value = "1.0")]
    top_p: f64,

    #[arg(long, default_value = "1.0")]
    repeat_penalty: f32,

    #[arg(long, default_value = "0")]
    no_repeat_ngram_size: usize,

    #[arg(long, default_value = "1.0")]
    length_penalty: f64,

    #[arg(long, default_value = "299792458")]
    seed: u64,

    /// Decode without reusing cached key/value states.
    #[arg(long)]
    no_kv_cache: bool,
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
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    let config = std::fs::read_to_string(&args.config)?;
    let config: Config = serde_json::from_str(&config)?;

    let model = match (&args.weights, &args.checkpoint) {
        (Some(_), Some(_)) => anyhow::bail!("--weights and --checkpoint are exclusive"),
        (Some(weights), None) => {
            let vb =
                unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DTYPE, &device)? };
            VlT5ForConditionalGeneration::load(vb, &config)?
        }
        (None, Some(checkpoint)) => {
            let ckpt = CheckpointWeights::from_safetensors(checkpoint, &config, &device)?;
            if !ckpt.missing.is_empty() {
                anyhow::bail!("checkpoint is missing parameters: {:?}", ckpt.missing)
            }
            VlT5ForConditionalGeneration::load(ckpt.var_builder(DTYPE, &device), &config)?
        }
        (None, None) => {
            println!("no weights provided, running a randomly initialized model");
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DTYPE, &device);
            VlT5ForConditionalGeneration::load(vb, &config)?
        }
    };

    let tokens = args
        .tokens
        .split(',')
        .map(|t| t.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let n_tokens = tokens.len();
    let input_ids = Tensor::from_vec(tokens, (1, n_tokens), &device)?;

    let visual_tensors = match &args.visual {
        Some(path) => Some(candle::safetensors::load(path, &device)?),
        None => None,
    };
    let visual = match &visual_tensors {
        Some(tensors) => {
            let features = tensors
                .get("features")
                .ok_or_else(|| anyhow!("no `features` tensor in {:?}", args.visual))?;
            let boxes = tensors
                .get("boxes")
                .ok_or_else(|| anyhow!("no `boxes` tensor in {:?}", args.visual))?;
            Some(VisualFeatures::new(features, boxes))
        }
        None => None,
    };

    let gen_cfg = GenerationConfig {
        max_length: args.max_length,
        min_length: args.min_length,
        do_sample: args.sample,
        num_beams: args.num_beams,
        temperature: args.temperature,
        top_k: args.top_k,
        top_p: args.top_p,
        repetition_penalty: args.repeat_penalty,
        no_repeat_ngram_size: args.no_repeat_ngram_size,
        length_penalty: args.length_penalty,
        seed: args.seed,
        use_cache: !args.no_kv_cache,
        ..Default::default()
    };

    let start = std::time::Instant::now();
    let output = model.generate(&input_ids, None, visual.as_ref(), &gen_cfg)?;
    println!("Took {:?}", start.elapsed());
    for sequence in output.to_vec2::<u32>()? {
        println!("{sequence:?}");
    }
    Ok(())
}
