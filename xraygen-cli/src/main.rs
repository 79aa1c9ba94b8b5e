#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod eval;
mod generate;
mod meter;
mod train;

use std::path::Path;

use anyhow::Result;
use candle::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use xraygen::checkpoint::{self, ModelConfig};
use xraygen::{build_decoder, ClassifierEncoder, Decoder};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a report generation model.
    Train(train::TrainArgs),
    /// Score a trained model against a labelled split.
    Eval(eval::EvalArgs),
    /// Write reports for a set of images.
    Generate(generate::GenerateArgs),
}

pub fn device(cpu: bool) -> candle::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        let device = Device::cuda_if_available(0)?;
        if !device.is_cuda() {
            println!("Running on CPU, to run on GPU, build this binary with `--features cuda`");
        }
        Ok(device)
    }
}

/// Rebuilds the model stored in a checkpoint directory and loads its weights.
pub fn load_model(
    dir: &Path,
    device: &Device,
) -> Result<(ClassifierEncoder, Box<dyn Decoder>, ModelConfig)> {
    let config = checkpoint::load_model_config(dir)?;
    let mut encoder_vars = VarMap::new();
    let vb = VarBuilder::from_varmap(&encoder_vars, DType::F32, device);
    let encoder = ClassifierEncoder::new(config.encoder, config.decoder.nr_labels, vb)?;
    let mut decoder_vars = VarMap::new();
    let vb = VarBuilder::from_varmap(&decoder_vars, DType::F32, device);
    let decoder = build_decoder(config.decoder_kind, &config.decoder, vb)?;
    checkpoint::load_weights(dir, &mut encoder_vars, &mut decoder_vars)?;
    println!(
        "loaded a {:?}/{:?} checkpoint from {}",
        config.encoder,
        config.decoder_kind,
        dir.display()
    );
    Ok((encoder, decoder, config))
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = CliArgs::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };
    match &args.command {
        Command::Train(train_args) => train::run(train_args, args.cpu),
        Command::Eval(eval_args) => eval::run(eval_args, args.cpu),
        Command::Generate(generate_args) => generate::run(generate_args, args.cpu),
    }
}
