use std::path::{Path, PathBuf};

use anyhow::Result;
use candle::Device;
use clap::Args;
use rand::rngs::StdRng;
use rand::SeedableRng;
use xraygen::decoder::{inverse_permutation, TEACHER_FORCING};
use xraygen::generation::{hypotheses_from_output, references_from_output};
use xraygen::loss::{decoding_loss, LossWeights};
use xraygen::{checkpoint, ClassifierEncoder, Decoder};
use xraygen_data::{Batcher, ReportDataset, Vocabulary};

use crate::meter::Meter;

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Directory holding the metadata files and image folders.
    #[arg(long)]
    data_dir: PathBuf,

    /// Image folder under the data directory to score.
    #[arg(long, default_value = "val")]
    split: String,

    /// Checkpoint directory.
    #[arg(long, default_value = "checkpoints")]
    model_dir: PathBuf,

    /// Score the best checkpoint rather than the latest one.
    #[arg(long)]
    best: bool,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// Weight of the doubly stochastic attention term.
    #[arg(long, default_value_t = 1.0)]
    alpha_c: f64,

    /// Weight of the sentence stop term.
    #[arg(long, default_value_t = 1.0)]
    lambda_stop: f64,

    /// Write references.json and hypotheses.json next to the checkpoint.
    #[arg(long)]
    save_texts: bool,
}

/// Scores a dataset with teacher forcing and collects the reference and
/// hypothesis token sequences in dataset order.
pub fn validation_pass(
    encoder: &ClassifierEncoder,
    decoder: &dyn Decoder,
    dataset: &ReportDataset,
    batch_size: usize,
    weights: &LossWeights,
    device: &Device,
) -> Result<(f64, Vec<Vec<u32>>, Vec<Vec<u32>>)> {
    // Teacher forcing never draws from the rng.
    let mut rng = StdRng::seed_from_u64(0);
    let mut losses = Meter::new();
    let mut references = Vec::with_capacity(dataset.len());
    let mut hypotheses = Vec::with_capacity(dataset.len());
    let batches = Batcher::new((0..dataset.len()).map(|i| dataset.get(i)))
        .batch_size(batch_size)
        .return_last_incomplete_batch(true);
    for batch in batches {
        let batch = batch?;
        let images = batch.images.to_device(device)?;
        let captions = batch.captions.to_device(device)?;
        let encoded = encoder.forward(&images)?;
        let out = decoder.forward_t(
            &encoded,
            &captions,
            &batch.lengths,
            &TEACHER_FORCING,
            &mut rng,
            false,
        )?;
        let loss = decoding_loss(decoder, &out, weights)?;
        let words: usize = out.decode_lengths.iter().sum();
        losses.update(f64::from(loss.to_vec0::<f32>()?), words);
        let mut refs = references_from_output(&out)?;
        let mut hyps = hypotheses_from_output(decoder, &out)?;
        if refs.len() != hyps.len() || refs.len() != batch.lengths.len() {
            anyhow::bail!(
                "scored {} references against {} hypotheses for a batch of {}",
                refs.len(),
                hyps.len(),
                batch.lengths.len()
            )
        }
        // Undo the length sort so the outputs line up with the dataset.
        for &pos in inverse_permutation(&out.sort_ind).iter() {
            references.push(std::mem::take(&mut refs[pos as usize]));
            hypotheses.push(std::mem::take(&mut hyps[pos as usize]));
        }
    }
    Ok((losses.average(), references, hypotheses))
}

fn decode_all(vocab: &Vocabulary, reports: &[Vec<u32>]) -> candle::Result<Vec<String>> {
    reports.iter().map(|tokens| vocab.decode(tokens)).collect()
}

fn write_json(path: &Path, values: &[String]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), values)?;
    Ok(())
}

pub fn run(args: &EvalArgs, cpu: bool) -> Result<()> {
    let device = crate::device(cpu)?;
    let dir = if args.best {
        args.model_dir.join(checkpoint::BEST_DIR)
    } else {
        args.model_dir.clone()
    };
    let (encoder, decoder, config) = crate::load_model(&dir, &device)?;
    let dataset = ReportDataset::new(
        &args.data_dir.join("word2idx.json"),
        &args.data_dir.join("encodedCaptions.json"),
        &args.data_dir.join("encodedCaptionsLengths.json"),
        &args.data_dir.join(&args.split),
        config.max_size,
        config.resolution,
    )?;
    println!("scoring {} reports from {}", dataset.len(), args.split);
    let weights = LossWeights {
        alpha_c: args.alpha_c,
        lambda_stop: args.lambda_stop,
    };
    let (loss, references, hypotheses) = validation_pass(
        &encoder,
        decoder.as_ref(),
        &dataset,
        args.batch_size,
        &weights,
        &device,
    )?;
    println!("average loss {loss:.4} on {}", args.split);
    if args.save_texts {
        let vocab = dataset.vocab();
        write_json(&dir.join("references.json"), &decode_all(vocab, &references)?)?;
        write_json(&dir.join("hypotheses.json"), &decode_all(vocab, &hypotheses)?)?;
        println!("wrote references.json and hypotheses.json to {}", dir.display());
    }
    Ok(())
}
