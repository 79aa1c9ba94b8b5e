use std::path::PathBuf;

use anyhow::Result;
use candle::Tensor;
use clap::Args;
use xraygen::generation::GenerationConfig;
use xraygen::checkpoint;
use xraygen_data::images::load_image;
use xraygen_data::Vocabulary;

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Images to write reports for.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Vocabulary the model was trained with, word2idx.json.
    #[arg(long)]
    word2idx: PathBuf,

    /// Checkpoint directory.
    #[arg(long, default_value = "checkpoints")]
    model_dir: PathBuf,

    /// Use the best checkpoint rather than the latest one.
    #[arg(long)]
    best: bool,

    /// Stop probability above which a sentence ends the report.
    #[arg(long, default_value_t = 0.5)]
    stop_threshold: f64,

    #[arg(long, default_value_t = 10)]
    max_sentences: usize,

    #[arg(long, default_value_t = 50)]
    max_words: usize,
}

pub fn run(args: &GenerateArgs, cpu: bool) -> Result<()> {
    let device = crate::device(cpu)?;
    let dir = if args.best {
        args.model_dir.join(checkpoint::BEST_DIR)
    } else {
        args.model_dir.clone()
    };
    let (encoder, decoder, config) = crate::load_model(&dir, &device)?;
    let vocab = Vocabulary::from_file(&args.word2idx)?;
    if vocab.len() != config.decoder.vocab_size {
        anyhow::bail!(
            "the model was trained with {} words but the vocabulary has {}",
            config.decoder.vocab_size,
            vocab.len()
        )
    }
    let generation = GenerationConfig {
        stop_threshold: args.stop_threshold,
        max_sentences: args.max_sentences,
        max_words: args.max_words,
    };
    let images = args
        .images
        .iter()
        .map(|path| load_image(path, config.resolution))
        .collect::<candle::Result<Vec<_>>>()?;
    let images = Tensor::stack(&images, 0)?.to_device(&device)?;
    let encoded = encoder.forward(&images)?;
    let reports = decoder.generate(&encoded, &vocab, &generation)?;
    for (path, tokens) in args.images.iter().zip(reports.iter()) {
        println!("{}: {}", path.display(), vocab.decode(tokens)?);
    }
    Ok(())
}
