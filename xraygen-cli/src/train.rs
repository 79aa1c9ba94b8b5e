use std::path::PathBuf;

use anyhow::Result;
use candle::{DType, Var};
use candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};
use clap::{ArgAction, Args, ValueEnum};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use xraygen::checkpoint::{self, ModelConfig, TrainState};
use xraygen::loss::{decoding_loss, LossWeights};
use xraygen::{
    build_decoder, ClassifierEncoder, DecoderConfig, DecoderKind, EncoderKind, FeedPolicy, HeadKind,
};
use xraygen_data::{Batcher, ReportDataset};

use crate::eval::validation_pass;
use crate::meter::Meter;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DecoderArg {
    Flat,
    Hierarchical,
}

impl From<DecoderArg> for DecoderKind {
    fn from(arg: DecoderArg) -> Self {
        match arg {
            DecoderArg::Flat => DecoderKind::Flat,
            DecoderArg::Hierarchical => DecoderKind::Hierarchical,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum HeadArg {
    Continuous,
    Softmax,
}

impl From<HeadArg> for HeadKind {
    fn from(arg: HeadArg) -> Self {
        match arg {
            HeadArg::Continuous => HeadKind::Continuous,
            HeadArg::Softmax => HeadKind::Softmax,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EncoderArg {
    #[value(name = "densenet121")]
    DenseNet121,
    #[value(name = "efficientnet-b3")]
    EfficientNetB3,
}

impl From<EncoderArg> for EncoderKind {
    fn from(arg: EncoderArg) -> Self {
        match arg {
            EncoderArg::DenseNet121 => EncoderKind::DenseNet121,
            EncoderArg::EfficientNetB3 => EncoderKind::EfficientNetB3,
        }
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Directory holding word2idx.json, encodedCaptions.json,
    /// encodedCaptionsLengths.json and the train/ and val/ image folders.
    #[arg(long)]
    data_dir: PathBuf,

    /// Where checkpoints are written.
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,

    /// Resume from the checkpoint in the output directory.
    #[arg(long)]
    resume: bool,

    #[arg(long, value_enum, default_value_t = DecoderArg::Hierarchical)]
    decoder: DecoderArg,

    #[arg(long, value_enum, default_value_t = HeadArg::Softmax)]
    head: HeadArg,

    #[arg(long, value_enum, default_value_t = EncoderArg::DenseNet121)]
    encoder: EncoderArg,

    /// Seed for batch shuffling and scheduled sampling draws.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    #[arg(long, default_value_t = 20)]
    epochs: usize,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    #[arg(long, default_value_t = 512)]
    embed_dim: usize,

    #[arg(long, default_value_t = 512)]
    attention_dim: usize,

    #[arg(long, default_value_t = 512)]
    decoder_dim: usize,

    #[arg(long, default_value_t = 0.5)]
    dropout: f32,

    /// Number of finding labels predicted by the encoder head.
    #[arg(long, default_value_t = 28)]
    nr_labels: usize,

    /// Longest encoded caption, in tokens.
    #[arg(long, default_value_t = 372)]
    max_size: usize,

    /// Images are resized to this many pixels per side.
    #[arg(long, default_value_t = 224)]
    resolution: usize,

    #[arg(long, default_value_t = 4e-4)]
    decoder_lr: f64,

    #[arg(long, default_value_t = 1e-4)]
    encoder_lr: f64,

    /// Also train the encoder.
    #[arg(long)]
    fine_tune_encoder: bool,

    /// Weight of the doubly stochastic attention term.
    #[arg(long, default_value_t = 1.0)]
    alpha_c: f64,

    /// Weight of the sentence stop term.
    #[arg(long, default_value_t = 1.0)]
    lambda_stop: f64,

    /// Feed ground truth words while decoding.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    teacher_forcing: bool,

    /// Sometimes feed the model its own words instead.
    #[arg(long)]
    scheduled_sampling: bool,

    /// Initial probability of feeding back the model's own word.
    #[arg(long, default_value_t = 0.0)]
    scheduled_sampling_prob: f64,

    /// Probability increment applied every few epochs.
    #[arg(long, default_value_t = 0.05)]
    scheduled_sampling_rate: f64,

    /// Epochs between scheduled sampling increments.
    #[arg(long, default_value_t = 5)]
    scheduled_sampling_epochs: usize,

    /// Average the fed back word with the ground truth embedding.
    #[arg(long)]
    blend_ground_truth: bool,

    /// Pretrained word embeddings in safetensors format.
    #[arg(long)]
    embeddings: Option<PathBuf>,

    /// Scale pretrained embeddings to unit norm.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    normalize_embeddings: bool,

    /// Keep training pretrained embeddings.
    #[arg(long)]
    fine_tune_embeddings: bool,

    /// Stop after this many epochs without validation improvement.
    #[arg(long, default_value_t = 20)]
    early_stop: usize,

    /// Epochs without improvement between learning rate decays.
    #[arg(long, default_value_t = 8)]
    lr_decay_epochs: usize,

    #[arg(long, default_value_t = 0.8)]
    lr_decay_factor: f64,

    /// Batches between progress lines.
    #[arg(long, default_value_t = 5)]
    print_freq: usize,
}

fn load_split(
    args: &TrainArgs,
    split: &str,
    max_size: usize,
    resolution: usize,
) -> candle::Result<ReportDataset> {
    ReportDataset::new(
        &args.data_dir.join("word2idx.json"),
        &args.data_dir.join("encodedCaptions.json"),
        &args.data_dir.join("encodedCaptionsLengths.json"),
        &args.data_dir.join(split),
        max_size,
        resolution,
    )
}

fn vars_except(vars: &VarMap, prefix: &str) -> Vec<Var> {
    vars.data()
        .lock()
        .unwrap()
        .iter()
        .filter(|(name, _)| !name.starts_with(prefix))
        .map(|(_, var)| var.clone())
        .collect()
}

fn decay_learning_rate(opt: &mut AdamW, factor: f64) {
    let lr = opt.learning_rate() * factor;
    println!("decaying the learning rate to {lr:.2e}");
    opt.set_learning_rate(lr);
}

pub fn run(args: &TrainArgs, cpu: bool) -> Result<()> {
    if args.batch_size == 0 {
        anyhow::bail!("the batch size must be at least one")
    }
    if args.lr_decay_epochs == 0 || args.scheduled_sampling_epochs == 0 {
        anyhow::bail!("epoch periods must be at least one")
    }
    let device = crate::device(cpu)?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let resumed = if args.resume {
        Some((
            checkpoint::load_model_config(&args.output_dir)?,
            checkpoint::load_train_state(&args.output_dir)?,
        ))
    } else {
        None
    };
    let (max_size, resolution) = match &resumed {
        Some((config, _)) => (config.max_size, config.resolution),
        None => (args.max_size, args.resolution),
    };
    let train_set = load_split(args, "train", max_size, resolution)?;
    let val_set = load_split(args, "val", max_size, resolution)?;
    println!(
        "loaded {} training and {} validation reports",
        train_set.len(),
        val_set.len()
    );

    let vocab = train_set.vocab();
    let (config, mut state) = match resumed {
        Some((config, state)) => {
            if config.decoder.vocab_size != vocab.len() {
                anyhow::bail!(
                    "the checkpoint was trained with {} words but the vocabulary has {}",
                    config.decoder.vocab_size,
                    vocab.len()
                )
            }
            (config, state)
        }
        None => {
            let config = ModelConfig {
                encoder: args.encoder.into(),
                decoder_kind: args.decoder.into(),
                decoder: DecoderConfig {
                    vocab_size: vocab.len(),
                    embed_dim: args.embed_dim,
                    attention_dim: args.attention_dim,
                    decoder_dim: args.decoder_dim,
                    encoder_dim: EncoderKind::from(args.encoder).encoder_dim(),
                    nr_labels: args.nr_labels,
                    delimiter: vocab.delimiter(),
                    dropout: args.dropout,
                    head: args.head.into(),
                },
                resolution,
                max_size,
            };
            let state = TrainState {
                scheduled_sampling_prob: args.scheduled_sampling_prob,
                ..TrainState::default()
            };
            (config, state)
        }
    };

    let mut encoder_vars = VarMap::new();
    let vb = VarBuilder::from_varmap(&encoder_vars, DType::F32, &device);
    let encoder = ClassifierEncoder::new(config.encoder, config.decoder.nr_labels, vb)?;
    let mut decoder_vars = VarMap::new();
    let vb = VarBuilder::from_varmap(&decoder_vars, DType::F32, &device);
    let decoder = build_decoder(config.decoder_kind, &config.decoder, vb)?;

    if args.resume {
        checkpoint::load_weights(&args.output_dir, &mut encoder_vars, &mut decoder_vars)?;
        println!(
            "resuming from epoch {} with best metric {:.4}",
            state.epoch, state.best_metric
        );
    } else if let Some(path) = &args.embeddings {
        checkpoint::load_pretrained_embeddings(
            &mut decoder_vars,
            path,
            args.normalize_embeddings,
            &device,
        )?;
        println!("loaded pretrained word embeddings from {}", path.display());
    }

    let decoder_params = if args.embeddings.is_some() && !args.fine_tune_embeddings {
        vars_except(&decoder_vars, "embedding.")
    } else {
        decoder_vars.all_vars()
    };
    let mut decoder_opt = AdamW::new_lr(decoder_params, args.decoder_lr)?;
    let mut encoder_opt = if args.fine_tune_encoder {
        Some(AdamW::new_lr(encoder_vars.all_vars(), args.encoder_lr)?)
    } else {
        None
    };

    let weights = LossWeights {
        alpha_c: args.alpha_c,
        lambda_stop: args.lambda_stop,
    };
    for epoch in state.epoch..args.epochs {
        if state.epochs_since_improvement >= args.early_stop {
            println!(
                "no improvement in {} epochs, stopping early",
                state.epochs_since_improvement
            );
            break;
        }
        if state.epochs_since_improvement > 0
            && state.epochs_since_improvement % args.lr_decay_epochs == 0
        {
            decay_learning_rate(&mut decoder_opt, args.lr_decay_factor);
            if let Some(opt) = encoder_opt.as_mut() {
                decay_learning_rate(opt, args.lr_decay_factor);
            }
        }
        if args.scheduled_sampling && epoch > 0 && epoch % args.scheduled_sampling_epochs == 0 {
            state.scheduled_sampling_prob =
                (state.scheduled_sampling_prob + args.scheduled_sampling_rate).min(1.0);
            println!(
                "scheduled sampling probability raised to {:.2}",
                state.scheduled_sampling_prob
            );
        }
        let policy = FeedPolicy {
            teacher_forcing: args.teacher_forcing,
            scheduled_sampling: args
                .scheduled_sampling
                .then_some(state.scheduled_sampling_prob),
            blend_ground_truth: args.blend_ground_truth,
        };

        let mut order: Vec<usize> = (0..train_set.len()).collect();
        order.shuffle(&mut rng);
        let batches =
            Batcher::new(order.iter().map(|&i| train_set.get(i))).batch_size(args.batch_size);
        let mut losses = Meter::new();
        for (i, batch) in batches.enumerate() {
            let batch = batch?;
            let images = batch.images.to_device(&device)?;
            let captions = batch.captions.to_device(&device)?;
            let encoded = encoder.forward(&images)?;
            let out = decoder.forward_t(
                &encoded,
                &captions,
                &batch.lengths,
                &policy,
                &mut rng,
                true,
            )?;
            let loss = decoding_loss(decoder.as_ref(), &out, &weights)?;
            let grads = loss.backward()?;
            decoder_opt.step(&grads)?;
            if let Some(opt) = encoder_opt.as_mut() {
                opt.step(&grads)?;
            }
            let words: usize = out.decode_lengths.iter().sum();
            losses.update(f64::from(loss.to_vec0::<f32>()?), words);
            if i % args.print_freq == 0 {
                println!(
                    "epoch {epoch} batch {i}: loss {:.4}, avg {:.4}",
                    losses.value(),
                    losses.average()
                );
            }
        }

        let (val_loss, _, _) = validation_pass(
            &encoder,
            decoder.as_ref(),
            &val_set,
            args.batch_size,
            &weights,
            &device,
        )?;
        println!(
            "epoch {epoch}: train loss {:.4}, validation loss {val_loss:.4}",
            losses.average()
        );

        let metric = -val_loss;
        let is_best = metric > state.best_metric;
        if is_best {
            state.best_metric = metric;
            state.epochs_since_improvement = 0;
        } else {
            state.epochs_since_improvement += 1;
            println!(
                "epochs since the last improvement: {}",
                state.epochs_since_improvement
            );
        }
        state.epoch = epoch + 1;
        checkpoint::save_checkpoint(
            &args.output_dir,
            &encoder_vars,
            &decoder_vars,
            &config,
            &state,
            is_best,
        )?;
    }
    println!("finished, best validation loss {:.4}", -state.best_metric);
    Ok(())
}
