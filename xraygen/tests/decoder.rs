#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use candle::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use xraygen::decoder::{
    build_decoder, Decoder, DecoderConfig, DecoderKind, FeedPolicy, HeadKind, FREE_RUNNING,
    TEACHER_FORCING,
};
use xraygen::encoder::EncoderOutput;
use xraygen::generation::GenerationConfig;

fn config(head: HeadKind) -> DecoderConfig {
    DecoderConfig {
        vocab_size: 12,
        embed_dim: 6,
        attention_dim: 5,
        decoder_dim: 7,
        encoder_dim: 4,
        nr_labels: 3,
        delimiter: 4,
        dropout: 0.0,
        head,
    }
}

fn decoder(kind: DecoderKind, head: HeadKind) -> Result<Box<dyn Decoder>> {
    let vm = VarMap::new();
    let vb = VarBuilder::from_varmap(&vm, DType::F32, &Device::Cpu);
    build_decoder(kind, &config(head), vb)
}

fn encoded(batch: usize) -> Result<EncoderOutput> {
    let features = Tensor::randn(0f32, 1f32, (batch, 9, 4), &Device::Cpu)?;
    let label_logits = Tensor::randn(0f32, 1f32, (batch, 3), &Device::Cpu)?;
    Ok(EncoderOutput { features, label_logits })
}

/* <sos> is 1, <eoc> is 2 and the sentence delimiter is 4. The first report
has two sentences, the other two a single one, and the rows arrive unsorted
by length on purpose. */
fn caption_batch() -> Result<(Tensor, Vec<usize>)> {
    let rows: [[u32; 8]; 3] = [
        [1, 5, 6, 4, 7, 4, 2, 0],
        [1, 5, 4, 2, 0, 0, 0, 0],
        [1, 6, 7, 8, 4, 2, 0, 0],
    ];
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    let captions = Tensor::from_vec(flat, (3, 8), &Device::Cpu)?;
    Ok((captions, vec![7, 4, 6]))
}

fn sum_abs(xs: &Tensor) -> Result<f32> {
    xs.abs()?.sum_all()?.to_vec0::<f32>()
}

#[test]
fn flat_decoder_shapes_and_padding() -> Result<()> {
    let decoder = decoder(DecoderKind::Flat, HeadKind::Softmax)?;
    let (captions, lengths) = caption_batch()?;
    let mut rng = StdRng::seed_from_u64(0);
    let out = decoder.forward_t(
        &encoded(3)?,
        &captions,
        &lengths,
        &TEACHER_FORCING,
        &mut rng,
        true,
    )?;
    assert_eq!(out.predictions.dims(), [3, 6, 12]);
    assert_eq!(out.alphas.dims(), [3, 6, 9]);
    assert_eq!(out.decode_lengths, [6, 5, 3]);
    assert_eq!(out.sort_ind, [0, 2, 1]);
    assert_eq!(out.max_decode(), 6);
    assert!(out.stops.is_none());
    assert!(out.sentence_counts.is_none());
    // Rows are reordered alongside the lengths.
    assert_eq!(out.captions.i(1)?.to_vec1::<u32>()?, [1, 6, 7, 8, 4, 2, 0, 0]);
    // Steps past a row's decode length stay zeroed out.
    assert_eq!(sum_abs(&out.predictions.i(2)?.narrow(0, 3, 3)?)?, 0.);
    assert_eq!(sum_abs(&out.alphas.i(2)?.narrow(0, 3, 3)?)?, 0.);
    assert!(sum_abs(&out.predictions.i(2)?.narrow(0, 0, 3)?)? > 0.);
    // Active attention steps are distributions over the positions.
    let sum = out.alphas.i((0, 0))?.sum_all()?.to_vec0::<f32>()?;
    assert!((sum - 1.0).abs() < 1e-5);
    Ok(())
}

#[test]
fn flat_decoder_continuous_head() -> Result<()> {
    let decoder = decoder(DecoderKind::Flat, HeadKind::Continuous)?;
    assert_eq!(decoder.head_kind(), HeadKind::Continuous);
    assert_eq!(decoder.embeddings().dims(), [12, 6]);
    let (captions, lengths) = caption_batch()?;
    let mut rng = StdRng::seed_from_u64(0);
    let out = decoder.forward_t(
        &encoded(3)?,
        &captions,
        &lengths,
        &TEACHER_FORCING,
        &mut rng,
        true,
    )?;
    // The continuous head predicts embedding vectors rather than logits.
    assert_eq!(out.predictions.dims(), [3, 6, 6]);
    Ok(())
}

#[test]
fn hierarchical_decoder_shapes_and_masking() -> Result<()> {
    let decoder = decoder(DecoderKind::Hierarchical, HeadKind::Softmax)?;
    let (captions, lengths) = caption_batch()?;
    let mut rng = StdRng::seed_from_u64(0);
    let out = decoder.forward_t(
        &encoded(3)?,
        &captions,
        &lengths,
        &TEACHER_FORCING,
        &mut rng,
        true,
    )?;
    assert_eq!(out.predictions.dims(), [3, 6, 12]);
    assert_eq!(out.decode_lengths, [6, 5, 3]);
    assert_eq!(out.sort_ind, [0, 2, 1]);
    assert_eq!(out.sentence_counts.as_deref(), Some(&[2, 1, 1][..]));
    // One attention map and one stop logit per sentence step.
    assert_eq!(out.alphas.dims(), [3, 2, 9]);
    let stops = out.stops.as_ref().unwrap();
    assert_eq!(stops.dims(), [3, 2]);
    // Rows without a second sentence have their attention masked there.
    assert_eq!(sum_abs(&out.alphas.i((1, 1))?)?, 0.);
    assert_eq!(sum_abs(&out.alphas.i((2, 1))?)?, 0.);
    assert!(sum_abs(&out.alphas.i((0, 1))?)? > 0.);
    // Word steps past a row's decode length stay zeroed out.
    assert_eq!(sum_abs(&out.predictions.i(1)?.narrow(0, 5, 1)?)?, 0.);
    assert_eq!(sum_abs(&out.predictions.i(2)?.narrow(0, 3, 3)?)?, 0.);
    Ok(())
}

/* Editing a word inside the first sentence must not leak into the second
sentence under teacher forcing: the sentence state only sees attention
contexts and the word state is reset per sentence. */
#[test]
fn hierarchical_sentences_are_isolated() -> Result<()> {
    let decoder = decoder(DecoderKind::Hierarchical, HeadKind::Softmax)?;
    let enc = encoded(3)?;
    let (captions, lengths) = caption_batch()?;
    let edited = {
        let mut rows = captions.to_vec2::<u32>()?;
        rows[0][1] = 9;
        let flat: Vec<u32> = rows.into_iter().flatten().collect();
        Tensor::from_vec(flat, (3, 8), &Device::Cpu)?
    };
    let mut rng = StdRng::seed_from_u64(0);
    let out_a = decoder.forward_t(&enc, &captions, &lengths, &TEACHER_FORCING, &mut rng, true)?;
    let mut rng = StdRng::seed_from_u64(0);
    let out_b = decoder.forward_t(&enc, &edited, &lengths, &TEACHER_FORCING, &mut rng, true)?;
    let row_a = out_a.predictions.i(0)?;
    let row_b = out_b.predictions.i(0)?;
    // The first word step feeds <sos> from a fresh state either way.
    assert_eq!(
        row_a.i(0)?.to_vec1::<f32>()?,
        row_b.i(0)?.to_vec1::<f32>()?
    );
    // The remaining first-sentence steps see the edited token.
    assert_ne!(
        row_a.narrow(0, 1, 2)?.to_vec2::<f32>()?,
        row_b.narrow(0, 1, 2)?.to_vec2::<f32>()?
    );
    // The second sentence is untouched by it.
    assert_eq!(
        row_a.narrow(0, 3, 3)?.to_vec2::<f32>()?,
        row_b.narrow(0, 3, 3)?.to_vec2::<f32>()?
    );
    Ok(())
}

#[test]
fn feed_policies_match_their_extremes() -> Result<()> {
    let decoder = decoder(DecoderKind::Flat, HeadKind::Softmax)?;
    let enc = encoded(3)?;
    let (captions, lengths) = caption_batch()?;
    let always = FeedPolicy {
        teacher_forcing: true,
        scheduled_sampling: Some(1.0),
        blend_ground_truth: false,
    };
    let never = FeedPolicy {
        teacher_forcing: true,
        scheduled_sampling: Some(0.0),
        blend_ground_truth: false,
    };
    let run = |policy: &FeedPolicy| -> Result<Vec<Vec<Vec<f32>>>> {
        let mut rng = StdRng::seed_from_u64(0);
        let out = decoder.forward_t(&enc, &captions, &lengths, policy, &mut rng, true)?;
        out.predictions.to_vec3::<f32>()
    };
    // Sampling with probability one always feeds the model its own words.
    assert_eq!(run(&always)?, run(&FREE_RUNNING)?);
    // Sampling with probability zero degenerates to teacher forcing.
    assert_eq!(run(&never)?, run(&TEACHER_FORCING)?);
    assert_ne!(run(&always)?, run(&never)?);
    Ok(())
}

#[test]
fn free_running_ignores_the_reference_tail() -> Result<()> {
    let decoder = decoder(DecoderKind::Flat, HeadKind::Softmax)?;
    let enc = encoded(3)?;
    let (captions, lengths) = caption_batch()?;
    let edited = {
        let mut rows = captions.to_vec2::<u32>()?;
        rows[0][2] = 10;
        rows[2][3] = 11;
        let flat: Vec<u32> = rows.into_iter().flatten().collect();
        Tensor::from_vec(flat, (3, 8), &Device::Cpu)?
    };
    let mut rng = StdRng::seed_from_u64(0);
    let out_a = decoder.forward_t(&enc, &captions, &lengths, &FREE_RUNNING, &mut rng, true)?;
    let mut rng = StdRng::seed_from_u64(0);
    let out_b = decoder.forward_t(&enc, &edited, &lengths, &FREE_RUNNING, &mut rng, true)?;
    // Only the <sos> column is ever read, so the outputs agree exactly.
    assert_eq!(
        out_a.predictions.to_vec3::<f32>()?,
        out_b.predictions.to_vec3::<f32>()?
    );
    let mut rng = StdRng::seed_from_u64(0);
    let forced = decoder.forward_t(&enc, &edited, &lengths, &TEACHER_FORCING, &mut rng, true)?;
    assert_ne!(
        out_b.predictions.to_vec3::<f32>()?,
        forced.predictions.to_vec3::<f32>()?
    );
    Ok(())
}

#[test]
fn rejects_malformed_batches() -> Result<()> {
    let flat = decoder(DecoderKind::Flat, HeadKind::Softmax)?;
    let hierarchical = decoder(DecoderKind::Hierarchical, HeadKind::Softmax)?;
    let enc = encoded(3)?;
    let (captions, lengths) = caption_batch()?;
    let mut rng = StdRng::seed_from_u64(0);
    // One length per caption row.
    assert!(flat
        .forward_t(&enc, &captions, &lengths[..2], &TEACHER_FORCING, &mut rng, true)
        .is_err());
    // A caption of a single token has nothing to decode.
    assert!(flat
        .forward_t(&enc, &captions, &[7, 1, 6], &TEACHER_FORCING, &mut rng, true)
        .is_err());
    // Lengths cannot exceed the caption width.
    assert!(flat
        .forward_t(&enc, &captions, &[9, 4, 6], &TEACHER_FORCING, &mut rng, true)
        .is_err());
    assert!(hierarchical
        .forward_t(&enc, &captions, &[9, 4, 6], &TEACHER_FORCING, &mut rng, true)
        .is_err());
    Ok(())
}

#[test]
fn generation_respects_the_budget() -> Result<()> {
    let vocab = test_vocab()?;
    let config = GenerationConfig {
        stop_threshold: 0.5,
        max_sentences: 2,
        max_words: 4,
    };
    let enc = encoded(2)?;
    for kind in [DecoderKind::Flat, DecoderKind::Hierarchical] {
        let decoder = decoder(kind, HeadKind::Softmax)?;
        let reports = decoder.generate(&enc, &vocab, &config)?;
        assert_eq!(reports.len(), 2);
        for tokens in &reports {
            assert!(tokens.len() <= 8);
            assert!(tokens.iter().all(|&t| t < 12));
        }
    }
    Ok(())
}

fn test_vocab() -> Result<xraygen_data::Vocabulary> {
    let words = [
        "<pad>", "<sos>", "<eoc>", "<unk>", ".", "the", "lung", "is", "clear", "heart", "normal",
        "left",
    ];
    let map: std::collections::HashMap<String, u32> = words
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), i as u32))
        .collect();
    xraygen_data::Vocabulary::from_word2idx(map)
}
