//! Training losses for report decoders.
//!
//! Predictions arrive zero padded to a dense `(batch, steps, out)` tensor, so
//! every loss first packs the valid slots of each row into one flat batch and
//! averages over that.

use candle::{IndexOp, Result, Tensor, D};

use crate::decoder::{normalize_l2, DecodeOutput, Decoder, HeadKind};

/// Loss weighting knobs.
#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    /// Weight of the doubly stochastic attention term.
    pub alpha_c: f64,
    /// Weight of the sentence stop term of the hierarchical decoder.
    pub lambda_stop: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            alpha_c: 1.0,
            lambda_stop: 1.0,
        }
    }
}

/// Concatenates the first `lengths[r]` steps of every row of a
/// `(batch, steps, ..)` tensor into a single `(sum(lengths), ..)` tensor.
pub fn pack_rows(xs: &Tensor, lengths: &[usize]) -> Result<Tensor> {
    let mut parts = Vec::with_capacity(lengths.len());
    for (r, &len) in lengths.iter().enumerate() {
        if len == 0 {
            continue;
        }
        parts.push(xs.i(r)?.narrow(0, 0, len)?);
    }
    if parts.is_empty() {
        candle::bail!("cannot pack a batch without any valid steps")
    }
    Tensor::cat(&parts, 0)
}

/// Cross entropy over the valid word slots. `predictions` holds
/// `(batch, steps, vocab)` logits and `targets` the `(batch, steps)` token
/// ids.
pub fn word_cross_entropy(
    predictions: &Tensor,
    targets: &Tensor,
    lengths: &[usize],
) -> Result<Tensor> {
    let predictions = pack_rows(predictions, lengths)?;
    let targets = pack_rows(targets, lengths)?;
    candle_nn::loss::cross_entropy(&predictions, &targets)
}

/// One minus the cosine similarity between predicted and target embeddings,
/// averaged over the valid word slots. Both tensors are
/// `(batch, steps, embed_dim)`.
pub fn cosine_embedding(
    predictions: &Tensor,
    targets: &Tensor,
    lengths: &[usize],
) -> Result<Tensor> {
    let predictions = normalize_l2(&pack_rows(predictions, lengths)?)?;
    let targets = normalize_l2(&pack_rows(targets, lengths)?)?;
    let cos = (predictions * targets)?.sum(D::Minus1)?;
    cos.affine(-1., 1.)?.mean_all()
}

/// Binary cross entropy on the sentence stop logits. The target is one at
/// each row's last sentence and zero before it; slots past a row's sentence
/// count are ignored.
pub fn stop_bce(stop_logits: &Tensor, sentence_counts: &[usize]) -> Result<Tensor> {
    let device = stop_logits.device();
    let mut logits = Vec::with_capacity(sentence_counts.len());
    let mut targets = Vec::with_capacity(sentence_counts.len());
    for (r, &count) in sentence_counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        logits.push(stop_logits.i(r)?.narrow(0, 0, count)?);
        let mut t = vec![0f32; count];
        t[count - 1] = 1.;
        targets.push(Tensor::from_vec(t, count, device)?);
    }
    if logits.is_empty() {
        candle::bail!("cannot compute a stop loss without sentences")
    }
    let logits = Tensor::cat(&logits, 0)?;
    let targets = Tensor::cat(&targets, 0)?;
    candle_nn::loss::binary_cross_entropy_with_logit(&logits, &targets)
}

/// Doubly stochastic attention regularizer, pushing the weights each
/// position receives to sum to one across attention steps.
pub fn attention_regularization(alphas: &Tensor) -> Result<Tensor> {
    alphas.sum(1)?.affine(-1., 1.)?.sqr()?.mean_all()
}

/// The full training loss for one decoded batch: the word loss matching the
/// decoder head, the attention regularizer, and the stop loss when the
/// decoder emits stop logits.
pub fn decoding_loss<T: Decoder + ?Sized>(
    decoder: &T,
    output: &DecodeOutput,
    weights: &LossWeights,
) -> Result<Tensor> {
    let max_decode = output.max_decode();
    // Each prediction slot is scored against the following token.
    let targets = output.captions.narrow(1, 1, max_decode)?;
    let mut loss = match decoder.head_kind() {
        HeadKind::Softmax => {
            word_cross_entropy(&output.predictions, &targets, &output.decode_lengths)?
        }
        HeadKind::Continuous => {
            let table = decoder.embeddings();
            let (_vocab, embed_dim) = table.dims2()?;
            let (b, steps) = targets.dims2()?;
            let target_embeddings = table
                .index_select(&targets.flatten_all()?, 0)?
                .reshape((b, steps, embed_dim))?;
            cosine_embedding(&output.predictions, &target_embeddings, &output.decode_lengths)?
        }
    };
    if weights.alpha_c != 0. {
        let reg = attention_regularization(&output.alphas)?;
        loss = (loss + (reg * weights.alpha_c)?)?;
    }
    if let (Some(stops), Some(counts)) = (&output.stops, &output.sentence_counts) {
        if weights.lambda_stop != 0. {
            let stop = stop_bce(stops, counts)?;
            loss = (loss + (stop * weights.lambda_stop)?)?;
        }
    }
    Ok(loss)
}
