//! Word level and hierarchical report decoders.
//!
//! Both decoders sort their batch by decreasing caption length and step only
//! the still active prefix at each timestep, so a batch shrinks as its
//! shorter captions run out. Predictions are padded back with zeros to a
//! dense `(batch, steps, out)` tensor.

mod flat;
mod hierarchical;

pub use flat::FlatDecoder;
pub use hierarchical::HierarchicalDecoder;

use candle::{Device, Result, Tensor, D};
use candle_nn::rnn::LSTMState;
use candle_nn::{linear, Embedding, Linear, Module, VarBuilder};
use rand::rngs::StdRng;
use rand::Rng;

use crate::encoder::EncoderOutput;
use crate::generation::GenerationConfig;
use xraygen_data::Vocabulary;

/// How the word level input for the next timestep is produced during
/// training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedPolicy {
    /// Feed the ground truth token for the next step.
    pub teacher_forcing: bool,
    /// Probability of feeding the model its own pick even under teacher
    /// forcing.
    pub scheduled_sampling: Option<f64>,
    /// Average the model pick with the ground truth embedding when self
    /// feeding.
    pub blend_ground_truth: bool,
}

/// Always feed the reference tokens.
pub const TEACHER_FORCING: FeedPolicy = FeedPolicy {
    teacher_forcing: true,
    scheduled_sampling: None,
    blend_ground_truth: false,
};

/// Always feed the model its own predictions.
pub const FREE_RUNNING: FeedPolicy = FeedPolicy {
    teacher_forcing: false,
    scheduled_sampling: None,
    blend_ground_truth: false,
};

impl FeedPolicy {
    /// Whether the current step feeds back the model's own output.
    pub fn feed_back(&self, rng: &mut StdRng) -> bool {
        !self.teacher_forcing
            || match self.scheduled_sampling {
                Some(p) => rng.random::<f64>() < p,
                None => false,
            }
    }
}

/// What the word level head predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadKind {
    /// A point in word embedding space, trained with a cosine loss and
    /// decoded through its nearest embedding.
    Continuous,
    /// Vocabulary logits, trained with cross entropy.
    Softmax,
}

/// The projection from decoder states to word predictions.
#[derive(Debug, Clone)]
pub enum OutputHead {
    Continuous(Linear),
    Softmax(Linear),
}

impl OutputHead {
    pub fn new(
        kind: HeadKind,
        decoder_dim: usize,
        embed_dim: usize,
        vocab_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        match kind {
            HeadKind::Continuous => Ok(Self::Continuous(linear(decoder_dim, embed_dim, vb)?)),
            HeadKind::Softmax => Ok(Self::Softmax(linear(decoder_dim, vocab_size, vb)?)),
        }
    }

    pub fn kind(&self) -> HeadKind {
        match self {
            Self::Continuous(_) => HeadKind::Continuous,
            Self::Softmax(_) => HeadKind::Softmax,
        }
    }

    /// Projects decoder states `(n, decoder_dim)` to predictions.
    pub fn predict(&self, hidden: &Tensor) -> Result<Tensor> {
        match self {
            Self::Continuous(fc) | Self::Softmax(fc) => fc.forward(hidden),
        }
    }

    /// Picks one token id per row from raw predictions, by nearest embedding
    /// for the continuous head and by argmax for the softmax head.
    pub fn pick_tokens(&self, preds: &Tensor, embeddings: &Tensor) -> Result<Tensor> {
        match self {
            Self::Continuous(_) => nearest_embedding(preds, embeddings),
            Self::Softmax(_) => preds.argmax(D::Minus1),
        }
    }
}

/// Decoder family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    Flat,
    Hierarchical,
}

/// Hyper parameters shared by both decoder families.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub attention_dim: usize,
    pub decoder_dim: usize,
    pub encoder_dim: usize,
    pub nr_labels: usize,
    /// Token id of the sentence delimiter.
    pub delimiter: u32,
    pub dropout: f32,
    pub head: HeadKind,
}

/// Everything a training step needs from one decoder pass.
pub struct DecodeOutput {
    /// `(batch, steps, out)` predictions, zero filled past each row's decode
    /// length.
    pub predictions: Tensor,
    /// The captions reordered by decreasing length, `(batch, max_size)`.
    pub captions: Tensor,
    /// Per row number of prediction slots, caption length minus one.
    pub decode_lengths: Vec<usize>,
    /// Visual attention weights per attention step, `(batch, steps, positions)`
    /// for the flat decoder and `(batch, sentences, positions)` for the
    /// hierarchical one, zero filled past each row's steps.
    pub alphas: Tensor,
    /// The permutation that sorted the batch.
    pub sort_ind: Vec<u32>,
    /// Sentence stop logits `(batch, sentences)` from the hierarchical
    /// decoder.
    pub stops: Option<Tensor>,
    /// Per row sentence counts matching `stops`.
    pub sentence_counts: Option<Vec<usize>>,
}

impl DecodeOutput {
    pub fn max_decode(&self) -> usize {
        self.decode_lengths.iter().copied().max().unwrap_or(0)
    }
}

/// A report decoder.
pub trait Decoder {
    /// Decodes a batch against its reference captions, stepping the recurrent
    /// cells with teacher forced or self fed inputs per `policy`.
    fn forward_t(
        &self,
        encoded: &EncoderOutput,
        captions: &Tensor,
        lengths: &[usize],
        policy: &FeedPolicy,
        rng: &mut StdRng,
        train: bool,
    ) -> Result<DecodeOutput>;

    /// Generates a token sequence per image, free running.
    fn generate(
        &self,
        encoded: &EncoderOutput,
        vocab: &Vocabulary,
        config: &GenerationConfig,
    ) -> Result<Vec<Vec<u32>>>;

    fn head_kind(&self) -> HeadKind;

    /// The `(vocab, embed_dim)` word embedding table.
    fn embeddings(&self) -> &Tensor;
}

/// Builds the decoder family picked by `kind`.
pub fn build_decoder(
    kind: DecoderKind,
    config: &DecoderConfig,
    vb: VarBuilder,
) -> Result<Box<dyn Decoder>> {
    let decoder: Box<dyn Decoder> = match kind {
        DecoderKind::Flat => Box::new(FlatDecoder::new(config, vb)?),
        DecoderKind::Hierarchical => Box::new(HierarchicalDecoder::new(config, vb)?),
    };
    Ok(decoder)
}

/// The id of the embedding row closest in cosine similarity to each predicted
/// vector. `preds` is `(n, embed_dim)` and `embeddings` is the
/// `(vocab, embed_dim)` table.
pub fn nearest_embedding(preds: &Tensor, embeddings: &Tensor) -> Result<Tensor> {
    let preds = normalize_l2(preds)?;
    let embeddings = normalize_l2(embeddings)?;
    let similarities = preds.matmul(&embeddings.t()?)?;
    similarities.argmax(D::Minus1)
}

/// Rows scaled to unit euclidean norm.
pub fn normalize_l2(xs: &Tensor) -> Result<Tensor> {
    xs.broadcast_div(&xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)
}

/// Inverts the permutation recorded in [`DecodeOutput::sort_ind`], mapping
/// each original row to its position in the sorted batch.
pub fn inverse_permutation(sort_ind: &[u32]) -> Vec<u32> {
    let mut inverse = vec![0u32; sort_ind.len()];
    for (pos, &src) in sort_ind.iter().enumerate() {
        inverse[src as usize] = pos as u32;
    }
    inverse
}

/// Sorts batch indices by decreasing length, ties keeping their original
/// order. Returns the permutation and the sorted lengths.
fn sort_by_length(lengths: &[usize]) -> (Vec<u32>, Vec<usize>) {
    let mut indices: Vec<u32> = (0..lengths.len() as u32).collect();
    indices.sort_by_key(|&i| std::cmp::Reverse(lengths[i as usize]));
    let sorted = indices.iter().map(|&i| lengths[i as usize]).collect();
    (indices, sorted)
}

/// Zero pads the leading dimension of `xs`, a prefix of the batch, back to
/// the full batch size.
fn pad_rows(xs: &Tensor, batch_size: usize) -> Result<Tensor> {
    let n = xs.dim(0)?;
    if n == batch_size {
        return Ok(xs.clone());
    }
    let mut dims = xs.dims().to_vec();
    dims[0] = batch_size - n;
    let zeros = Tensor::zeros(dims, xs.dtype(), xs.device())?;
    Tensor::cat(&[xs, &zeros], 0)
}

/// Narrows an LSTM state to the first `len` rows of its batch.
fn narrow_state(state: &LSTMState, len: usize) -> Result<LSTMState> {
    Ok(LSTMState {
        h: state.h.narrow(0, 0, len)?,
        c: state.c.narrow(0, 0, len)?,
    })
}

/// Embeds one token id per row. The gather stays on the autograd path so
/// gradients reach the embedding table.
fn embed_tokens(embedding: &Embedding, tokens: &[u32], device: &Device) -> Result<Tensor> {
    let ids = Tensor::from_slice(tokens, tokens.len(), device)?;
    embedding.forward(&ids)
}
