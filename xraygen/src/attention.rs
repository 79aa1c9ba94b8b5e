//! Additive attention over image positions and over label scores.

use candle::{Module, Result, Tensor};
use candle_nn::ops::softmax;
use candle_nn::{linear, Linear, VarBuilder};

/// Additive attention over the encoder feature grid.
#[derive(Debug, Clone)]
pub struct Attention {
    encoder_att: Linear,
    decoder_att: Linear,
    full_att: Linear,
    span: tracing::Span,
}

impl Attention {
    pub fn new(
        encoder_dim: usize,
        decoder_dim: usize,
        attention_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let encoder_att = linear(encoder_dim, attention_dim, vb.pp("encoder_att"))?;
        let decoder_att = linear(decoder_dim, attention_dim, vb.pp("decoder_att"))?;
        let full_att = linear(attention_dim, 1, vb.pp("full_att"))?;
        let span = tracing::span!(tracing::Level::TRACE, "attention");
        Ok(Self {
            encoder_att,
            decoder_att,
            full_att,
            span,
        })
    }

    /// Scores every position of `features`, `(batch, positions, encoder_dim)`,
    /// against the decoder state `hidden`, `(batch, decoder_dim)`. Returns the
    /// attention weighted context `(batch, encoder_dim)` and the weights
    /// `(batch, positions)`.
    pub fn forward(&self, features: &Tensor, hidden: &Tensor) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let att1 = self.encoder_att.forward(features)?;
        let att2 = self.decoder_att.forward(hidden)?;
        let att = att1.broadcast_add(&att2.unsqueeze(1)?)?.relu()?;
        let scores = self.full_att.forward(&att)?.squeeze(2)?;
        let alpha = softmax(&scores, 1)?;
        let context = features.broadcast_mul(&alpha.unsqueeze(2)?)?.sum(1)?;
        Ok((context, alpha))
    }
}

/// Additive attention over the label scores of the classifying encoder.
///
/// Each label plays the role of an image position with its probability as a
/// one dimensional feature, so the context reweights the label probabilities
/// instead of mixing feature vectors.
#[derive(Debug, Clone)]
pub struct LabelAttention {
    label_att: Linear,
    decoder_att: Linear,
    full_att: Linear,
    span: tracing::Span,
}

impl LabelAttention {
    pub fn new(decoder_dim: usize, attention_dim: usize, vb: VarBuilder) -> Result<Self> {
        let label_att = linear(1, attention_dim, vb.pp("label_att"))?;
        let decoder_att = linear(decoder_dim, attention_dim, vb.pp("decoder_att"))?;
        let full_att = linear(attention_dim, 1, vb.pp("full_att"))?;
        let span = tracing::span!(tracing::Level::TRACE, "label-attention");
        Ok(Self {
            label_att,
            decoder_att,
            full_att,
            span,
        })
    }

    /// `probs` is `(batch, nr_labels)` and `hidden` is `(batch, decoder_dim)`.
    /// Returns the reweighted probabilities and the attention weights, both
    /// `(batch, nr_labels)`.
    pub fn forward(&self, probs: &Tensor, hidden: &Tensor) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let att1 = self.label_att.forward(&probs.unsqueeze(2)?)?;
        let att2 = self.decoder_att.forward(hidden)?;
        let att = att1.broadcast_add(&att2.unsqueeze(1)?)?.relu()?;
        let scores = self.full_att.forward(&att)?.squeeze(2)?;
        let alpha = softmax(&scores, 1)?;
        let context = (probs * &alpha)?;
        Ok((context, alpha))
    }
}
