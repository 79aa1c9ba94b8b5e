//! The flat word level decoder, in the show-attend-tell mould.

use candle::{IndexOp, Result, Tensor};
use candle_nn::rnn::{lstm, LSTMConfig, LSTMState, LSTM, RNN};
use candle_nn::{embedding, linear, Dropout, Embedding, Linear, Module, VarBuilder};
use rand::rngs::StdRng;

use super::{
    embed_tokens, narrow_state, pad_rows, sort_by_length, DecodeOutput, Decoder, DecoderConfig,
    FeedPolicy, HeadKind, OutputHead,
};
use crate::attention::Attention;
use crate::encoder::EncoderOutput;
use crate::generation::GenerationConfig;
use xraygen_data::Vocabulary;

/// Emits the report word by word, attending over the feature grid before
/// every step. The visual context is gated by a sigmoid over the previous
/// state before it enters the cell.
pub struct FlatDecoder {
    attention: Attention,
    embedding: Embedding,
    rnn: LSTM,
    init_h: Linear,
    init_c: Linear,
    f_beta: Linear,
    head: OutputHead,
    dropout: Dropout,
    span: tracing::Span,
}

impl FlatDecoder {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let attention = Attention::new(
            cfg.encoder_dim,
            cfg.decoder_dim,
            cfg.attention_dim,
            vb.pp("attention"),
        )?;
        let embedding = embedding(cfg.vocab_size, cfg.embed_dim, vb.pp("embedding"))?;
        let rnn = lstm(
            cfg.embed_dim + cfg.encoder_dim,
            cfg.decoder_dim,
            LSTMConfig::default(),
            vb.pp("decode_step"),
        )?;
        let init_h = linear(cfg.encoder_dim, cfg.decoder_dim, vb.pp("init_h"))?;
        let init_c = linear(cfg.encoder_dim, cfg.decoder_dim, vb.pp("init_c"))?;
        let f_beta = linear(cfg.decoder_dim, cfg.encoder_dim, vb.pp("f_beta"))?;
        let head = OutputHead::new(
            cfg.head,
            cfg.decoder_dim,
            cfg.embed_dim,
            cfg.vocab_size,
            vb.pp("fc"),
        )?;
        let dropout = Dropout::new(cfg.dropout);
        let span = tracing::span!(tracing::Level::TRACE, "flat-decoder");
        Ok(Self {
            attention,
            embedding,
            rnn,
            init_h,
            init_c,
            f_beta,
            head,
            dropout,
            span,
        })
    }

    /// The initial cell state, projected from the mean encoder feature.
    fn init_state(&self, features: &Tensor) -> Result<LSTMState> {
        let mean = features.mean(1)?;
        Ok(LSTMState {
            h: self.init_h.forward(&mean)?,
            c: self.init_c.forward(&mean)?,
        })
    }

    /// One timestep: attend, gate, step the cell, project.
    fn step(
        &self,
        features: &Tensor,
        input: &Tensor,
        state: &LSTMState,
    ) -> Result<(LSTMState, Tensor)> {
        let (context, alpha) = self.attention.forward(features, &state.h)?;
        let gate = candle_nn::ops::sigmoid(&self.f_beta.forward(&state.h)?)?;
        let context = (gate * context)?;
        let rnn_in = Tensor::cat(&[input, &context], 1)?;
        let state = self.rnn.step(&rnn_in, state)?;
        Ok((state, alpha))
    }
}

impl Decoder for FlatDecoder {
    fn forward_t(
        &self,
        encoded: &EncoderOutput,
        captions: &Tensor,
        lengths: &[usize],
        policy: &FeedPolicy,
        rng: &mut StdRng,
        train: bool,
    ) -> Result<DecodeOutput> {
        let _enter = self.span.enter();
        let (batch_size, _positions, _encoder_dim) = encoded.features.dims3()?;
        if lengths.len() != batch_size {
            candle::bail!(
                "got {} caption lengths for a batch of {batch_size}",
                lengths.len()
            )
        }
        if let Some(short) = lengths.iter().find(|&&l| l < 2) {
            candle::bail!(
                "cannot decode a caption of length {short}, need at least <sos> and one more token"
            )
        }
        let (sort_ind, lengths) = sort_by_length(lengths);
        let columns = captions.dim(1)?;
        if lengths[0] > columns {
            candle::bail!(
                "caption length {} exceeds the {columns} caption columns",
                lengths[0]
            )
        }
        let index = Tensor::from_slice(&sort_ind, batch_size, encoded.features.device())?;
        let features = encoded.features.index_select(&index, 0)?;
        let captions = captions.index_select(&index, 0)?;
        let embeddings = self.embedding.forward(&captions)?;
        let decode_lengths: Vec<usize> = lengths.iter().map(|l| l - 1).collect();
        let max_decode = decode_lengths[0];

        let mut state = self.init_state(&features)?;
        let mut input = embeddings.i((.., 0))?;
        let mut step_preds = Vec::with_capacity(max_decode);
        let mut step_alphas = Vec::with_capacity(max_decode);
        for t in 0..max_decode {
            let bt = decode_lengths.iter().filter(|&&l| l > t).count();
            let (state_t, alpha) = self.step(
                &features.narrow(0, 0, bt)?,
                &input.narrow(0, 0, bt)?,
                &narrow_state(&state, bt)?,
            )?;
            let preds = self
                .head
                .predict(&self.dropout.forward(&state_t.h, train)?)?;
            step_preds.push(pad_rows(&preds, batch_size)?);
            step_alphas.push(pad_rows(&alpha, batch_size)?);
            input = if policy.feed_back(rng) {
                let tokens = self.head.pick_tokens(&preds, self.embedding.embeddings())?;
                let picked = self.embedding.forward(&tokens)?;
                if policy.blend_ground_truth {
                    ((picked + embeddings.i((..bt, t + 1))?)? * 0.5)?
                } else {
                    picked
                }
            } else {
                embeddings.i((..bt, t + 1))?
            };
            state = state_t;
        }

        Ok(DecodeOutput {
            predictions: Tensor::stack(&step_preds, 1)?,
            captions,
            decode_lengths,
            alphas: Tensor::stack(&step_alphas, 1)?,
            sort_ind,
            stops: None,
            sentence_counts: None,
        })
    }

    fn generate(
        &self,
        encoded: &EncoderOutput,
        vocab: &Vocabulary,
        config: &GenerationConfig,
    ) -> Result<Vec<Vec<u32>>> {
        let _enter = self.span.enter();
        let features = &encoded.features;
        let (batch_size, _positions, _encoder_dim) = features.dims3()?;
        let device = features.device();
        let mut state = self.init_state(features)?;
        let mut input = embed_tokens(&self.embedding, &vec![vocab.sos(); batch_size], device)?;
        let mut tokens: Vec<Vec<u32>> = vec![Vec::new(); batch_size];
        let mut finished = vec![false; batch_size];
        let mut n_finished = 0;
        for _t in 0..config.max_sentences * config.max_words {
            let (state_t, _alpha) = self.step(features, &input, &state)?;
            let preds = self.head.predict(&state_t.h)?;
            let picked = self.head.pick_tokens(&preds, self.embedding.embeddings())?;
            input = self.embedding.forward(&picked)?;
            state = state_t;
            for (i, &tok) in picked.to_vec1::<u32>()?.iter().enumerate() {
                if finished[i] {
                    continue;
                }
                tokens[i].push(tok);
                if tok == vocab.eoc() {
                    finished[i] = true;
                    n_finished += 1;
                }
            }
            if n_finished == batch_size {
                break;
            }
        }
        Ok(tokens)
    }

    fn head_kind(&self) -> HeadKind {
        self.head.kind()
    }

    fn embeddings(&self) -> &Tensor {
        self.embedding.embeddings()
    }
}
