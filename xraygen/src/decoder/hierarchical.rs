//! The hierarchical decoder: a sentence level cell plans one topic per
//! sentence, a word level cell writes each sentence from its topic.

use candle::{Result, Tensor};
use candle_nn::rnn::{lstm, LSTMConfig, LSTMState, LSTM, RNN};
use candle_nn::{embedding, linear, Dropout, Embedding, Linear, Module, VarBuilder};
use rand::rngs::StdRng;

use super::{
    embed_tokens, narrow_state, pad_rows, sort_by_length, DecodeOutput, Decoder, DecoderConfig,
    FeedPolicy, HeadKind, OutputHead,
};
use crate::attention::{Attention, LabelAttention};
use crate::encoder::EncoderOutput;
use crate::generation::GenerationConfig;
use xraygen_data::captions::group_lengths;
use xraygen_data::Vocabulary;

/// Two level decoder. The sentence cell attends over the feature grid and
/// the label scores, emits a topic plus a stop logit for every sentence, and
/// the word cell consumes the topic next to the previous word embedding. The
/// word state resets at each sentence boundary.
pub struct HierarchicalDecoder {
    visual_attention: Attention,
    label_attention: LabelAttention,
    context_fc: Linear,
    embedding: Embedding,
    sentence_rnn: LSTM,
    word_rnn: LSTM,
    topic: Linear,
    stop_h: Linear,
    stop: Linear,
    head: OutputHead,
    dropout: Dropout,
    delimiter: u32,
    span: tracing::Span,
}

impl HierarchicalDecoder {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let visual_attention = Attention::new(
            cfg.encoder_dim,
            cfg.decoder_dim,
            cfg.attention_dim,
            vb.pp("visual_attention"),
        )?;
        let label_attention =
            LabelAttention::new(cfg.decoder_dim, cfg.attention_dim, vb.pp("label_attention"))?;
        let context_fc = linear(
            cfg.encoder_dim + cfg.nr_labels,
            cfg.decoder_dim,
            vb.pp("context_fc"),
        )?;
        let embedding = embedding(cfg.vocab_size, cfg.embed_dim, vb.pp("embedding"))?;
        let sentence_rnn = lstm(
            cfg.decoder_dim,
            cfg.decoder_dim,
            LSTMConfig::default(),
            vb.pp("sentence_rnn"),
        )?;
        let word_rnn = lstm(
            2 * cfg.embed_dim,
            cfg.decoder_dim,
            LSTMConfig::default(),
            vb.pp("word_rnn"),
        )?;
        let topic = linear(cfg.decoder_dim, cfg.embed_dim, vb.pp("topic"))?;
        let stop_h = linear(cfg.decoder_dim, cfg.decoder_dim, vb.pp("stop_h"))?;
        let stop = linear(cfg.decoder_dim, 1, vb.pp("stop"))?;
        let head = OutputHead::new(
            cfg.head,
            cfg.decoder_dim,
            cfg.embed_dim,
            cfg.vocab_size,
            vb.pp("fc"),
        )?;
        let dropout = Dropout::new(cfg.dropout);
        let span = tracing::span!(tracing::Level::TRACE, "hierarchical-decoder");
        Ok(Self {
            visual_attention,
            label_attention,
            context_fc,
            embedding,
            sentence_rnn,
            word_rnn,
            topic,
            stop_h,
            stop,
            head,
            dropout,
            delimiter: cfg.delimiter,
            span,
        })
    }

    /// One sentence level step: dual attention, fused context, cell step.
    fn sentence_step(
        &self,
        features: &Tensor,
        label_probs: &Tensor,
        state: &LSTMState,
    ) -> Result<(LSTMState, Tensor)> {
        let (visual_ctx, alpha) = self.visual_attention.forward(features, &state.h)?;
        let (label_ctx, _label_alpha) = self.label_attention.forward(label_probs, &state.h)?;
        let ctx = self
            .context_fc
            .forward(&Tensor::cat(&[&visual_ctx, &label_ctx], 1)?)?;
        let state = self.sentence_rnn.step(&ctx, state)?;
        Ok((state, alpha))
    }

    fn stop_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        self.stop.forward(&self.stop_h.forward(hidden)?.relu()?)
    }
}

impl Decoder for HierarchicalDecoder {
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
            candle::bail!("caption length {} exceeds the {columns} caption columns", lengths[0])
        }
        let device = encoded.features.device();
        let index = Tensor::from_slice(&sort_ind, batch_size, device)?;
        let features = encoded.features.index_select(&index, 0)?;
        let label_probs = candle_nn::ops::sigmoid(&encoded.label_logits.index_select(&index, 0)?)?;
        let captions = captions.index_select(&index, 0)?;
        let caption_rows = captions.to_vec2::<u32>()?;

        let decode_lengths: Vec<usize> = lengths.iter().map(|l| l - 1).collect();
        let max_decode = decode_lengths[0];

        // Sentence runs per row. The first group loses its <sos> slot, so a
        // row's runs sum to its decode length. A sentence's first word input
        // is the closing token of the previous one, <sos> for the first.
        let mut runs: Vec<Vec<usize>> = Vec::with_capacity(batch_size);
        let mut starts: Vec<Vec<usize>> = Vec::with_capacity(batch_size);
        for (row, &len) in caption_rows.iter().zip(lengths.iter()) {
            let groups = group_lengths(&row[..len], self.delimiter);
            let mut row_runs = Vec::with_capacity(groups.len());
            let mut row_starts = Vec::with_capacity(groups.len());
            let mut consumed = 0usize;
            for (s, &group) in groups.iter().enumerate() {
                row_runs.push(if s == 0 { group - 1 } else { group });
                row_starts.push(consumed.saturating_sub(1));
                consumed += group;
            }
            runs.push(row_runs);
            starts.push(row_starts);
        }
        let sentence_counts: Vec<usize> = runs.iter().map(|r| r.len()).collect();
        let max_sentences = sentence_counts.iter().copied().max().unwrap_or(0);

        let mut sentence_state = self.sentence_rnn.zero_state(batch_size)?;
        let mut step_alphas = Vec::with_capacity(max_sentences);
        let mut step_stops = Vec::with_capacity(max_sentences);
        let mut row_blocks: Vec<Vec<Tensor>> = vec![Vec::new(); batch_size];
        for s in 0..max_sentences {
            let (state_s, alpha) = self.sentence_step(&features, &label_probs, &sentence_state)?;
            let topic = self.topic.forward(&state_s.h)?;
            step_stops.push(self.stop_logits(&state_s.h)?);
            // Rows that already ran out of sentences contribute zero weights.
            let mask: Vec<f32> = sentence_counts
                .iter()
                .map(|&c| if c > s { 1. } else { 0. })
                .collect();
            let mask = Tensor::from_vec(mask, (batch_size, 1), device)?;
            step_alphas.push(alpha.broadcast_mul(&mask)?);
            sentence_state = state_s;

            // Rows writing a sentence at this step, longest run first.
            let mut participants: Vec<usize> = (0..batch_size)
                .filter(|&r| sentence_counts[r] > s && runs[r][s] > 0)
                .collect();
            participants.sort_by_key(|&r| std::cmp::Reverse(runs[r][s]));
            if participants.is_empty() {
                continue;
            }
            let part_runs: Vec<usize> = participants.iter().map(|&r| runs[r][s]).collect();
            let part_ids: Vec<u32> = participants.iter().map(|&r| r as u32).collect();
            let part_index = Tensor::from_slice(&part_ids, participants.len(), device)?;
            let part_topic = topic.index_select(&part_index, 0)?;
            let first_tokens: Vec<u32> = participants
                .iter()
                .map(|&r| caption_rows[r][starts[r][s]])
                .collect();

            let mut word_state = self.word_rnn.zero_state(participants.len())?;
            let mut input = embed_tokens(&self.embedding, &first_tokens, device)?;
            let max_run = part_runs[0];
            let mut word_preds = Vec::with_capacity(max_run);
            for w in 0..max_run {
                let bt = part_runs.iter().filter(|&&k| k > w).count();
                let word_in = Tensor::cat(
                    &[&part_topic.narrow(0, 0, bt)?, &input.narrow(0, 0, bt)?],
                    1,
                )?;
                let state_w = self.word_rnn.step(&word_in, &narrow_state(&word_state, bt)?)?;
                let preds = self
                    .head
                    .predict(&self.dropout.forward(&state_w.h, train)?)?;
                input = if policy.feed_back(rng) {
                    let tokens = self.head.pick_tokens(&preds, self.embedding.embeddings())?;
                    let picked = self.embedding.forward(&tokens)?;
                    if policy.blend_ground_truth {
                        let truth = self.next_inputs(
                            &participants[..bt],
                            &caption_rows,
                            &starts,
                            s,
                            w,
                            device,
                        )?;
                        ((picked + truth)? * 0.5)?
                    } else {
                        picked
                    }
                } else {
                    self.next_inputs(&participants[..bt], &caption_rows, &starts, s, w, device)?
                };
                word_preds.push(preds);
                word_state = state_w;
            }
            for (p, &r) in participants.iter().enumerate() {
                let block = word_preds[..part_runs[p]]
                    .iter()
                    .map(|preds| preds.narrow(0, p, 1))
                    .collect::<Result<Vec<_>>>()?;
                row_blocks[r].push(Tensor::cat(&block, 0)?);
            }
        }

        let mut rows = Vec::with_capacity(batch_size);
        for blocks in row_blocks.iter() {
            let row = Tensor::cat(blocks, 0)?;
            rows.push(pad_rows(&row, max_decode)?);
        }

        Ok(DecodeOutput {
            predictions: Tensor::stack(&rows, 0)?,
            captions,
            decode_lengths,
            alphas: Tensor::stack(&step_alphas, 1)?,
            sort_ind,
            stops: Some(Tensor::cat(&step_stops, 1)?),
            sentence_counts: Some(sentence_counts),
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
        let label_probs = encoded.label_probs()?;
        let mut sentence_state = self.sentence_rnn.zero_state(batch_size)?;
        let mut tokens: Vec<Vec<u32>> = vec![Vec::new(); batch_size];
        let mut prev: Vec<u32> = vec![vocab.sos(); batch_size];
        let mut finished = vec![false; batch_size];
        for _s in 0..config.max_sentences {
            let (state_s, _alpha) = self.sentence_step(features, &label_probs, &sentence_state)?;
            let topic = self.topic.forward(&state_s.h)?;
            let stop_probs = candle_nn::ops::sigmoid(&self.stop_logits(&state_s.h)?)?
                .squeeze(1)?
                .to_vec1::<f32>()?;
            sentence_state = state_s;

            let mut word_state = self.word_rnn.zero_state(batch_size)?;
            let mut input = embed_tokens(&self.embedding, &prev, device)?;
            let mut sentence_done = finished.clone();
            for _w in 0..config.max_words {
                let word_in = Tensor::cat(&[&topic, &input], 1)?;
                let state_w = self.word_rnn.step(&word_in, &word_state)?;
                let preds = self.head.predict(&state_w.h)?;
                let picked = self.head.pick_tokens(&preds, self.embedding.embeddings())?;
                input = self.embedding.forward(&picked)?;
                word_state = state_w;
                let picked = picked.to_vec1::<u32>()?;
                let mut all_done = true;
                for i in 0..batch_size {
                    if sentence_done[i] {
                        continue;
                    }
                    let tok = picked[i];
                    tokens[i].push(tok);
                    prev[i] = tok;
                    if tok == self.delimiter {
                        sentence_done[i] = true;
                    } else if tok == vocab.eoc() {
                        sentence_done[i] = true;
                        finished[i] = true;
                    } else {
                        all_done = false;
                    }
                }
                if all_done {
                    break;
                }
            }
            for i in 0..batch_size {
                if !finished[i] && f64::from(stop_probs[i]) > config.stop_threshold {
                    finished[i] = true;
                }
            }
            if finished.iter().all(|&f| f) {
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

impl HierarchicalDecoder {
    /// Ground truth embeddings for the next word step of the active rows.
    fn next_inputs(
        &self,
        active: &[usize],
        caption_rows: &[Vec<u32>],
        starts: &[Vec<usize>],
        s: usize,
        w: usize,
        device: &candle::Device,
    ) -> Result<Tensor> {
        let ids: Vec<u32> = active
            .iter()
            .map(|&r| caption_rows[r][starts[r][s] + w + 1])
            .collect();
        embed_tokens(&self.embedding, &ids, device)
    }
}
