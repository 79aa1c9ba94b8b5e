//! Turning decoder outputs back into token sequences.

use candle::{Result, D};

use crate::decoder::{nearest_embedding, DecodeOutput, Decoder, HeadKind};

/// Budgets and thresholds for free running generation.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Stop probability above which the sentence decoder stops after the
    /// current sentence.
    pub stop_threshold: f64,
    /// Sentence budget of the hierarchical decoder.
    pub max_sentences: usize,
    /// Word budget per sentence. The flat decoder, which has no sentence
    /// level, spends `max_sentences * max_words` on the whole report.
    pub max_words: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            stop_threshold: 0.5,
            max_sentences: 10,
            max_words: 50,
        }
    }
}

/// Token hypotheses picked from a training forward pass, trimmed to each
/// row's decode length. Rows stay in the decoder's sorted order.
pub fn hypotheses_from_output<T: Decoder + ?Sized>(
    decoder: &T,
    output: &DecodeOutput,
) -> Result<Vec<Vec<u32>>> {
    let (b, steps, _out) = output.predictions.dims3()?;
    let flat = output.predictions.flatten(0, 1)?;
    let picked = match decoder.head_kind() {
        HeadKind::Softmax => flat.argmax(D::Minus1)?,
        HeadKind::Continuous => nearest_embedding(&flat, decoder.embeddings())?,
    };
    let picked = picked.reshape((b, steps))?.to_vec2::<u32>()?;
    let hypotheses = output
        .decode_lengths
        .iter()
        .zip(picked)
        .map(|(&len, row)| row[..len].to_vec())
        .collect();
    Ok(hypotheses)
}

/// The matching reference sequences: the sorted captions without their
/// leading `<sos>`, trimmed to each row's decode length.
pub fn references_from_output(output: &DecodeOutput) -> Result<Vec<Vec<u32>>> {
    let rows = output.captions.to_vec2::<u32>()?;
    Ok(output
        .decode_lengths
        .iter()
        .zip(rows)
        .map(|(&len, row)| row[1..1 + len].to_vec())
        .collect())
}
