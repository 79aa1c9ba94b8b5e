//! Caption encoding and sentence grouping.

use candle::Result;

use crate::vocab::Vocabulary;

/// Encodes a tokenized report as `<sos> words... <eoc>` padded with `<pad>`
/// up to `max_size`. Returns the padded token ids and the unpadded length.
///
/// A report that does not fit in `max_size` is an error rather than being
/// truncated.
pub fn encode_caption(
    words: &[String],
    vocab: &Vocabulary,
    max_size: usize,
) -> Result<(Vec<u32>, usize)> {
    let len = words.len() + 2;
    if len > max_size {
        candle::bail!(
            "caption of {} words does not fit in the maximum size {max_size}",
            words.len()
        )
    }
    let mut tokens = Vec::with_capacity(max_size);
    tokens.push(vocab.sos());
    for word in words {
        tokens.push(vocab.token(word));
    }
    tokens.push(vocab.eoc());
    tokens.resize(max_size, vocab.pad());
    Ok((tokens, len))
}

/// Splits an unpadded caption into its sentence groups.
///
/// A group is a run of tokens ending with the delimiter. Tokens after the
/// last delimiter (the `<eoc>` sentinel in a well formed caption) are folded
/// into the preceding group, and a caption without any delimiter forms a
/// single group.
pub fn sentence_groups(tokens: &[u32], delimiter: u32) -> Vec<Vec<u32>> {
    let mut groups: Vec<Vec<u32>> = Vec::new();
    let mut current = Vec::new();
    for &token in tokens {
        current.push(token);
        if token == delimiter {
            groups.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        match groups.last_mut() {
            Some(last) => last.extend(current),
            None => groups.push(current),
        }
    }
    groups
}

/// Sentence group sizes, in order. The sizes sum back to `tokens.len()`.
pub fn group_lengths(tokens: &[u32], delimiter: u32) -> Vec<usize> {
    let mut lengths = Vec::new();
    let mut run = 0usize;
    for &token in tokens {
        run += 1;
        if token == delimiter {
            lengths.push(run);
            run = 0;
        }
    }
    if run > 0 {
        match lengths.last_mut() {
            Some(last) => *last += run,
            None => lengths.push(run),
        }
    }
    lengths
}
