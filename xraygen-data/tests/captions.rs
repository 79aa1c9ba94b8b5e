use std::collections::HashMap;

use candle::Result;
use xraygen_data::captions::{encode_caption, group_lengths, sentence_groups};
use xraygen_data::Vocabulary;

fn vocab() -> Result<Vocabulary> {
    let word2idx: HashMap<String, u32> = [
        "<pad>", "<sos>", "<eoc>", "<unk>", ".", "the", "lung", "is", "clear",
    ]
    .iter()
    .enumerate()
    .map(|(i, w)| (w.to_string(), i as u32))
    .collect();
    Vocabulary::from_word2idx(word2idx)
}

fn words(ws: &[&str]) -> Vec<String> {
    ws.iter().map(|w| w.to_string()).collect()
}

#[test]
fn encode_pads_and_counts() -> Result<()> {
    let vocab = vocab()?;
    let (tokens, len) = encode_caption(&words(&["the", "lung", "is", "clear", "."]), &vocab, 10)?;
    assert_eq!(tokens, [1, 5, 6, 7, 8, 4, 2, 0, 0, 0]);
    assert_eq!(len, 7);
    Ok(())
}

#[test]
fn encode_rejects_overlong_captions() -> Result<()> {
    let vocab = vocab()?;
    let ws = words(&["the"; 9]);
    assert!(encode_caption(&ws, &vocab, 10).is_err());
    // Exactly at the limit is fine: 8 words plus the two sentinels.
    let ws = words(&["the"; 8]);
    let (_, len) = encode_caption(&ws, &vocab, 10)?;
    assert_eq!(len, 10);
    Ok(())
}

#[test]
fn single_sentence_report() {
    // <sos> the lung is clear . <eoc>
    let tokens = [1, 5, 6, 7, 8, 4, 2];
    let groups = sentence_groups(&tokens, 4);
    assert_eq!(groups, [vec![1, 5, 6, 7, 8, 4, 2]]);
    assert_eq!(group_lengths(&tokens, 4), [7]);
}

#[test]
fn trailing_tokens_fold_into_last_group() {
    // <sos> the . lung . <eoc>
    let tokens = [1, 5, 4, 6, 4, 2];
    let groups = sentence_groups(&tokens, 4);
    assert_eq!(groups, [vec![1, 5, 4], vec![6, 4, 2]]);
    assert_eq!(group_lengths(&tokens, 4), [3, 3]);
}

#[test]
fn no_delimiter_is_a_single_group() {
    let tokens = [1, 5, 6, 2];
    assert_eq!(sentence_groups(&tokens, 4), [vec![1, 5, 6, 2]]);
    assert_eq!(group_lengths(&tokens, 4), [4]);
}

#[test]
fn delimiter_at_the_end() {
    let tokens = [1, 5, 6, 4];
    assert_eq!(sentence_groups(&tokens, 4), [vec![1, 5, 6, 4]]);
    assert_eq!(group_lengths(&tokens, 4), [4]);
}

#[test]
fn groups_partition_the_caption() {
    let tokens = [1, 9, 9, 4, 9, 4, 9, 9, 9, 4, 2];
    let groups = sentence_groups(&tokens, 4);
    let lengths = group_lengths(&tokens, 4);
    assert_eq!(groups.len(), lengths.len());
    assert_eq!(lengths.iter().sum::<usize>(), tokens.len());
    let flattened: Vec<u32> = groups.into_iter().flatten().collect();
    assert_eq!(flattened, tokens);
}

#[test]
fn empty_caption() {
    assert!(sentence_groups(&[], 4).is_empty());
    assert!(group_lengths(&[], 4).is_empty());
}
