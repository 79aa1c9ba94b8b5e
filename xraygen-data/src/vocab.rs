//! Vocabulary mapping report words to embedding-table indices.

use std::collections::HashMap;
use std::path::Path;

use candle::{Error, Result};

/// Start-of-caption sentinel.
pub const SOS: &str = "<sos>";
/// End-of-caption sentinel.
pub const EOC: &str = "<eoc>";
/// Padding sentinel.
pub const PAD: &str = "<pad>";
/// Out-of-vocabulary sentinel.
pub const UNK: &str = "<unk>";
/// Sentence delimiter token.
pub const DELIMITER: &str = ".";

/// A word to index map together with its inverse and the resolved sentinel
/// tokens. Indices are dense, `0..len`.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    word2idx: HashMap<String, u32>,
    idx2word: Vec<String>,
    sos: u32,
    eoc: u32,
    pad: u32,
    unk: u32,
    delimiter: u32,
}

impl Vocabulary {
    pub fn from_word2idx(word2idx: HashMap<String, u32>) -> Result<Self> {
        let n = word2idx.len();
        let mut idx2word = vec![String::new(); n];
        let mut seen = vec![false; n];
        for (word, &idx) in word2idx.iter() {
            let idx = idx as usize;
            if idx >= n {
                candle::bail!("vocabulary index {idx} out of range for {n} words")
            }
            if seen[idx] {
                candle::bail!("vocabulary index {idx} is assigned to more than one word")
            }
            seen[idx] = true;
            idx2word[idx] = word.clone();
        }
        let lookup = |word: &str| match word2idx.get(word) {
            Some(&idx) => Ok(idx),
            None => candle::bail!("vocabulary is missing the {word} token"),
        };
        let sos = lookup(SOS)?;
        let eoc = lookup(EOC)?;
        let pad = lookup(PAD)?;
        let unk = lookup(UNK)?;
        let delimiter = lookup(DELIMITER)?;
        Ok(Self {
            word2idx,
            idx2word,
            sos,
            eoc,
            pad,
            unk,
            delimiter,
        })
    }

    /// Reads a `word2idx.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let word2idx: HashMap<String, u32> =
            serde_json::from_reader(std::io::BufReader::new(file)).map_err(Error::wrap)?;
        Self::from_word2idx(word2idx)
    }

    pub fn len(&self) -> usize {
        self.idx2word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx2word.is_empty()
    }

    /// Index for a word, falling back to `<unk>` for out-of-vocabulary words.
    pub fn token(&self, word: &str) -> u32 {
        self.word2idx.get(word).copied().unwrap_or(self.unk)
    }

    pub fn word(&self, token: u32) -> Result<&str> {
        match self.idx2word.get(token as usize) {
            Some(word) => Ok(word.as_str()),
            None => candle::bail!(
                "token {token} out of range for a vocabulary of {} words",
                self.len()
            ),
        }
    }

    pub fn sos(&self) -> u32 {
        self.sos
    }

    pub fn eoc(&self) -> u32 {
        self.eoc
    }

    pub fn pad(&self) -> u32 {
        self.pad
    }

    pub fn unk(&self) -> u32 {
        self.unk
    }

    pub fn delimiter(&self) -> u32 {
        self.delimiter
    }

    /// Turns tokens back into report text, skipping the sentinels.
    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        let mut words = Vec::with_capacity(tokens.len());
        for &token in tokens {
            if token == self.sos || token == self.eoc || token == self.pad {
                continue;
            }
            words.push(self.word(token)?);
        }
        Ok(words.join(" "))
    }
}
