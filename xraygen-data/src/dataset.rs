//! The chest X-ray report dataset.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle::{Device, Error, Result, Tensor};

use crate::captions::encode_caption;
use crate::images::load_image;
use crate::vocab::Vocabulary;

/// One sample: the normalized image, the padded caption and its length.
pub type Sample = (Tensor, Tensor, usize);

/// A directory of chest X-ray images paired with tokenized reports.
///
/// Image file names carry the study id as `s` followed by eight digits, and
/// the two json files map study ids to the report words and to the word
/// count.
pub struct ReportDataset {
    vocab: Vocabulary,
    captions: HashMap<String, Vec<String>>,
    samples: Vec<(PathBuf, String)>,
    max_size: usize,
    resolution: usize,
}

impl ReportDataset {
    pub fn new(
        word2idx_path: &Path,
        captions_path: &Path,
        caption_lengths_path: &Path,
        images_dir: &Path,
        max_size: usize,
        resolution: usize,
    ) -> Result<Self> {
        let vocab = Vocabulary::from_file(word2idx_path)?;
        let captions: HashMap<String, Vec<String>> = read_json(captions_path)?;
        let caption_lengths: HashMap<String, usize> = read_json(caption_lengths_path)?;
        for (study, words) in captions.iter() {
            match caption_lengths.get(study) {
                Some(&len) if len == words.len() => {}
                Some(&len) => candle::bail!(
                    "study {study} has {} caption words but a recorded length of {len}",
                    words.len()
                ),
                None => candle::bail!("study {study} has no recorded caption length"),
            }
        }
        let mut samples = Vec::new();
        for entry in std::fs::read_dir(images_dir)? {
            let path = entry?.path();
            if !is_image(&path) {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let study = match study_id(name) {
                Some(study) => study.to_string(),
                None => candle::bail!("no study id in image file name {name}"),
            };
            if !captions.contains_key(&study) {
                candle::bail!("study {study} has an image but no caption")
            }
            samples.push((path, study));
        }
        samples.sort();
        Ok(Self {
            vocab,
            captions,
            samples,
            max_size,
            resolution,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn get(&self, index: usize) -> Result<Sample> {
        let (path, study) = match self.samples.get(index) {
            Some(sample) => sample,
            None => candle::bail!("sample {index} out of range, {} samples", self.len()),
        };
        let image = load_image(path, self.resolution)?;
        let words = &self.captions[study];
        let (tokens, len) = encode_caption(words, &self.vocab, self.max_size)?;
        let caption = Tensor::from_vec(tokens, self.max_size, &Device::Cpu)?;
        Ok((image, caption, len))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path)?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(Error::wrap)
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("jpg") | Some("jpeg") | Some("png")
    )
}

/// Extracts the eight digit study id following an `s` marker from a file
/// name, e.g. `s50414267.jpg` or `view1_s50414267_frontal.png`. The caption
/// json files key studies by the bare digits.
fn study_id(name: &str) -> Option<&str> {
    let bytes = name.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] == b's'
            && i + 9 <= bytes.len()
            && bytes[i + 1..i + 9].iter().all(u8::is_ascii_digit)
        {
            return Some(&name[i + 1..i + 9]);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::study_id;

    #[test]
    fn study_ids() {
        assert_eq!(study_id("s50414267.jpg"), Some("50414267"));
        assert_eq!(study_id("view1_s00001234_frontal.png"), Some("00001234"));
        assert_eq!(study_id("s1234.jpg"), None);
        assert_eq!(study_id("frontal.png"), None);
    }
}
