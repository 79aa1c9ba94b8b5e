//! Saving and restoring training runs.
//!
//! A checkpoint is a directory with the encoder and decoder weights as
//! safetensors next to two json files, one describing the model shape and
//! one the training progress. The best run so far is mirrored into a `best`
//! subdirectory.

use std::path::Path;

use candle::{DType, Device, Error, Result};
use candle_nn::VarMap;

use crate::decoder::{DecoderConfig, DecoderKind};
use crate::encoder::EncoderKind;

pub const ENCODER_WEIGHTS: &str = "encoder.safetensors";
pub const DECODER_WEIGHTS: &str = "decoder.safetensors";
pub const MODEL_CONFIG: &str = "model.json";
pub const TRAIN_STATE: &str = "training.json";
pub const BEST_DIR: &str = "best";

/// Everything needed to rebuild the exact model of a checkpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelConfig {
    pub encoder: EncoderKind,
    pub decoder_kind: DecoderKind,
    pub decoder: DecoderConfig,
    pub resolution: usize,
    pub max_size: usize,
}

/// Training progress stored alongside the weights.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrainState {
    pub epoch: usize,
    pub best_metric: f64,
    pub epochs_since_improvement: usize,
    pub scheduled_sampling_prob: f64,
}

impl Default for TrainState {
    fn default() -> Self {
        Self {
            epoch: 0,
            // Not -inf, json cannot represent it.
            best_metric: f64::MIN,
            epochs_since_improvement: 0,
            scheduled_sampling_prob: 0.,
        }
    }
}

pub fn save_checkpoint(
    dir: &Path,
    encoder_vars: &VarMap,
    decoder_vars: &VarMap,
    config: &ModelConfig,
    state: &TrainState,
    is_best: bool,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    write_checkpoint(dir, encoder_vars, decoder_vars, config, state)?;
    if is_best {
        let best = dir.join(BEST_DIR);
        std::fs::create_dir_all(&best)?;
        write_checkpoint(&best, encoder_vars, decoder_vars, config, state)?;
    }
    Ok(())
}

fn write_checkpoint(
    dir: &Path,
    encoder_vars: &VarMap,
    decoder_vars: &VarMap,
    config: &ModelConfig,
    state: &TrainState,
) -> Result<()> {
    encoder_vars.save(dir.join(ENCODER_WEIGHTS))?;
    decoder_vars.save(dir.join(DECODER_WEIGHTS))?;
    write_json(&dir.join(MODEL_CONFIG), config)?;
    write_json(&dir.join(TRAIN_STATE), state)
}

pub fn load_model_config(dir: &Path) -> Result<ModelConfig> {
    read_json(&dir.join(MODEL_CONFIG))
}

pub fn load_train_state(dir: &Path) -> Result<TrainState> {
    read_json(&dir.join(TRAIN_STATE))
}

/// Loads saved weights into varmaps that already hold the model's variables,
/// so the model has to be built before restoring it.
pub fn load_weights(
    dir: &Path,
    encoder_vars: &mut VarMap,
    decoder_vars: &mut VarMap,
) -> Result<()> {
    encoder_vars.load(dir.join(ENCODER_WEIGHTS))?;
    decoder_vars.load(dir.join(DECODER_WEIGHTS))
}

/// Overwrites the decoder embedding table with pre-trained word vectors,
/// stored as an `embeddings` tensor in a safetensors file. The table shape
/// has to match the decoder's, so vectors for the sentinel tokens must be
/// part of the file.
pub fn load_pretrained_embeddings(
    decoder_vars: &mut VarMap,
    path: &Path,
    normalize: bool,
    device: &Device,
) -> Result<()> {
    let tensors = candle::safetensors::load(path, device)?;
    let embeddings = match tensors.get("embeddings") {
        Some(t) => t.to_dtype(DType::F32)?,
        None => candle::bail!("no embeddings tensor in {}", path.display()),
    };
    let embeddings = if normalize {
        crate::decoder::normalize_l2(&embeddings)?
    } else {
        embeddings
    };
    decoder_vars.set_one("embedding.weight", embeddings)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(Error::wrap)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path)?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(Error::wrap)
}
