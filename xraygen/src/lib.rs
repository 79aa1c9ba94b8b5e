//! Report generation models for chest X-ray images.
//!
//! The crate pairs a classifying convolutional [`encoder`] with two recurrent
//! [`decoder`] families: a flat decoder that emits the report word by word,
//! and a hierarchical one that first plans a topic per sentence and then
//! writes each sentence from its topic. Both attend over the encoder feature
//! grid; the hierarchical decoder additionally attends over the encoder's
//! label scores. Decoders train with teacher forcing, scheduled sampling or
//! their own predictions as input, and predict either points in word
//! embedding space or vocabulary logits.

pub mod attention;
pub mod checkpoint;
pub mod decoder;
pub mod encoder;
pub mod generation;
pub mod loss;

pub use decoder::{
    build_decoder, DecodeOutput, Decoder, DecoderConfig, DecoderKind, FeedPolicy, HeadKind,
};
pub use encoder::{ClassifierEncoder, EncoderKind, EncoderOutput};
pub use generation::GenerationConfig;
