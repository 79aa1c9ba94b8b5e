//! A convolutional encoder that classifies the image and exposes its feature
//! grid for attention.

use candle::{Module, Result, Tensor};
use candle_nn::{conv2d, group_norm, linear, Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder};

/// Backbone flavor, fixing the feature width of the encoder grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EncoderKind {
    #[serde(rename = "densenet121")]
    DenseNet121,
    #[serde(rename = "efficientnet-b3")]
    EfficientNetB3,
}

impl EncoderKind {
    pub fn encoder_dim(&self) -> usize {
        match self {
            Self::DenseNet121 => 1024,
            Self::EfficientNetB3 => 1280,
        }
    }
}

/// The encoder output: the feature grid flattened to
/// `(batch, positions, encoder_dim)` and the `(batch, nr_labels)` label
/// logits.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub features: Tensor,
    pub label_logits: Tensor,
}

impl EncoderOutput {
    pub fn label_probs(&self) -> Result<Tensor> {
        candle_nn::ops::sigmoid(&self.label_logits)
    }
}

#[derive(Debug, Clone)]
struct ConvBlock {
    conv: Conv2d,
    norm: GroupNorm,
}

impl ConvBlock {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv"))?;
        let norm = group_norm(32, out_channels, 1e-5, vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.norm.forward(&xs)?;
        xs.relu()?.max_pool2d(2)
    }
}

/// A stack of downsampling conv blocks ending in a multi-label classification
/// head. The feature map feeding the head is also returned, flattened, as the
/// grid the decoders attend over.
#[derive(Debug, Clone)]
pub struct ClassifierEncoder {
    blocks: Vec<ConvBlock>,
    head_norm: GroupNorm,
    classifier: Linear,
    span: tracing::Span,
}

impl ClassifierEncoder {
    pub fn new(kind: EncoderKind, nr_labels: usize, vb: VarBuilder) -> Result<Self> {
        let encoder_dim = kind.encoder_dim();
        let channels = [3, 64, 128, 256, encoder_dim];
        let vb_b = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(channels.len() - 1);
        for (i, w) in channels.windows(2).enumerate() {
            blocks.push(ConvBlock::new(w[0], w[1], vb_b.pp(i))?);
        }
        let head_norm = group_norm(32, encoder_dim, 1e-5, vb.pp("head_norm"))?;
        let classifier = linear(encoder_dim, nr_labels, vb.pp("classifier"))?;
        let span = tracing::span!(tracing::Level::TRACE, "encoder");
        Ok(Self {
            blocks,
            head_norm,
            classifier,
            span,
        })
    }

    /// Runs the encoder on `(batch, 3, resolution, resolution)` images. Each
    /// block halves the spatial extent, so a 224 pixel input yields a 14x14
    /// grid of 196 positions.
    pub fn forward(&self, images: &Tensor) -> Result<EncoderOutput> {
        let _enter = self.span.enter();
        let mut xs = images.clone();
        for block in self.blocks.iter() {
            xs = block.forward(&xs)?;
        }
        let (_b, _c, h, w) = xs.dims4()?;
        let pooled = self
            .head_norm
            .forward(&xs)?
            .relu()?
            .avg_pool2d((h, w))?
            .flatten_from(1)?;
        let label_logits = self.classifier.forward(&pooled)?;
        let features = xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        Ok(EncoderOutput {
            features,
            label_logits,
        })
    }
}
