#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use candle::test_utils::to_vec2_round;
use candle::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use xraygen::attention::{Attention, LabelAttention};

/* With attention_dim 1 and the weights below, the position scores reduce to
the first feature coordinate, so softmax([0, ln 3]) = [0.25, 0.75] and the
context mixes the two position vectors with those weights. */
#[test]
fn visual_attention_weights() -> Result<()> {
    let cpu = &Device::Cpu;
    let tensors: std::collections::HashMap<_, _> = [
        ("encoder_att.weight".to_string(), Tensor::new(&[[1f32, 0.]], cpu)?),
        ("encoder_att.bias".to_string(), Tensor::new(&[0f32], cpu)?),
        ("decoder_att.weight".to_string(), Tensor::new(&[[0f32, 0.]], cpu)?),
        ("decoder_att.bias".to_string(), Tensor::new(&[0f32], cpu)?),
        ("full_att.weight".to_string(), Tensor::new(&[[1f32]], cpu)?),
        ("full_att.bias".to_string(), Tensor::new(&[0f32], cpu)?),
    ]
    .into_iter()
    .collect();
    let vb = VarBuilder::from_tensors(tensors, DType::F32, cpu);
    let attention = Attention::new(2, 2, 1, vb)?;
    let features = Tensor::new(&[[[0f32, 4.], [3f32.ln(), 0.]]], cpu)?;
    let hidden = Tensor::new(&[[7f32, -7.]], cpu)?;
    let (context, alpha) = attention.forward(&features, &hidden)?;
    assert_eq!(to_vec2_round(&alpha, 4)?, [[0.25, 0.75]]);
    assert_eq!(to_vec2_round(&context, 4)?, [[0.824, 1.0]]);
    Ok(())
}

#[test]
fn visual_attention_is_a_distribution() -> Result<()> {
    let cpu = &Device::Cpu;
    let vm = candle_nn::VarMap::new();
    let vb = VarBuilder::from_varmap(&vm, DType::F32, cpu);
    let attention = Attention::new(4, 3, 5, vb)?;
    let features = Tensor::randn(0f32, 1f32, (2, 6, 4), cpu)?;
    let hidden = Tensor::randn(0f32, 1f32, (2, 3), cpu)?;
    let (context, alpha) = attention.forward(&features, &hidden)?;
    assert_eq!(context.dims(), [2, 4]);
    assert_eq!(alpha.dims(), [2, 6]);
    let sums = alpha.sum(1)?.to_vec1::<f32>()?;
    for sum in sums {
        assert!((sum - 1.0).abs() < 1e-5);
    }
    let weights = alpha.flatten_all()?.to_vec1::<f32>()?;
    assert!(weights.iter().all(|&w| w >= 0.));
    Ok(())
}

/* Zero weights leave all positions tied, so the label weights are uniform
and the context scales the probabilities by 1 / nr_labels. */
#[test]
fn label_attention_reweights_probabilities() -> Result<()> {
    let cpu = &Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, cpu);
    let attention = LabelAttention::new(3, 5, vb)?;
    let probs = Tensor::new(&[[0.2f32, 0.4, 0.6, 0.8]], cpu)?;
    let hidden = Tensor::new(&[[1f32, 2., 3.]], cpu)?;
    let (context, alpha) = attention.forward(&probs, &hidden)?;
    assert_eq!(to_vec2_round(&alpha, 4)?, [[0.25, 0.25, 0.25, 0.25]]);
    assert_eq!(to_vec2_round(&context, 4)?, [[0.05, 0.1, 0.15, 0.2]]);
    Ok(())
}
