//! Image loading for ImageNet-pretrained encoders.

use candle::{DType, Device, Result, Tensor};

/// Per-channel mean of the ImageNet training set.
pub const IMAGENET_MEAN: [f32; 3] = [0.485f32, 0.456, 0.406];
/// Per-channel standard deviation of the ImageNet training set.
pub const IMAGENET_STD: [f32; 3] = [0.229f32, 0.224, 0.225];

/// Loads an image from disk as a `(3, resolution, resolution)` float tensor
/// on the cpu, with ImageNet normalization applied.
pub fn load_image<P: AsRef<std::path::Path>>(path: P, resolution: usize) -> Result<Tensor> {
    let img = image::ImageReader::open(path)?
        .decode()
        .map_err(candle::Error::wrap)?
        .resize_to_fill(
            resolution as u32,
            resolution as u32,
            image::imageops::FilterType::Triangle,
        );
    let data = img.to_rgb8().into_raw();
    let data = Tensor::from_vec(data, (resolution, resolution, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let mean = Tensor::new(&IMAGENET_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGENET_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    (data / 255.)?.broadcast_sub(&mean)?.broadcast_div(&std)
}
