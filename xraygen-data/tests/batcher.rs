use candle::{Device, Result, Tensor};
use xraygen_data::dataset::Sample;
use xraygen_data::Batcher;

fn sample(i: usize, device: &Device) -> Result<Sample> {
    let image = Tensor::full(i as f32, (3, 4, 4), device)?;
    let caption = Tensor::full(i as u32, 6, device)?;
    Ok((image, caption, i + 2))
}

#[test]
fn batches_are_stacked() -> Result<()> {
    let device = Device::Cpu;
    let samples: Vec<Result<Sample>> = (0..5).map(|i| sample(i, &device)).collect();
    let mut batcher = Batcher::new(samples.into_iter()).batch_size(2);
    let batch = batcher.next().unwrap()?;
    assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
    assert_eq!(batch.captions.dims(), [2, 6]);
    assert_eq!(batch.lengths, [2, 3]);
    assert_eq!(batch.captions.to_vec2::<u32>()?[1], [1u32; 6]);
    let batch = batcher.next().unwrap()?;
    assert_eq!(batch.lengths, [4, 5]);
    // The trailing incomplete batch is dropped by default.
    assert!(batcher.next().is_none());
    Ok(())
}

#[test]
fn keeps_the_last_incomplete_batch() -> Result<()> {
    let device = Device::Cpu;
    let samples: Vec<Result<Sample>> = (0..5).map(|i| sample(i, &device)).collect();
    let mut batcher = Batcher::new(samples.into_iter())
        .batch_size(2)
        .return_last_incomplete_batch(true);
    assert_eq!(batcher.next().unwrap()?.lengths, [2, 3]);
    assert_eq!(batcher.next().unwrap()?.lengths, [4, 5]);
    let last = batcher.next().unwrap()?;
    assert_eq!(last.images.dims(), [1, 3, 4, 4]);
    assert_eq!(last.lengths, [6]);
    assert!(batcher.next().is_none());
    Ok(())
}

#[test]
fn propagates_sample_errors() {
    let device = Device::Cpu;
    let samples = vec![
        sample(0, &device),
        Err(candle::Error::Msg("bad sample".to_string())),
    ];
    let mut batcher = Batcher::new(samples.into_iter()).batch_size(2);
    assert!(batcher.next().unwrap().is_err());
}
