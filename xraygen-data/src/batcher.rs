use candle::{Result, Tensor};

use crate::dataset::Sample;

/// A batch of samples: stacked images `(n, 3, r, r)`, stacked padded captions
/// `(n, max_size)` and the per-sample caption lengths.
pub struct Batch {
    pub images: Tensor,
    pub captions: Tensor,
    pub lengths: Vec<usize>,
}

pub struct Batcher<I> {
    inner: I,
    batch_size: usize,
    return_last_incomplete_batch: bool,
}

impl<I: Iterator<Item = Result<Sample>>> Batcher<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            batch_size: 16,
            return_last_incomplete_batch: false,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn return_last_incomplete_batch(mut self, r: bool) -> Self {
        self.return_last_incomplete_batch = r;
        self
    }
}

impl<I: Iterator<Item = Result<Sample>>> Iterator for Batcher<I> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut images = Vec::with_capacity(self.batch_size);
        let mut captions = Vec::with_capacity(self.batch_size);
        let mut lengths = Vec::with_capacity(self.batch_size);
        let mut errs = vec![];
        for _i in 0..self.batch_size {
            match self.inner.next() {
                Some(Ok((image, caption, length))) => {
                    images.push(image);
                    captions.push(caption);
                    lengths.push(length)
                }
                Some(Err(err)) => errs.push(err),
                None => {
                    if self.return_last_incomplete_batch && !images.is_empty() {
                        break;
                    }
                    return None;
                }
            }
        }
        if !errs.is_empty() {
            return Some(Err(errs.swap_remove(0)));
        }
        let images = Tensor::stack(&images, 0);
        let captions = Tensor::stack(&captions, 0);
        Some(images.and_then(|images| {
            captions.map(|captions| Batch {
                images,
                captions,
                lengths,
            })
        }))
    }
}
