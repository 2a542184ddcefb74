use std::ops::Range;
use std::path::Path;

use image::{GrayImage, ImageBuffer};
use log::info;
use ndarray::{s, Array2, ArrayView2};

use super::common::*;
use super::error::{Error, Result};

/// Multiplies every intensity by `factor` and rounds into a byte. Values
/// outside `[0, 255 / factor]` saturate.
pub fn scale_to_pixels(images: ArrayView2<f32>, factor: f32) -> Pixels {
    images.mapv(|x| (x * factor).round().clamp(0.0, 255.0) as u8)
}

/// Row ranges of the `count` regular batches.
pub fn batch_ranges(batch_size: usize, count: usize) -> impl Iterator<Item = Range<usize>> {
    (0..count).map(move |i| batch_size * i..batch_size * (i + 1))
}

/// Writes `rows` as one grayscale PNG: one image row per sample, one column
/// per pixel.
pub fn write_batch(path: &Path, rows: ArrayView2<u8>) -> Result<()> {
    let (height, width) = rows.dim();
    let image = gray_image(width, height, rows.iter().copied().collect())?;
    image.save(path)?;
    info!("Wrote {} samples to {:?}", height, path);
    Ok(())
}

fn gray_image(width: usize, height: usize, data: Vec<u8>) -> Result<GrayImage> {
    let len = data.len();
    ImageBuffer::from_raw(width as u32, height as u32, data).ok_or_else(|| {
        Error::UnexpectedLayout(format!("{}x{} batch buffer has {} bytes", width, height, len))
    })
}

/// Reads a batch image back into one row per sample.
pub fn read_batch(path: &Path) -> Result<Pixels> {
    let image = image::open(path)?.into_luma8();
    let (width, height) = image.dimensions();
    Ok(Array2::from_shape_vec((height as usize, width as usize), image.into_raw())?)
}

/// Batches the scaled matrix. The main pass covers `batch_count` batches of
/// `batch_size` rows taken from `pixels[..main_rows]`; the final batch holds
/// every row from `batch_size * batch_count` to the end of `pixels`.
pub struct Batcher<'a> {
    pixels: ArrayView2<'a, u8>,
    batch_size: usize,
    batch_count: usize,
}

impl<'a> Batcher<'a> {
    pub fn new(pixels: ArrayView2<'a, u8>, main_rows: usize, batch_size: usize, batch_count: usize) -> Result<Self> {
        let needed = batch_size * batch_count;
        let available = main_rows.min(pixels.nrows());
        if needed > available {
            return Err(Error::NotEnoughRows { needed, available });
        }
        Ok(Batcher { pixels, batch_size, batch_count })
    }

    /// The regular batches followed by the final one, each with its index.
    pub fn batches(&self) -> Result<Vec<(usize, Range<usize>, ArrayView2<'a, u8>)>> {
        let mut batches: Vec<_> = batch_ranges(self.batch_size, self.batch_count)
            .enumerate()
            .map(|(i, rows)| (i, rows.clone(), self.pixels.slice_move(s![rows, ..])))
            .collect();

        let tail = self.batch_size * self.batch_count..self.pixels.nrows();
        if tail.is_empty() {
            return Err(Error::EmptyBatch(self.batch_count));
        }
        batches.push((self.batch_count, tail.clone(), self.pixels.slice_move(s![tail, ..])));
        Ok(batches)
    }
}
