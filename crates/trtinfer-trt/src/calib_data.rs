use std::path::{Path, PathBuf};

use image::imageops::FilterType;

use trtinfer_core::{InferError, Result};

use crate::calibrator::CalibrationBatchSource;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Calibration batches decoded from a directory of images.
///
/// Images are taken in file-name order, resized to the network input size
/// and laid out as RGB planes (CHW) scaled to [0, 1]. A trailing partial
/// batch is dropped.
pub struct ImageDirSource {
    files: Vec<PathBuf>,
    width: u32,
    height: u32,
    batch_size: usize,
    cursor: usize,
}

impl ImageDirSource {
    pub fn open(dir: &Path, width: u32, height: u32, batch_size: u32) -> Result<Self> {
        if width == 0 || height == 0 || batch_size == 0 {
            return Err(InferError::Calibration(format!(
                "invalid calibration geometry {width}x{height}, batch {batch_size}"
            )));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| {
                InferError::Calibration(format!("cannot read image dir {}: {e}", dir.display()))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();

        let batch_size = batch_size as usize;
        if files.len() < batch_size {
            return Err(InferError::Calibration(format!(
                "{} holds {} images, fewer than one batch of {batch_size}",
                dir.display(),
                files.len()
            )));
        }

        tracing::info!(
            dir = %dir.display(),
            images = files.len(),
            batches = files.len() / batch_size,
            width,
            height,
            "calibration images found"
        );

        Ok(Self {
            files,
            width,
            height,
            batch_size,
            cursor: 0,
        })
    }

    /// Number of full batches available.
    pub fn nb_batches(&self) -> usize {
        self.files.len() / self.batch_size
    }

    fn image_len(&self) -> usize {
        3 * self.width as usize * self.height as usize
    }

    fn load_chw(&self, path: &Path, out: &mut [f32]) -> Result<()> {
        let img = image::open(path)
            .map_err(|e| InferError::Calibration(format!("{}: {e}", path.display())))?;
        let rgb = img
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgb8();

        let plane = self.width as usize * self.height as usize;
        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                out[c * plane + i] = pixel[c] as f32 / 255.0;
            }
        }
        Ok(())
    }
}

impl CalibrationBatchSource for ImageDirSource {
    fn batch_len(&self) -> usize {
        self.batch_size * self.image_len()
    }

    fn next_batch(&mut self) -> Result<Option<Vec<f32>>> {
        if self.cursor + self.batch_size > self.files.len() {
            return Ok(None);
        }
        let image_len = self.image_len();
        let mut batch = vec![0f32; self.batch_len()];
        let paths = &self.files[self.cursor..self.cursor + self.batch_size];
        for (slot, path) in batch.chunks_exact_mut(image_len).zip(paths) {
            self.load_chw(path, slot)?;
        }
        self.cursor += self.batch_size;
        Ok(Some(batch))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn write_image(dir: &Path, name: &str, color: [u8; 3]) {
        RgbImage::from_pixel(8, 6, Rgb(color))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn batches_are_chw_scaled_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "b.png", [0, 255, 0]);
        write_image(dir.path(), "a.png", [255, 0, 0]);
        write_image(dir.path(), "c.bmp", [0, 0, 255]);
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut src = ImageDirSource::open(dir.path(), 4, 2, 2).unwrap();
        assert_eq!(src.nb_batches(), 1);
        assert_eq!(src.batch_len(), 2 * 3 * 4 * 2);

        let batch = src.next_batch().unwrap().unwrap();
        let plane = 4 * 2;
        // a.png is red: R plane full, G and B empty.
        assert!(batch[..plane].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(batch[plane..3 * plane].iter().all(|&v| v.abs() < 1e-6));
        // b.png is green.
        let second = &batch[3 * plane..];
        assert!(second[..plane].iter().all(|&v| v.abs() < 1e-6));
        assert!(second[plane..2 * plane].iter().all(|&v| (v - 1.0).abs() < 1e-6));

        // c.bmp alone is a partial batch and is dropped.
        assert!(src.next_batch().unwrap().is_none());
    }

    #[test]
    fn too_few_images_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "only.png", [1, 2, 3]);
        assert!(matches!(
            ImageDirSource::open(dir.path(), 4, 4, 2),
            Err(InferError::Calibration(_))
        ));
        assert!(ImageDirSource::open(&dir.path().join("missing"), 4, 4, 1).is_err());
    }
}
