use std::io::Cursor;
use std::path::PathBuf;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

/// Image bytes ready to be sent to the OCR backend.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

#[async_trait]
pub trait ImagePreparer: Send + Sync {
    async fn prepare(&self, path: &str) -> Result<PreparedImage, PrepareError>;
}

/// Shrinks uploads before OCR to keep vision token cost down:
/// proportional downscale, optional grayscale, alpha flattened onto white,
/// re-encoded as JPEG.
#[derive(Debug, Clone)]
pub struct ImageOcrPreparer {
    max_width: u32,
    quality: u8,
    grayscale: bool,
}

impl ImageOcrPreparer {
    /// `quality` is clamped to 40..=85; a `max_width` of 0 disables resizing.
    pub fn new(max_width: u32, quality: u8, grayscale: bool) -> Self {
        Self {
            max_width,
            quality: quality.clamp(40, 85),
            grayscale,
        }
    }

    fn prepare_blocking(&self, path: PathBuf) -> Result<PreparedImage, PrepareError> {
        let mut img = image::open(&path)?;

        if self.max_width > 0 && img.width() > self.max_width {
            img = img.resize(self.max_width, u32::MAX, FilterType::Lanczos3);
        }
        if self.grayscale {
            img = img.grayscale();
        }

        let opaque = flatten_onto_white(&img);
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(Cursor::new(&mut bytes), self.quality).encode_image(&opaque)?;

        Ok(PreparedImage {
            bytes,
            mime: "image/jpeg".to_string(),
        })
    }
}

#[async_trait]
impl ImagePreparer for ImageOcrPreparer {
    async fn prepare(&self, path: &str) -> Result<PreparedImage, PrepareError> {
        let preparer = self.clone();
        let path = PathBuf::from(path);
        tokio::task::spawn_blocking(move || preparer.prepare_blocking(path)).await?
    }
}

fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Image preparation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
