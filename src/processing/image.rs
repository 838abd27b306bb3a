use crate::config::PreprocessConfig;
use crate::processing::contrast;
use crate::utils::{ExtractError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GrayImage};
use imageproc::contrast::{otsu_level, threshold};
use log::debug;

/// Smallest side the size-fitting loop will shrink an image to.
const MIN_SIDE: u32 = 32;

/// Processed raster plus its JPEG encoding, ready for a recognizer.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    image: GrayImage,
    encoded: Vec<u8>,
    quality: u8,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    /// JPEG bytes, never longer than the configured maximum file size.
    pub fn jpeg(&self) -> &[u8] {
        &self.encoded
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Bottom `fraction` of the page, where the MRZ of a passport sits.
    pub fn crop_bottom(&self, fraction: f32) -> Result<NormalizedImage> {
        let fraction = fraction.clamp(0.0, 1.0);
        let (width, height) = self.image.dimensions();
        let band = ((height as f32 * fraction).round() as u32).clamp(1, height);
        let cropped = image::imageops::crop_imm(&self.image, 0, height - band, width, band).to_image();
        let encoded = ImageProcessor::encode_jpeg(&cropped, self.quality)?;
        Ok(NormalizedImage {
            image: cropped,
            encoded,
            quality: self.quality,
        })
    }
}

pub struct ImageProcessor;

impl ImageProcessor {
    pub fn normalize(bytes: &[u8], config: &PreprocessConfig) -> Result<NormalizedImage> {
        if bytes.is_empty() {
            return Err(ExtractError::InvalidImage("empty input".to_string()));
        }
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ExtractError::InvalidImage(format!("Failed to decode image: {}", e)))?;
        debug!(
            "decoded {}x{} image from {} bytes",
            decoded.width(),
            decoded.height(),
            bytes.len()
        );
        Self::normalize_image(decoded, config)
    }

    pub fn normalize_image(img: DynamicImage, config: &PreprocessConfig) -> Result<NormalizedImage> {
        // Convert to grayscale
        let gray = img.into_luma8();

        // Shrink before any per-pixel work
        let gray = Self::downscale(gray, config.max_width, config.max_height);

        let gray = if config.clahe.enabled {
            contrast::clahe(&gray, config.clahe.tiles, config.clahe.clip_limit)
        } else {
            gray
        };

        let gray = if config.binarize {
            let level = otsu_level(&gray);
            debug!("binarizing at otsu level {}", level);
            threshold(&gray, level)
        } else {
            gray
        };

        Self::fit_file_size(gray, config)
    }

    fn downscale(gray: GrayImage, max_width: u32, max_height: u32) -> GrayImage {
        let (width, height) = gray.dimensions();
        if width <= max_width && height <= max_height {
            return gray;
        }

        let scale = f64::min(
            max_width as f64 / width as f64,
            max_height as f64 / height as f64,
        );
        let new_width = ((width as f64 * scale).floor() as u32).clamp(1, max_width);
        let new_height = ((height as f64 * scale).floor() as u32).clamp(1, max_height);
        debug!(
            "downscaling {}x{} to {}x{}",
            width, height, new_width, new_height
        );

        if scale < 0.5 {
            image::imageops::thumbnail(&gray, new_width, new_height)
        } else {
            image::imageops::resize(&gray, new_width, new_height, FilterType::Triangle)
        }
    }

    // Lowers quality first, then shrinks by 3/4 at the quality floor until the encoding fits.
    fn fit_file_size(mut gray: GrayImage, config: &PreprocessConfig) -> Result<NormalizedImage> {
        let mut quality = config.quality.clamp(1, 100);
        let floor = config.min_quality.clamp(1, quality);

        loop {
            let encoded = Self::encode_jpeg(&gray, quality)?;
            if encoded.len() <= config.max_file_size {
                debug!(
                    "encoded {}x{} at quality {} into {} bytes",
                    gray.width(),
                    gray.height(),
                    quality,
                    encoded.len()
                );
                return Ok(NormalizedImage {
                    image: gray,
                    encoded,
                    quality,
                });
            }

            if quality > floor {
                quality = quality.saturating_sub(config.quality_step.max(1)).max(floor);
                continue;
            }

            let (width, height) = gray.dimensions();
            if width <= MIN_SIDE && height <= MIN_SIDE {
                return Err(ExtractError::Config(format!(
                    "max_file_size of {} bytes is too small for any encodable image",
                    config.max_file_size
                )));
            }
            let new_width = (width * 3 / 4).max(MIN_SIDE.min(width));
            let new_height = (height * 3 / 4).max(MIN_SIDE.min(height));
            gray = image::imageops::resize(&gray, new_width, new_height, FilterType::Triangle);
        }
    }

    pub(crate) fn encode_jpeg(gray: &GrayImage, quality: u8) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
        encoder
            .encode(gray.as_raw(), gray.width(), gray.height(), ColorType::L8)
            .map_err(|e| ExtractError::InvalidImage(format!("Failed to encode JPEG: {}", e)))?;
        Ok(buffer)
    }

    /// Blank white page used as a warm-up payload.
    pub fn blank(width: u32, height: u32) -> Result<NormalizedImage> {
        let image = GrayImage::from_pixel(width.max(1), height.max(1), image::Luma([255u8]));
        let encoded = Self::encode_jpeg(&image, 75)?;
        Ok(NormalizedImage {
            image,
            encoded,
            quality: 75,
        })
    }
}
