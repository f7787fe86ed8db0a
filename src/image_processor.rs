//! # Image Processing Module
//!
//! Questo modulo trasforma i byte di una singola immagine estratta dall'EPUB.
//!
//! ## Pipeline di trasformazione
//!
//! 1. **Rilevamento formato**: dai magic bytes, solo JPEG e PNG sono accettati
//! 2. **Decodifica**: in memoria con il crate `image`
//! 3. **Thumbnailing**: fit-within del box `max_resolution`, aspect ratio
//!    preservato, mai upscaling
//! 4. **Scala di grigi**: conversione a singolo canale se `keep_color = false`
//! 5. **Ricodifica**: nello stesso formato dell'originale
//!
//! La compressione remota (Tinify) non avviene qui: è asincrona e viene
//! applicata dal transcoder sui byte restituiti da `process()`.
//!
//! ## Formati Supportati
//!
//! | Formato | Input | Output |
//! |---------|-------|--------|
//! | JPEG    | ✅    | ✅ (qualità configurabile, default 75) |
//! | PNG     | ✅    | ✅ |
//! | Altri   | ❌    | ❌ `UnsupportedFormat` |
//!
//! ## Esempio
//!
//! ```ignore
//! let processor = ImageProcessor::new(&options);
//! let processed = processor.process("OEBPS/images/cover.jpg", &bytes)?;
//! println!("{}x{} -> {} bytes", processed.width, processed.height, processed.data.len());
//! ```

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageOutputFormat};
use std::io::Cursor;
use tracing::debug;

use crate::config::OptimizeOptions;
use crate::error::OptimizeError;

/// Result of transforming one image
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub data: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Decode, thumbnail, grayscale and re-encode images in their original format
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    max_resolution: Option<(u32, u32)>,
    keep_color: bool,
    jpeg_quality: u8,
}

impl ImageProcessor {
    pub fn new(options: &OptimizeOptions) -> Self {
        Self {
            max_resolution: options.max_resolution,
            keep_color: options.keep_color,
            jpeg_quality: options.jpeg_quality,
        }
    }

    /// Transform the encoded image stored under `entry`.
    ///
    /// # Errors
    /// * `ImageDecode` - bytes are not a decodable raster image
    /// * `UnsupportedFormat` - decodable, but neither JPEG nor PNG
    /// * `ImageEncode` - re-encoding failed
    pub fn process(&self, entry: &str, data: &[u8]) -> Result<ProcessedImage, OptimizeError> {
        let format = detect_format(entry, data)?;
        let mut image = image::load_from_memory_with_format(data, format).map_err(|source| {
            OptimizeError::ImageDecode {
                entry: entry.to_string(),
                source,
            }
        })?;

        let (original_width, original_height) = image.dimensions();

        if let Some(bound) = self.max_resolution {
            image = thumbnail(image, bound);
        }

        if !self.keep_color {
            image = to_grayscale(image);
        }

        let encoded = self.encode(&image, format)?;
        debug!(
            "{}: {}x{} -> {}x{}, {} -> {} bytes",
            entry,
            original_width,
            original_height,
            image.width(),
            image.height(),
            data.len(),
            encoded.len()
        );

        Ok(ProcessedImage {
            data: encoded,
            format,
            width: image.width(),
            height: image.height(),
        })
    }

    fn encode(&self, image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, OptimizeError> {
        let output_format = match format {
            ImageFormat::Jpeg => ImageOutputFormat::Jpeg(self.jpeg_quality),
            _ => ImageOutputFormat::Png,
        };

        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, output_format)?;
        Ok(buffer.into_inner())
    }
}

/// Detect JPEG/PNG from the leading bytes
fn detect_format(entry: &str, data: &[u8]) -> Result<ImageFormat, OptimizeError> {
    let format = image::guess_format(data).map_err(|source| OptimizeError::ImageDecode {
        entry: entry.to_string(),
        source,
    })?;

    match format {
        ImageFormat::Jpeg | ImageFormat::Png => Ok(format),
        other => Err(OptimizeError::UnsupportedFormat {
            entry: entry.to_string(),
            format: format!("{:?}", other),
        }),
    }
}

/// Dimensions that fit `(width, height)` inside `(max_width, max_height)`.
///
/// Aspect ratio is kept, results are rounded to the nearest pixel (at least 1)
/// and an image that already fits is returned unchanged.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }

    let ratio = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );

    let scale = |dimension: u32, max: u32| -> u32 {
        ((dimension as f64 * ratio).round() as u32).clamp(1, max.max(1))
    };

    (scale(width, max_width), scale(height, max_height))
}

/// Shrink to fit the bound, never enlarging
pub fn thumbnail(image: DynamicImage, (max_width, max_height): (u32, u32)) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = fit_within(width, height, max_width, max_height);

    if (new_width, new_height) == (width, height) {
        return image;
    }
    image.resize_exact(new_width, new_height, FilterType::Lanczos3)
}

/// Single-channel grayscale, alpha dropped. Single-channel images are returned as is.
pub fn to_grayscale(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLuma16(_) => image,
        DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => DynamicImage::ImageLuma16(image.to_luma16()),
        other => DynamicImage::ImageLuma8(other.to_luma8()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizeOptions;
    use image::{
        ColorType, GrayAlphaImage, GrayImage, ImageBuffer, Luma, LumaA, Rgb, RgbImage, Rgba,
        RgbaImage,
    };

    fn encode(image: DynamicImage, format: ImageOutputFormat) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, format).unwrap();
        buffer.into_inner()
    }

    fn rgb_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 200])
        }))
    }

    fn options(max_resolution: Option<(u32, u32)>, keep_color: bool) -> OptimizeOptions {
        OptimizeOptions {
            max_resolution,
            keep_color,
            ..Default::default()
        }
    }

    #[test]
    fn test_fit_within_never_upscales() {
        assert_eq!(fit_within(100, 100, 500, 500), (100, 100));
        assert_eq!(fit_within(500, 500, 500, 500), (500, 500));
    }

    #[test]
    fn test_fit_within_keeps_aspect_ratio() {
        assert_eq!(fit_within(400, 200, 100, 100), (100, 50));
        assert_eq!(fit_within(200, 400, 100, 100), (50, 100));
        assert_eq!(fit_within(1600, 2400, 1072, 1448), (965, 1448));
        assert_eq!(fit_within(3000, 10, 100, 100), (100, 1));
    }

    #[test]
    fn test_thumbnail_dimensions() {
        let small = thumbnail(rgb_image(100, 100), (500, 500));
        assert_eq!(small.dimensions(), (100, 100));

        let wide = thumbnail(rgb_image(400, 200), (100, 100));
        assert_eq!(wide.dimensions(), (100, 50));
    }

    #[test]
    fn test_grayscale_is_idempotent_on_single_channel() {
        let gray = GrayImage::from_fn(16, 8, |x, y| Luma([(x * 13 + y * 7) as u8]));
        let result = to_grayscale(DynamicImage::ImageLuma8(gray.clone()));
        assert_eq!(result.as_luma8().unwrap(), &gray);
    }

    #[test]
    fn test_grayscale_converts_color() {
        let result = to_grayscale(rgb_image(4, 4));
        assert_eq!(result.color(), ColorType::L8);
    }

    #[test]
    fn test_process_png_keeps_format() {
        let data = encode(rgb_image(400, 200), ImageOutputFormat::Png);
        let processor = ImageProcessor::new(&options(Some((100, 100)), false));

        let processed = processor.process("OEBPS/images/a.png", &data).unwrap();
        assert_eq!(processed.format, ImageFormat::Png);
        assert_eq!((processed.width, processed.height), (100, 50));

        let decoded = image::load_from_memory(&processed.data).unwrap();
        assert_eq!(image::guess_format(&processed.data).unwrap(), ImageFormat::Png);
        assert_eq!(decoded.dimensions(), (100, 50));
        assert_eq!(decoded.color(), ColorType::L8);
    }

    #[test]
    fn test_process_jpeg_keep_color() {
        let data = encode(rgb_image(64, 48), ImageOutputFormat::Jpeg(95));
        let processor = ImageProcessor::new(&options(None, true));

        let processed = processor.process("cover.jpg", &data).unwrap();
        assert_eq!(processed.format, ImageFormat::Jpeg);
        assert_eq!((processed.width, processed.height), (64, 48));

        let decoded = image::load_from_memory(&processed.data).unwrap();
        assert_eq!(decoded.color(), ColorType::Rgb8);
    }

    #[test]
    fn test_process_png_with_alpha_to_grayscale() {
        let rgba = RgbaImage::from_pixel(10, 10, Rgba([10, 200, 30, 128]));
        let data = encode(DynamicImage::ImageRgba8(rgba), ImageOutputFormat::Png);
        let processor = ImageProcessor::new(&options(None, false));

        let processed = processor.process("logo.png", &data).unwrap();
        let decoded = image::load_from_memory(&processed.data).unwrap();
        assert_eq!(decoded.color(), ColorType::L8);
        assert_eq!(decoded.color().channel_count(), 1);
    }

    #[test]
    fn test_grayscale_drops_alpha() {
        let rgba = RgbaImage::from_pixel(4, 4, Rgba([10, 200, 30, 128]));
        assert_eq!(to_grayscale(DynamicImage::ImageRgba8(rgba)).color(), ColorType::L8);

        let luma_alpha = GrayAlphaImage::from_pixel(4, 4, LumaA([90, 40]));
        let result = to_grayscale(DynamicImage::ImageLumaA8(luma_alpha));
        assert_eq!(result.color(), ColorType::L8);
        assert_eq!(result.as_luma8().unwrap().get_pixel(0, 0), &Luma([90]));
    }

    #[test]
    fn test_grayscale_keeps_16_bit_depth() {
        let rgb16 = ImageBuffer::<Rgb<u16>, Vec<u16>>::from_pixel(4, 4, Rgb([1000, 40000, 9000]));
        let result = to_grayscale(DynamicImage::ImageRgb16(rgb16));
        assert_eq!(result.color(), ColorType::L16);
    }

    #[test]
    fn test_process_rejects_garbage() {
        let processor = ImageProcessor::new(&options(None, false));
        let err = processor.process("broken.jpg", b"definitely not an image").unwrap_err();
        assert!(matches!(err, OptimizeError::ImageDecode { ref entry, .. } if entry == "broken.jpg"));
    }

    #[test]
    fn test_process_rejects_truncated_png() {
        let data = encode(rgb_image(32, 32), ImageOutputFormat::Png);
        let processor = ImageProcessor::new(&options(None, false));
        let err = processor.process("half.png", &data[..data.len() / 2]).unwrap_err();
        assert!(matches!(err, OptimizeError::ImageDecode { .. }));
    }

    #[test]
    fn test_process_rejects_other_formats() {
        let processor = ImageProcessor::new(&options(None, false));
        let gif_header = b"GIF89a\x01\x00\x01\x00\x00\x00\x00";
        let err = processor.process("anim.png", gif_header).unwrap_err();
        assert!(matches!(err, OptimizeError::UnsupportedFormat { .. }));
    }
}
