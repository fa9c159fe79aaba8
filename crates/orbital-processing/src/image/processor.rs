//! Image decoding and metadata collection

use image::{GenericImageView, ImageFormat, ImageReader};
use orbital_core::models::ImageMetadata;
use orbital_core::PipelineError;
use std::io::Cursor;

use super::exif_tags::read_exif_tags;

pub struct ImageProcessor;

/// Upper-case container name as stored in metadata documents.
pub fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "JPEG".to_string(),
        ImageFormat::Png => "PNG".to_string(),
        ImageFormat::Gif => "GIF".to_string(),
        ImageFormat::WebP => "WEBP".to_string(),
        ImageFormat::Tiff => "TIFF".to_string(),
        ImageFormat::Bmp => "BMP".to_string(),
        other => format!("{:?}", other).to_uppercase(),
    }
}

impl ImageProcessor {
    /// Decode `data` and collect dimensions, format and EXIF tags.
    ///
    /// CPU bound; async callers should run it on the blocking pool.
    pub fn read_metadata(data: &[u8]) -> Result<ImageMetadata, PipelineError> {
        let reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| PipelineError::Extraction(format!("Unreadable image: {}", e)))?;
        let format = reader
            .format()
            .ok_or_else(|| PipelineError::Extraction("Unrecognised image format".to_string()))?;
        let img = reader
            .decode()
            .map_err(|e| PipelineError::Extraction(format!("Failed to decode image: {}", e)))?;

        let (width, height) = img.dimensions();
        let mut metadata = ImageMetadata::new(width, height, format_name(format));
        for (key, value) in read_exif_tags(data) {
            if !metadata.insert_tag(key.as_str(), value) {
                tracing::debug!(tag = %key, "EXIF tag collides with a reserved field, dropped");
            }
        }

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 10, 10]));
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), format).unwrap();
        buffer
    }

    #[test]
    fn test_read_metadata_png() {
        let metadata = ImageProcessor::read_metadata(&encode(720, 636, ImageFormat::Png)).unwrap();

        assert_eq!(metadata.width, 720);
        assert_eq!(metadata.height, 636);
        assert_eq!(metadata.format, "PNG");
        assert!(metadata.tags.is_empty());
    }

    #[test]
    fn test_read_metadata_jpeg_without_exif() {
        let metadata = ImageProcessor::read_metadata(&encode(584, 560, ImageFormat::Jpeg)).unwrap();

        assert_eq!((metadata.width, metadata.height), (584, 560));
        assert_eq!(metadata.format, "JPEG");
    }

    #[test]
    fn test_invalid_image_is_extraction_error() {
        let err = ImageProcessor::read_metadata(b"not an image").unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }

    #[test]
    fn test_truncated_image_is_extraction_error() {
        let data = encode(64, 64, ImageFormat::Png);
        let err = ImageProcessor::read_metadata(&data[..data.len() / 2]).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }

    #[test]
    fn test_format_names() {
        assert_eq!(format_name(ImageFormat::Jpeg), "JPEG");
        assert_eq!(format_name(ImageFormat::WebP), "WEBP");
        assert_eq!(format_name(ImageFormat::Ico), "ICO");
    }
}
