use image::codecs::png::PngEncoder;
use image::{ImageEncoder, ImageError, ImageReader, RgbaImage};
use std::io::Cursor;
use thiserror::Error;

/// Decoded RGBA8 raster. Every source is normalised to this layout before compositing.
pub type PixelBuffer = RgbaImage;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unrecognized image format")]
    Unrecognized,
    #[error("image exceeds max decoded pixels")]
    TooLarge,
    #[error("image has zero width or height")]
    Empty,
    #[error("malformed image data")]
    Malformed(#[source] ImageError),
}

#[derive(Debug, Error)]
#[error("png encode failed")]
pub struct EncodeError(#[from] ImageError);

pub fn decode(bytes: &[u8], max_pixels: u64) -> Result<PixelBuffer, DecodeError> {
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|_| DecodeError::Unrecognized)?;
    if reader.format().is_none() {
        return Err(DecodeError::Unrecognized);
    }
    reader.limits(raster_limits(max_pixels));
    let image = reader.decode().map_err(|err| match err {
        ImageError::Limits(_) => DecodeError::TooLarge,
        ImageError::Unsupported(_) => DecodeError::Unrecognized,
        other => DecodeError::Malformed(other),
    })?;
    if image.width() == 0 || image.height() == 0 {
        return Err(DecodeError::Empty);
    }
    let pixels = (image.width() as u64).saturating_mul(image.height() as u64);
    if pixels > max_pixels {
        return Err(DecodeError::TooLarge);
    }
    Ok(image.to_rgba8())
}

pub fn encode_png(buffer: &PixelBuffer) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    let encoder = PngEncoder::new(&mut bytes);
    encoder.write_image(
        buffer.as_raw(),
        buffer.width(),
        buffer.height(),
        image::ColorType::Rgba8.into(),
    )?;
    Ok(bytes)
}

fn raster_limits(max_pixels: u64) -> image::Limits {
    let max_dim = max_pixels.min(u32::MAX as u64) as u32;
    // Sized for the widest source layout, 16-bit RGBA.
    let max_alloc = max_pixels.saturating_mul(8);
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(max_dim);
    limits.max_image_height = Some(max_dim);
    limits.max_alloc = Some(max_alloc);
    limits
}

#[cfg(test)]
pub(crate) fn png_bytes(image: &PixelBuffer) -> Vec<u8> {
    encode_png(image).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::codecs::jpeg::JpegEncoder;
    use image::{DynamicImage, ExtendedColorType, ImageBuffer, ImageFormat, Rgb, RgbImage, Rgba};

    #[test]
    fn png_keeps_alpha_channel() {
        let mut image = RgbaImage::from_pixel(4, 3, Rgba([10, 20, 30, 255]));
        image.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        image.put_pixel(3, 2, Rgba([200, 100, 50, 128]));
        let decoded = decode(&png_bytes(&image), 1_000).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
        assert_eq!(decoded.get_pixel(3, 2), &Rgba([200, 100, 50, 128]));
        assert_eq!(decoded.get_pixel(1, 1), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn jpeg_decodes_as_opaque_rgba() {
        let image = RgbImage::from_pixel(8, 8, Rgb([120, 120, 120]));
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, 90)
            .encode_image(&image)
            .unwrap();
        let decoded = decode(&bytes, 1_000).unwrap();
        assert_eq!(decoded.dimensions(), (8, 8));
        assert!(decoded.pixels().all(|pixel| pixel.0[3] == 255));
    }

    #[test]
    fn gif_decodes_to_rgba() {
        let image = RgbaImage::from_pixel(6, 5, Rgba([255, 0, 0, 255]));
        let mut bytes = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut bytes);
            encoder
                .encode(image.as_raw(), 6, 5, ExtendedColorType::Rgba8)
                .unwrap();
        }
        let decoded = decode(&bytes, 1_000).unwrap();
        assert_eq!(decoded.dimensions(), (6, 5));
        for pixel in decoded.pixels() {
            assert_eq!(pixel.0[3], 255);
            assert!(pixel.0[0] > 240 && pixel.0[1] < 16 && pixel.0[2] < 16);
        }
    }

    #[test]
    fn sixteen_bit_png_fits_the_pixel_budget() {
        let wide: ImageBuffer<Rgba<u16>, Vec<u16>> =
            ImageBuffer::from_pixel(20, 20, Rgba([65_535, 0, 0, 65_535]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba16(wide)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        let decoded = decode(&bytes, 500).unwrap();
        assert_eq!(decoded.dimensions(), (20, 20));
        assert_eq!(decoded.get_pixel(7, 7), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn rejects_unknown_bytes() {
        let err = decode(b"definitely not an image", 1_000).unwrap_err();
        assert!(matches!(err, DecodeError::Unrecognized));
    }

    #[test]
    fn rejects_truncated_png() {
        let image = RgbaImage::from_pixel(16, 16, Rgba([1, 2, 3, 255]));
        let bytes = png_bytes(&image);
        let err = decode(&bytes[..bytes.len() / 2], 1_000).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn rejects_images_over_pixel_limit() {
        let image = RgbaImage::from_pixel(64, 64, Rgba([1, 2, 3, 255]));
        let err = decode(&png_bytes(&image), 100).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge));
    }
}
