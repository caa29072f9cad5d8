//! Adapter between session buffers and the `image` crate's decoders and
//! encoders. Only PNG, JPEG and BMP are compiled in.

use chrono::Local;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use std::path::{Path, PathBuf};

use crate::error::{Result, SessionError};
use crate::session::ImageBuffer;

/// Decode `path`, rejecting images larger than `max_dimensions` from the
/// header alone, before any pixels are decoded.
pub fn load(path: &Path, max_dimensions: (u32, u32)) -> Result<ImageBuffer> {
    let (width, height) =
        image::image_dimensions(path).map_err(|err| SessionError::decode(path, err))?;
    let (max_width, max_height) = max_dimensions;
    if width > max_width || height > max_height {
        return Err(SessionError::ImageTooLarge {
            width,
            height,
            max_width,
            max_height,
        });
    }

    let decoded = image::open(path).map_err(|err| SessionError::decode(path, err))?;
    let buffer = from_dynamic(decoded).map_err(|err| SessionError::decode(path, err))?;
    tracing::info!(
        path = %path.display(),
        width = buffer.width(),
        height = buffer.height(),
        channels = buffer.channels(),
        "decoded image"
    );
    Ok(buffer)
}

/// Encode `buffer` to `path`; the format follows the file extension.
pub fn save(buffer: &ImageBuffer, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path).map_err(|err| SessionError::encode(path, err))?;
    let mut dynamic = to_dynamic(buffer).map_err(|err| SessionError::encode(path, err))?;
    if format == ImageFormat::Jpeg && buffer.channels() == 4 {
        dynamic = DynamicImage::ImageRgb8(dynamic.to_rgb8());
    }
    dynamic
        .save_with_format(path, format)
        .map_err(|err| SessionError::encode(path, err))?;
    tracing::info!(path = %path.display(), ?format, "saved image");
    Ok(())
}

/// Normalise any decoded image to 8-bit luma, RGB or RGBA.
pub fn from_dynamic(image: DynamicImage) -> Result<ImageBuffer> {
    let color = image.color();
    let (width, height) = (image.width(), image.height());
    if color.has_alpha() {
        ImageBuffer::new(width, height, 4, image.into_rgba8().into_raw())
    } else if color.has_color() {
        ImageBuffer::new(width, height, 3, image.into_rgb8().into_raw())
    } else {
        ImageBuffer::new(width, height, 1, image.into_luma8().into_raw())
    }
}

/// Copy a session buffer into an `image` crate container.
pub fn to_dynamic(buffer: &ImageBuffer) -> Result<DynamicImage> {
    let (width, height) = (buffer.width(), buffer.height());
    let pixels = buffer.pixels().to_vec();
    let dynamic = match buffer.channels() {
        1 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgba8),
        _ => None,
    };
    dynamic.ok_or_else(|| {
        SessionError::InvalidBuffer(format!(
            "cannot view {width}x{height}x{} buffer as an image",
            buffer.channels()
        ))
    })
}

pub fn timestamped_stem(stem: &str, now: chrono::DateTime<Local>) -> String {
    format!("{}_{}", stem, now.format("%Y%m%d_%H%M%S"))
}

/// `<dir>/<stem>_YYYYmmdd_HHMMSS.png` next to `input`.
pub fn default_output_path(input: &Path, now: chrono::DateTime<Local>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let dir = input.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("{}.png", timestamped_stem(&stem, now)))
}
