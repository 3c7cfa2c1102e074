//! Image preprocessing for model input
//!
//! Includes:
//! - Image decoding
//! - Aspect-preserving downscale
//! - Letterboxing onto a fixed square canvas

use anyhow::{Context, Result, bail};
use image::{DynamicImage, Rgb, RgbImage, imageops::FilterType};
use std::{fs::read, path::Path};

// ────────────────────────────────────────────────────────────────
// Decoding
// ────────────────────────────────────────────────────────────────

pub fn generate_dynamic_image_from_path(file_path: &Path) -> Result<DynamicImage> {
    let file_in_memory =
        read(file_path).context(format!("failed to read file into memory: {:?}", file_path))?;

    let decoders: Vec<fn(&[u8]) -> Result<DynamicImage>> = vec![image_crate_decoder];

    for decoder in decoders {
        match decoder(&file_in_memory) {
            Ok(decoded_image) => return Ok(decoded_image),
            Err(_) => continue,
        }
    }

    bail!("all decoders failed for file: {:?}", file_path);
}

fn image_crate_decoder(file_in_memory: &[u8]) -> Result<DynamicImage> {
    let dynamic_image = image::load_from_memory(file_in_memory)
        .context("image crate failed to decode image from memory")?;
    Ok(dynamic_image)
}

// ────────────────────────────────────────────────────────────────
// Letterbox
// ────────────────────────────────────────────────────────────────

/// Fit `image` inside a `size`×`size` black square, centred, never upscaling.
pub fn letterbox(image: &DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = small_width_height(image.width(), image.height(), size);
    let fitted = if (width, height) == (image.width(), image.height()) {
        image.to_rgb8()
    } else {
        image
            .resize_exact(width.max(1), height.max(1), FilterType::Lanczos3)
            .to_rgb8()
    };

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
    let x = (size - fitted.width()) / 2;
    let y = (size - fitted.height()) / 2;
    image::imageops::overlay(&mut canvas, &fitted, x as i64, y as i64);
    DynamicImage::ImageRgb8(canvas)
}

pub fn letterbox_from_path(file_path: &Path, size: u32) -> Result<DynamicImage> {
    let image = generate_dynamic_image_from_path(file_path)?;
    Ok(letterbox(&image, size))
}

/// Resize dimensions so that the larger side equals `small_height`, preserving aspect ratio
pub fn small_width_height(width: u32, height: u32, small_height: u32) -> (u32, u32) {
    let (nwidth, nheight) = if width >= std::cmp::max(height, small_height) {
        (small_height, height * small_height / width)
    } else if height >= std::cmp::max(width, small_height) {
        (width * small_height / height, small_height)
    } else {
        (width, height)
    };

    (nwidth, nheight)
}
