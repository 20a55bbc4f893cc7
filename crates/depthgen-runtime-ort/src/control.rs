use std::fs;

use anyhow::{anyhow, Result};
use depthgen_core::{CoreError, PredictRequest};
use depthgen_image::Resolution;
use image::{imageops::FilterType, DynamicImage, GrayImage, ImageFormat, Luma, RgbImage};
use ndarray::{ArrayD, IxDyn};

use crate::session::ModelSession;

const DEPTH_INPUT_SIZE: u32 = 384;

pub fn load_image(request: &PredictRequest) -> Result<DynamicImage, CoreError> {
    if let Some(bytes) = &request.input_bytes {
        return image::load_from_memory(bytes).map_err(|e| CoreError::Backend(e.to_string()));
    }
    if let Some(path) = &request.input_path {
        let bytes = fs::read(path).map_err(|e| CoreError::Backend(format!("{}: {}", path.display(), e)))?;
        return image::load_from_memory(&bytes).map_err(|e| CoreError::Backend(e.to_string()));
    }
    Err(CoreError::MissingInput)
}

/// The conditioning image as `[1, 3, H, W]` RGB in `[0, 1]` at the output resolution.
pub fn control_tensor(image: &DynamicImage, resolution: Resolution) -> ArrayD<f32> {
    let rgb = image
        .resize_exact(resolution.width, resolution.height, FilterType::Lanczos3)
        .to_rgb8();
    rgb_to_tensor(&rgb, |v| v as f32 / 255.0)
}

fn rgb_to_tensor(rgb: &RgbImage, map: impl Fn(u8) -> f32) -> ArrayD<f32> {
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let mut tensor = ArrayD::zeros(IxDyn(&[1, 3, h, w]));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = map(pixel[c]);
        }
    }
    tensor
}

/// Turns an ordinary photo into a depth map with DPT, scaled to `resolution` and replicated to RGB.
pub(crate) fn estimate_depth(session: &ModelSession, image: &DynamicImage, resolution: Resolution) -> Result<DynamicImage> {
    let resized = image
        .resize_exact(DEPTH_INPUT_SIZE, DEPTH_INPUT_SIZE, FilterType::CatmullRom)
        .to_rgb8();
    // DPT normalizes with mean 0.5 and std 0.5 on every channel.
    let pixel_values = rgb_to_tensor(&resized, |v| (v as f32 / 255.0 - 0.5) / 0.5);
    let depth = session.run_first(vec![session.input("pixel_values", pixel_values)?])?;
    let map = depth_to_gray(&depth)?;
    let scaled = image::imageops::resize(&map, resolution.width, resolution.height, FilterType::CatmullRom);
    Ok(DynamicImage::ImageLuma8(scaled).to_rgb8().into())
}

/// Min-max normalizes a `[1, H, W]` or `[1, 1, H, W]` depth prediction into a grayscale image.
pub(crate) fn depth_to_gray(depth: &ArrayD<f32>) -> Result<GrayImage> {
    let shape = depth.shape();
    let (h, w) = match shape.len() {
        4 => (shape[2], shape[3]),
        3 => (shape[1], shape[2]),
        2 => (shape[0], shape[1]),
        _ => return Err(anyhow!("unsupported depth output dimensions: {:?}", shape)),
    };
    let values: Vec<f32> = depth.iter().copied().take(h * w).collect();
    let min_v = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max_v = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = (max_v - min_v).max(1e-6);

    let mut gray = GrayImage::new(w as u32, h as u32);
    for (idx, v) in values.into_iter().enumerate() {
        let normalized = ((v - min_v) / range).clamp(0.0, 1.0);
        gray.put_pixel((idx % w) as u32, (idx / w) as u32, Luma([(normalized * 255.0).round() as u8]));
    }
    Ok(gray)
}

/// Maps a decoded `[1, 3, H, W]` sample in `[-1, 1]` to PNG bytes.
pub(crate) fn decoded_to_png(sample: &ArrayD<f32>) -> Result<(Vec<u8>, u32, u32)> {
    let shape = sample.shape();
    if shape.len() != 4 || shape[1] != 3 {
        return Err(anyhow!("unexpected decoder output shape: {:?}", shape));
    }
    let (h, w) = (shape[2], shape[3]);
    let mut rgb = RgbImage::new(w as u32, h as u32);
    for (x, y, pixel) in rgb.enumerate_pixels_mut() {
        for c in 0..3 {
            let v = sample[[0, c, y as usize, x as usize]];
            pixel[c] = ((v / 2.0 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8;
        }
    }
    let png = encode_png(DynamicImage::ImageRgb8(rgb))?;
    Ok((png, w as u32, h as u32))
}

pub(crate) fn encode_png(image: DynamicImage) -> Result<Vec<u8>> {
    let mut encoded = Vec::new();
    image.write_to(&mut std::io::Cursor::new(&mut encoded), ImageFormat::Png)?;
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn control_tensor_matches_resolution_and_range() {
        let mut img = RgbImage::new(30, 20);
        img.put_pixel(0, 0, Rgb([255, 0, 128]));
        let tensor = control_tensor(&DynamicImage::ImageRgb8(img), Resolution::new(64, 128));
        assert_eq!(tensor.shape(), &[1, 3, 128, 64]);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn depth_is_normalized_to_full_range() {
        let depth = ArrayD::from_shape_vec(IxDyn(&[1, 2, 2]), vec![2.0, 4.0, 6.0, 10.0]).expect("shape");
        let gray = depth_to_gray(&depth).expect("gray");
        assert_eq!(gray.get_pixel(0, 0)[0], 0);
        assert_eq!(gray.get_pixel(1, 1)[0], 255);
        assert_eq!(gray.get_pixel(1, 0)[0], 64);
    }

    #[test]
    fn flat_depth_does_not_divide_by_zero() {
        let depth = ArrayD::from_elem(IxDyn(&[1, 1, 3, 3]), 5.0f32);
        let gray = depth_to_gray(&depth).expect("gray");
        assert!(gray.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn decoded_sample_maps_to_png() {
        let mut sample = ArrayD::from_elem(IxDyn(&[1, 3, 4, 2]), -1.0f32);
        sample[[0, 0, 0, 0]] = 1.0;
        let (png, w, h) = decoded_to_png(&sample).expect("png");
        assert_eq!((w, h), (2, 4));
        let decoded = image::load_from_memory(&png).expect("decode").to_rgb8();
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(decoded.get_pixel(1, 3), &Rgb([0, 0, 0]));
    }

    #[test]
    fn missing_input_is_reported() {
        let request = PredictRequest::default();
        assert!(matches!(load_image(&request), Err(CoreError::MissingInput)));
    }
}
