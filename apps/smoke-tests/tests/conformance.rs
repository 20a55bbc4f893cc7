use anyhow::Result;
use depthgen_core::{run_prediction, PredictRequest};
use depthgen_image::{is_allowed, resolve_resolution, Resolution, ALLOWED_RESOLUTIONS};
use depthgen_runtime_ort::PlaceholderBackend;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageFormat, Luma};

fn build_depth_png(width: u32, height: u32) -> Result<Vec<u8>> {
    let img = ImageBuffer::from_fn(width, height, |x, y| Luma([((x + y) % 256) as u8]));
    let mut out = Vec::new();
    DynamicImage::ImageLuma8(img).write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

fn request(width: u32, height: u32, seed: i64) -> Result<PredictRequest> {
    Ok(PredictRequest {
        input_bytes: Some(build_depth_png(width, height)?),
        width,
        height,
        seed,
        num_inference_steps: 4,
        ..PredictRequest::default()
    })
}

#[test]
fn snapped_resolution_is_always_in_catalog() {
    for (w, h) in [(1, 1), (1, 4096), (4096, 1), (1920, 1080), (333, 777), (8000, 6000)] {
        assert!(is_allowed(resolve_resolution(w, h)), "{}x{}", w, h);
    }
}

#[test]
fn catalog_entries_snap_to_themselves_and_their_transposes() {
    for entry in ALLOWED_RESOLUTIONS {
        assert_eq!(resolve_resolution(entry.width * 3, entry.height * 3), entry);
        assert_eq!(resolve_resolution(entry.height, entry.width), entry.transposed());
    }
}

#[test]
fn arbitrary_sizes_need_not_snap_symmetrically() {
    // Ratio distance is measured on w/h, so a size and its transpose can land on non-transposed entries.
    assert_eq!(resolve_resolution(640, 480), Resolution::new(1152, 896));
    assert_eq!(resolve_resolution(480, 640), Resolution::new(832, 1152));
}

#[test]
fn fixed_seed_gives_identical_images() -> Result<()> {
    let first = run_prediction(&PlaceholderBackend, &request(320, 180, 42)?)?;
    let second = run_prediction(&PlaceholderBackend, &request(320, 180, 42)?)?;
    assert_eq!(first.seed.value, 42);
    assert!(!first.seed.randomized);
    assert_eq!(first.image_png, second.image_png);
    Ok(())
}

#[test]
fn zero_seed_is_randomized() -> Result<()> {
    let result = run_prediction(&PlaceholderBackend, &request(64, 64, 0)?)?;
    assert!(result.seed.randomized);
    assert!(result.seed.value >= 1 && result.seed.value <= 65_535);
    Ok(())
}

#[test]
fn output_png_decodes_at_snapped_size() -> Result<()> {
    let result = run_prediction(&PlaceholderBackend, &request(400, 300, 7)?)?;
    assert_eq!((result.source_width, result.source_height), (400, 300));
    assert_eq!(Resolution::new(result.width, result.height), Resolution::new(1152, 896));
    let decoded = image::load_from_memory(&result.image_png)?;
    assert_eq!(decoded.dimensions(), (1152, 896));
    Ok(())
}

#[test]
fn invalid_parameters_fail_before_generation() -> Result<()> {
    let mut req = request(64, 64, 1)?;
    req.condition_scale = 1.5;
    assert!(run_prediction(&PlaceholderBackend, &req).is_err());
    req.condition_scale = 0.5;
    req.num_inference_steps = 0;
    assert!(run_prediction(&PlaceholderBackend, &req).is_err());
    Ok(())
}
