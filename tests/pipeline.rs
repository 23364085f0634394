//! End-to-end pipeline tests

use std::io::Cursor;

use fastpipe::config::{ChromaSubsampling, CropPosition, FitMode, Kernel};
use fastpipe::parallel::{BatchJob, ParallelRunner};
use fastpipe::processing::Source;
use fastpipe::{
    ErrorKind, ImageFormat, Operation, Pipeline, PipelineSpec, RunMode, RuntimeConfig, Stage,
};
use tempfile::TempDir;

fn pipeline() -> Pipeline {
    Pipeline::with_runtime(RuntimeConfig::default())
}

fn photo(width: u32, height: u32) -> image::RgbImage {
    image::RgbImage::from_fn(width, height, |x, y| {
        let ripple = ((x as f32 / 9.0).sin() * (y as f32 / 7.0).cos() * 60.0) as i32;
        image::Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            (128 + ripple).clamp(0, 255) as u8,
        ])
    })
}

fn encoded(image: image::DynamicImage, format: image::ImageOutputFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format).unwrap();
    out.into_inner()
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encoded(photo(width, height).into(), image::ImageOutputFormat::Jpeg(90))
}

fn png(width: u32, height: u32) -> Vec<u8> {
    encoded(photo(width, height).into(), image::ImageOutputFormat::Png)
}

fn dimensions(bytes: &[u8]) -> (u32, u32) {
    let img = image::load_from_memory(bytes).unwrap();
    (img.width(), img.height())
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
        }
    }
    !crc
}

fn chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u32).to_be_bytes().to_vec();
    let mut body = kind.to_vec();
    body.extend_from_slice(data);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32(&body).to_be_bytes());
    out
}

/// A PNG whose header claims `width`x`height` but carries no pixel data
fn png_header_only(width: u32, height: u32) -> Vec<u8> {
    let mut ihdr = Vec::new();
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 2, 0, 0, 0]);

    let mut out = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    out.extend(chunk(b"IHDR", &ihdr));
    out.extend(chunk(b"IDAT", &[]));
    out.extend(chunk(b"IEND", &[]));
    out
}

#[test]
fn test_cover_resize_of_jpeg() {
    let spec = PipelineSpec::new(ImageFormat::Jpeg).then(Operation::resize_with(
        640,
        392,
        FitMode::Cover,
        CropPosition::Centre,
        Kernel::Lanczos3,
    ));
    let output = pipeline().run(jpeg(800, 600), &spec, RunMode::Buffer).unwrap();
    assert_eq!(dimensions(&output), (640, 392));
}

#[test]
fn test_chroma_subsampling_on_png_is_rejected() {
    let spec = PipelineSpec::new(ImageFormat::Png).chroma_subsampling(ChromaSubsampling::Yuv420);
    let err = pipeline().run(jpeg(64, 64), &spec, RunMode::Buffer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOption);
}

#[test]
fn test_oversized_header_hits_the_ceiling() {
    let input = png_header_only(50_000, 50_000);
    let spec = PipelineSpec::new(ImageFormat::Png);

    let err = pipeline().run(input, &spec, RunMode::Buffer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    assert_eq!(err.stage(), Some(Stage::Decode));
}

#[test]
fn test_configured_ceiling_applies_to_small_inputs() {
    let settings = RuntimeConfig {
        max_pixels: 100 * 100,
        ..RuntimeConfig::default()
    };
    let err = Pipeline::with_runtime(settings)
        .run(png(101, 100), &PipelineSpec::new(ImageFormat::Png), RunMode::Buffer)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);
}

#[test]
fn test_corrupt_and_unknown_inputs() {
    let spec = PipelineSpec::new(ImageFormat::Png);

    let mut truncated = png(64, 64);
    truncated.truncate(truncated.len() / 2);
    let err = pipeline().run(truncated, &spec, RunMode::Buffer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert_eq!(err.stage(), Some(Stage::Decode));

    let err = pipeline().run(b"plain text".to_vec(), &spec, RunMode::Buffer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);

    let err = pipeline().run(Vec::new(), &spec, RunMode::Buffer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[test]
fn test_every_fit_mode_yields_exact_dimensions() {
    let input = jpeg(300, 200);
    for fit in [FitMode::Cover, FitMode::Contain, FitMode::Fill] {
        for (width, height) in [(100, 100), (50, 120), (600, 90), (1, 1)] {
            let spec = PipelineSpec::new(ImageFormat::Png).then(Operation::resize_with(
                width,
                height,
                fit,
                CropPosition::Attention,
                Kernel::Mitchell,
            ));
            let output = pipeline().run(input.clone(), &spec, RunMode::Buffer).unwrap();
            assert_eq!(dimensions(&output), (width, height), "{:?} {}x{}", fit, width, height);
        }
    }
}

#[test]
fn test_identical_runs_are_byte_identical() {
    let input = jpeg(320, 240);
    let spec = PipelineSpec::new(ImageFormat::Jpeg)
        .then(Operation::resize_with(
            200,
            200,
            FitMode::Cover,
            CropPosition::Entropy,
            Kernel::Lanczos3,
        ))
        .then(Operation::rotate(30.0))
        .then("sharpen=1.5:1:2".parse().unwrap())
        .then(Operation::gamma())
        .then(Operation::Normalize)
        .quality(85)
        .progressive(true);

    let first = pipeline().run(input.clone(), &spec, RunMode::Buffer).unwrap();
    let second = pipeline().run(input, &spec, RunMode::Buffer).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_lossless_outputs_preserve_pixels() {
    let source = photo(48, 32);
    let input = encoded(source.clone().into(), image::ImageOutputFormat::Png);

    for format in [ImageFormat::Png, ImageFormat::WebP] {
        let output = pipeline()
            .run(input.clone(), &PipelineSpec::new(format), RunMode::Buffer)
            .unwrap();
        let decoded = image::load_from_memory(&output).unwrap().to_rgb8();
        assert_eq!(decoded, source, "{}", format);
    }
}

#[test]
fn test_sigma_filters_leave_flat_images_alone() {
    let flat = image::RgbImage::from_pixel(24, 24, image::Rgb([100, 150, 200]));
    let input = encoded(flat.clone().into(), image::ImageOutputFormat::Png);

    for op in ["blur=1", "blur=3", "sharpen=1", "sharpen=3:1:2"] {
        let spec = PipelineSpec::new(ImageFormat::Png).then(op.parse().unwrap());
        let output = pipeline().run(input.clone(), &spec, RunMode::Buffer).unwrap();
        assert_eq!(image::load_from_memory(&output).unwrap().to_rgb8(), flat, "{}", op);
    }
}

#[test]
fn test_geometric_operations() {
    let input = png(120, 80);

    let quarter = PipelineSpec::new(ImageFormat::Png).then(Operation::rotate(90.0));
    let rotated = pipeline().run(input.clone(), &quarter, RunMode::Buffer).unwrap();
    assert_eq!(dimensions(&rotated), (80, 120));

    let eighth = PipelineSpec::new(ImageFormat::Png).then(Operation::rotate(45.0));
    let tilted = pipeline().run(input.clone(), &eighth, RunMode::Buffer).unwrap();
    let (w, h) = dimensions(&tilted);
    assert!(w > 120 && h > 80);

    let extract = Operation::Extract {
        left: 10,
        top: 20,
        width: 50,
        height: 40,
    };
    let cropped = pipeline()
        .run(input.clone(), &PipelineSpec::new(ImageFormat::Png).then(extract), RunMode::Buffer)
        .unwrap();
    assert_eq!(dimensions(&cropped), (50, 40));

    let outside = Operation::Extract {
        left: 100,
        top: 0,
        width: 50,
        height: 10,
    };
    let err = pipeline()
        .run(input.clone(), &PipelineSpec::new(ImageFormat::Png).then(outside), RunMode::Buffer)
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Geometric));

    // Flip twice is the identity
    let twice = PipelineSpec::new(ImageFormat::Png).then(Operation::Flip).then(Operation::Flip);
    let plain = pipeline()
        .run(input.clone(), &PipelineSpec::new(ImageFormat::Png), RunMode::Buffer)
        .unwrap();
    assert_eq!(pipeline().run(input, &twice, RunMode::Buffer).unwrap(), plain);
}

#[test]
fn test_greyscale_output_has_one_channel() {
    let spec = PipelineSpec::new(ImageFormat::Png).then(Operation::Greyscale);
    let output = pipeline().run(jpeg(40, 40), &spec, RunMode::Buffer).unwrap();
    let decoded = image::load_from_memory(&output).unwrap();
    assert_eq!(decoded.color(), image::ColorType::L8);
}

#[test]
fn test_alpha_survives_lossless_paths() {
    let rgba = image::RgbaImage::from_fn(30, 30, |x, y| {
        image::Rgba([x as u8 * 8, y as u8 * 8, 90, (x * 8) as u8])
    });
    let input = encoded(rgba.into(), image::ImageOutputFormat::Png);
    let spec = PipelineSpec::new(ImageFormat::Png)
        .then(Operation::resize_with(
            20,
            20,
            FitMode::Contain,
            CropPosition::Centre,
            Kernel::Cubic,
        ));

    let output = pipeline().run(input, &spec, RunMode::Buffer).unwrap();
    assert_eq!(image::load_from_memory(&output).unwrap().color(), image::ColorType::Rgba8);
}

#[test]
fn test_output_modes_agree() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("photo.jpg");
    std::fs::write(&input, jpeg(200, 150)).unwrap();
    let target = dir.path().join("out/photo.png");

    let spec = PipelineSpec::new(ImageFormat::Png).resize(100, 100);
    let pipeline = pipeline();

    let buffered = pipeline.run_file(&input, &spec, RunMode::Buffer).unwrap();
    let written = pipeline.run_file(&input, &spec, RunMode::File(target.clone())).unwrap();
    let mut streamed = Vec::new();
    pipeline.run_to_writer(Source::from(input.as_path()), &spec, &mut streamed).unwrap();

    assert_eq!(buffered, written);
    assert_eq!(buffered, streamed);
    assert_eq!(std::fs::read(&target).unwrap(), buffered);
}

#[test]
fn test_failed_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("never.png");
    let spec = PipelineSpec::new(ImageFormat::Png).then(Operation::Extract {
        left: 0,
        top: 0,
        width: 500,
        height: 500,
    });

    assert!(pipeline().run(png(20, 20), &spec, RunMode::File(target.clone())).is_err());
    assert!(!target.exists());
}

#[tokio::test]
async fn test_batch_results_follow_input_order() {
    let dir = TempDir::new().unwrap();
    let mut jobs = Vec::new();
    for (i, width) in [90u32, 30, 60, 120].iter().enumerate() {
        let path = dir.path().join(format!("{}.png", i));
        std::fs::write(&path, png(*width, 40)).unwrap();
        jobs.push(BatchJob::buffer(path));
    }

    let runner = ParallelRunner::with_concurrency(pipeline(), 3);
    let spec = PipelineSpec::new(ImageFormat::WebP).then(Operation::Flop);
    let result = runner.run_batch(jobs, &spec).await;

    assert_eq!(result.succeeded, 4);
    let widths: Vec<u32> = result
        .reports
        .iter()
        .map(|report| report.outcome.as_ref().unwrap().output_dimensions.0)
        .collect();
    assert_eq!(widths, vec![90, 30, 60, 120]);

    let state = runner.progress().get_state();
    assert_eq!(state.completed_runs, 4);
    assert_eq!(state.total_runs, 4);
}
