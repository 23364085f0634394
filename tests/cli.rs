//! Command line tests

use std::io::Cursor;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_jpeg(path: &Path, width: u32, height: u32) {
    let img = image::RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8, y as u8, 100]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageOutputFormat::Jpeg(90))
        .unwrap();
    std::fs::write(path, out.into_inner()).unwrap();
}

/// The binary, run from `dir` so no stray config file is picked up
fn fastpipe(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("fastpipe").unwrap();
    cmd.current_dir(dir)
        .env_remove("FASTPIPE_CONFIG")
        .env_remove("FASTPIPE_THREADS")
        .env_remove("FASTPIPE_MAX_PIXELS");
    cmd
}

#[test]
fn test_help() {
    let dir = TempDir::new().unwrap();
    fastpipe(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("batch"));
}

#[test]
fn test_profiles() {
    let dir = TempDir::new().unwrap();
    fastpipe(dir.path())
        .args(["profiles", "--detailed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("thumbnail"))
        .stdout(predicate::str::contains("web"))
        .stdout(predicate::str::contains("--op resize=300x300"));
}

#[test]
fn test_run_single_file() {
    let dir = TempDir::new().unwrap();
    write_jpeg(&dir.path().join("in.jpg"), 160, 120);

    fastpipe(dir.path())
        .args(["run", "--input", "in.jpg", "--output", "out/small.png"])
        .args(["--op", "resize=64x48:fill", "--op", "greyscale", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"output_dimensions\""));

    let img = image::open(dir.path().join("out/small.png")).unwrap();
    assert_eq!((img.width(), img.height()), (64, 48));
    assert_eq!(img.color(), image::ColorType::L8);
}

#[test]
fn test_run_rejects_unsupported_option() {
    let dir = TempDir::new().unwrap();
    write_jpeg(&dir.path().join("in.jpg"), 32, 32);

    fastpipe(dir.path())
        .args(["run", "-i", "in.jpg", "-o", "out.png", "--chroma", "420"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("chroma_subsampling"));
    assert!(!dir.path().join("out.png").exists());
}

#[test]
fn test_run_rejects_bad_operation() {
    let dir = TempDir::new().unwrap();
    fastpipe(dir.path())
        .args(["run", "-i", "in.jpg", "-o", "out.png", "--op", "resize=0x10"])
        .assert()
        .failure();
}

#[test]
fn test_batch_with_json_summary() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("photos");
    std::fs::create_dir_all(input.join("nested")).unwrap();
    write_jpeg(&input.join("a.jpg"), 100, 80);
    write_jpeg(&input.join("nested/b.jpg"), 80, 100);
    std::fs::write(input.join("notes.txt"), "not an image").unwrap();

    fastpipe(dir.path())
        .args(["batch", "-i", "photos", "-o", "out", "-R", "--format", "webp"])
        .args(["--op", "resize=32x32", "--json", "--threads", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"succeeded\": 2"))
        .stdout(predicate::str::contains("\"failed\": 0"));

    assert!(dir.path().join("out/a.webp").exists());
    assert!(dir.path().join("out/nested/b.webp").exists());
}

#[test]
fn test_batch_dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("photos");
    std::fs::create_dir_all(&input).unwrap();
    write_jpeg(&input.join("a.jpg"), 20, 20);

    fastpipe(dir.path())
        .args(["batch", "-i", "photos", "-o", "out", "--profile", "thumbnail", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("a_thumb.webp"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn test_batch_reports_failures() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("photos");
    std::fs::create_dir_all(&input).unwrap();
    write_jpeg(&input.join("good.jpg"), 20, 20);
    std::fs::write(input.join("bad.jpg"), b"garbage bytes").unwrap();

    fastpipe(dir.path())
        .args(["batch", "-i", "photos", "-o", "out", "--format", "png", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"failed\": 1"))
        .stderr(predicate::str::contains("1 of 2 runs failed"));
    assert!(dir.path().join("out/good.png").exists());
}

#[test]
fn test_example_config_round_trip() {
    let dir = TempDir::new().unwrap();

    fastpipe(dir.path())
        .args(["example-config", "--output", "example.toml"])
        .assert()
        .success();
    fastpipe(dir.path())
        .args(["config", "example.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));

    fastpipe(dir.path())
        .args(["example-config", "--yaml"])
        .assert()
        .success();
    assert!(dir.path().join("fastpipe.yaml").exists());
}
