//! Visual probes: luminance sampling over image artifacts.
//!
//! A probe matches image files in the working tree and reports, per image,
//! the ratio of clear (near-white) pixels, the ratio of near-black pixels,
//! and the luminance standard deviation. A render that came out blank or
//! black shows up immediately in these numbers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for one visual probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualProbe {
    /// Stable probe identifier (used in artifact paths).
    pub id: String,
    /// Glob over repository-relative paths, e.g. `screenshots/**/*.png`.
    pub pattern: String,
}

/// Measurements for a single sampled image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub probe_id: String,
    pub path: String,
    /// Fraction of pixels with luminance >= 250.
    pub clear_ratio: f64,
    /// Fraction of pixels with luminance <= 5.
    pub near_black_ratio: f64,
    /// Standard deviation of pixel luminance.
    pub luminance_stddev: f64,
}

/// Run all probes against the working tree.
///
/// When `artifact_dir` is set, each sampled image is copied to
/// `<artifact_dir>/<probe_id>/<relative_path>` for later inspection.
pub fn run_visual_probes(
    repo: &Path,
    probes: &[VisualProbe],
    artifact_dir: Option<&Path>,
) -> Result<Vec<ProbeResult>> {
    let mut results = Vec::new();

    for probe in probes {
        let matcher = GlobBuilder::new(&probe.pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid probe pattern {:?}", probe.pattern))?
            .compile_matcher();

        let mut files = Vec::new();
        collect_matching_files(repo, repo, &matcher, &mut files)?;

        for rel in files {
            let abs = repo.join(&rel);
            match analyze_image(&abs) {
                Ok((clear_ratio, near_black_ratio, luminance_stddev)) => {
                    if let Some(dir) = artifact_dir {
                        let dest = dir.join(&probe.id).join(&rel);
                        if let Some(parent) = dest.parent() {
                            if let Err(e) = std::fs::create_dir_all(parent) {
                                warn!(error = %e, "failed to create probe artifact dir");
                            }
                        }
                        if let Err(e) = std::fs::copy(&abs, &dest) {
                            warn!(path = %abs.display(), error = %e, "failed to copy probe artifact");
                        }
                    }
                    results.push(ProbeResult {
                        probe_id: probe.id.clone(),
                        path: rel,
                        clear_ratio,
                        near_black_ratio,
                        luminance_stddev,
                    });
                }
                Err(e) => {
                    debug!(path = %abs.display(), error = %e, "skipping unreadable probe image");
                }
            }
        }
    }

    Ok(results)
}

fn collect_matching_files(
    root: &Path,
    dir: &Path,
    matcher: &GlobMatcher,
    out: &mut Vec<String>,
) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            collect_matching_files(root, &path, matcher, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .expect("walked path is always under root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if matcher.is_match(&rel) {
                out.push(rel);
            }
        }
    }

    Ok(())
}

/// Decode an image and compute (clear_ratio, near_black_ratio, stddev)
/// over its 8-bit luminance.
pub fn analyze_image(path: &Path) -> Result<(f64, f64, f64)> {
    let img = image::open(path)
        .with_context(|| format!("failed to decode image {}", path.display()))?;
    let luma = img.to_luma8();
    let pixels = luma.as_raw();

    if pixels.is_empty() {
        anyhow::bail!("image {} has no pixels", path.display());
    }

    let total = pixels.len() as f64;
    let mut clear = 0usize;
    let mut near_black = 0usize;
    let mut sum = 0f64;

    for &p in pixels {
        if p >= 250 {
            clear += 1;
        }
        if p <= 5 {
            near_black += 1;
        }
        sum += f64::from(p);
    }

    let mean = sum / total;
    let variance = pixels
        .iter()
        .map(|&p| {
            let d = f64::from(p) - mean;
            d * d
        })
        .sum::<f64>()
        / total;

    Ok((clear as f64 / total, near_black as f64 / total, variance.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_gray_png(path: &Path, width: u32, height: u32, value: u8) {
        let img = GrayImage::from_pixel(width, height, Luma([value]));
        img.save(path).unwrap();
    }

    #[test]
    fn all_white_image_is_fully_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        write_gray_png(&path, 8, 8, 255);

        let (clear, black, stddev) = analyze_image(&path).unwrap();
        assert_eq!(clear, 1.0);
        assert_eq!(black, 0.0);
        assert_eq!(stddev, 0.0);
    }

    #[test]
    fn all_black_image_is_fully_near_black() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("black.png");
        write_gray_png(&path, 8, 8, 0);

        let (clear, black, _stddev) = analyze_image(&path).unwrap();
        assert_eq!(clear, 0.0);
        assert_eq!(black, 1.0);
    }

    #[test]
    fn mixed_image_has_nonzero_stddev() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.png");
        let mut img = GrayImage::new(2, 1);
        img.put_pixel(0, 0, Luma([0]));
        img.put_pixel(1, 0, Luma([255]));
        img.save(&path).unwrap();

        let (clear, black, stddev) = analyze_image(&path).unwrap();
        assert_eq!(clear, 0.5);
        assert_eq!(black, 0.5);
        assert!(stddev > 100.0);
    }

    #[test]
    fn probes_match_globs_and_copy_artifacts() {
        let repo = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join("shots")).unwrap();
        write_gray_png(&repo.path().join("shots/a.png"), 4, 4, 255);
        std::fs::write(repo.path().join("shots/ignore.txt"), "x").unwrap();

        let probes = vec![VisualProbe {
            id: "render".into(),
            pattern: "shots/**/*.png".into(),
        }];

        let results =
            run_visual_probes(repo.path(), &probes, Some(artifacts.path())).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "shots/a.png");
        assert_eq!(results[0].clear_ratio, 1.0);
        assert!(artifacts.path().join("render/shots/a.png").exists());
    }

    #[test]
    fn no_matches_yields_empty_results() {
        let repo = tempfile::tempdir().unwrap();
        let probes = vec![VisualProbe {
            id: "render".into(),
            pattern: "shots/**/*.png".into(),
        }];
        let results = run_visual_probes(repo.path(), &probes, None).unwrap();
        assert!(results.is_empty());
    }
}
