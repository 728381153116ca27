//! Image classifier loading and inference through tract.
//!
//! `.onnx` files are loaded with `tract-onnx` and fed NCHW input, anything
//! else is treated as TFLite and fed NHWC.  Pixels are scaled to `[0, 1]`
//! after resizing to the configured input size.  The top-1 class of the
//! output score vector becomes the [`Detection`].

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::{InferenceFact, InferenceModelExt as _};
use tract_tflite::prelude::*;
use tracing::info;

use vigil_common::config::InferenceSection;
use vigil_common::detection::Detection;

/// TFLite FlatBuffer schema identifier at bytes 4..8.
const TFLITE_SCHEMA_ID: &[u8; 4] = b"TFL3";

/// Anything smaller is truncated or not a model at all.
const MIN_MODEL_SIZE: u64 = 1024;

/// Something that turns one image into a top-1 detection.
pub trait Classifier: Send {
    fn classify(&self, image: &RgbImage) -> Result<Detection>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Nchw,
    Nhwc,
}

/// A loaded model ready for inference.
pub struct TractClassifier {
    runner: TypedRunnableModel<TypedModel>,
    labels: Vec<String>,
    width: u32,
    height: u32,
    layout: Layout,
}

/// Load the configured classifier.  `Ok(None)` when no model is configured.
pub fn load_classifier(cfg: &InferenceSection) -> Result<Option<TractClassifier>> {
    let Some(model_path) = cfg.model_path.as_deref() else {
        return Ok(None);
    };
    let [width, height] = cfg.input_size;

    let is_onnx = model_path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("onnx"));
    let (runner, layout) = if is_onnx {
        (load_onnx_runner(model_path, width, height)?, Layout::Nchw)
    } else {
        (load_tflite_runner(model_path)?, Layout::Nhwc)
    };

    let labels = match cfg.labels_path.as_deref() {
        Some(p) => load_labels(p)?,
        None => Vec::new(),
    };

    Ok(Some(TractClassifier {
        runner,
        labels,
        width,
        height,
        layout,
    }))
}

/// Pre-flight checks on a TFLite file before handing it to tract: present,
/// plausibly sized, not an archive or an HTML error page, `TFL3` identifier
/// and a root offset inside the file.
fn validate_tflite_file(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("Model file not found: {}", path.display());
    }
    let meta = fs::metadata(path).with_context(|| format!("Cannot stat {}", path.display()))?;
    if meta.len() == 0 {
        bail!("Model file is empty (0 bytes): {}", path.display());
    }
    if meta.len() < MIN_MODEL_SIZE {
        bail!(
            "Model file is suspiciously small ({} bytes): {}",
            meta.len(),
            path.display()
        );
    }

    let header = {
        use std::io::Read;
        let mut f =
            fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        let mut buf = [0u8; 8];
        f.read_exact(&mut buf)
            .with_context(|| format!("Cannot read header of {}", path.display()))?;
        buf
    };

    if header.starts_with(b"PK\x03\x04") {
        bail!(
            "File is a zip archive, not a TFLite model: {}",
            path.display()
        );
    }
    if header.starts_with(b"<!") || header.starts_with(b"<h") || header.starts_with(b"<H") {
        bail!(
            "File is an HTML page, not a TFLite model: {}",
            path.display()
        );
    }
    if header[4..8] != *TFLITE_SCHEMA_ID {
        bail!(
            "Invalid TFLite schema identifier in {}: got {:?}",
            path.display(),
            &header[4..8]
        );
    }
    let root_offset = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if root_offset as u64 >= meta.len() {
        bail!(
            "TFLite root table offset ({root_offset}) exceeds file size ({} bytes) in {}",
            meta.len(),
            path.display()
        );
    }
    Ok(())
}

fn load_tflite_runner(path: &Path) -> Result<TypedRunnableModel<TypedModel>> {
    validate_tflite_file(path)
        .with_context(|| format!("Pre-flight check failed for {}", path.display()))?;
    info!("Loading TFLite classifier from {}", path.display());

    tract_tflite::tflite()
        .model_for_path(path)
        .with_context(|| format!("Cannot load TFLite model: {}", path.display()))?
        .into_optimized()
        .context("TFLite model optimisation failed")?
        .into_runnable()
        .context("Cannot make TFLite model runnable")
}

fn load_onnx_runner(path: &Path, width: u32, height: u32) -> Result<TypedRunnableModel<TypedModel>> {
    if !path.exists() {
        bail!("Model file not found: {}", path.display());
    }
    info!(
        "Loading ONNX classifier from {} (input {width}x{height})",
        path.display()
    );
    let fact: InferenceFact = f32::fact([1, 3, height as usize, width as usize]).into();

    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("Cannot load ONNX model: {}", path.display()))?
        .with_input_fact(0, fact)
        .context("Cannot set ONNX input shape")?
        .into_optimized()
        .context("ONNX model optimisation failed")?
        .into_runnable()
        .context("Cannot make ONNX model runnable")
}

impl TractClassifier {
    fn input_tensor(&self, image: &RgbImage) -> Tensor {
        let resized = image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
        let (w, h) = (self.width as usize, self.height as usize);
        let px = |x: usize, y: usize, c: usize| resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0;
        match self.layout {
            Layout::Nchw => {
                tract_ndarray::Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| px(x, y, c)).into()
            }
            Layout::Nhwc => {
                tract_ndarray::Array4::from_shape_fn((1, h, w, 3), |(_, y, x, c)| px(x, y, c)).into()
            }
        }
    }
}

impl Classifier for TractClassifier {
    fn classify(&self, image: &RgbImage) -> Result<Detection> {
        let input = self.input_tensor(image);
        let result = self
            .runner
            .run(tvec![input.into()])
            .context("Inference failed")?;
        let output = result[0]
            .to_array_view::<f32>()
            .context("Cannot read output tensor")?;
        let scores: Vec<f32> = output.iter().copied().collect();
        top1(&scores, &self.labels)
    }
}

/// Top-1 detection from a raw score vector.  Scores that are not already a
/// probability distribution go through softmax first.
pub fn top1(scores: &[f32], labels: &[String]) -> Result<Detection> {
    if scores.is_empty() {
        bail!("Model produced an empty output");
    }
    let probs = if is_distribution(scores) {
        scores.to_vec()
    } else {
        softmax(scores)
    };
    let (idx, &conf) = probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .context("Model produced no scores")?;
    if !conf.is_finite() {
        bail!("Model produced a non-finite score");
    }
    Ok(Detection {
        class_name: labels
            .get(idx)
            .cloned()
            .unwrap_or_else(|| idx.to_string()),
        class_id: idx as i64,
        confidence: (conf as f64).clamp(0.0, 1.0),
    })
}

fn is_distribution(scores: &[f32]) -> bool {
    let in_range = scores.iter().all(|&s| (0.0..=1.0).contains(&s));
    let sum: f32 = scores.iter().sum();
    in_range && (sum - 1.0).abs() < 1e-3
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// One label per line, blank lines kept so indices stay aligned.
fn load_labels(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Cannot read labels: {}", path.display()))?;
    let labels: Vec<String> = text.lines().map(|l| l.trim().to_string()).collect();
    info!("Loaded {} labels from {}", labels.len(), path.display());
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["background".into(), "excavator".into(), "crane".into()]
    }

    #[test]
    fn test_softmax() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1]);
        assert!(probs[1] > probs[0]);
    }

    #[test]
    fn test_top1_keeps_probabilities() {
        let d = top1(&[0.1, 0.7, 0.2], &labels()).unwrap();
        assert_eq!(d.class_name, "excavator");
        assert_eq!(d.class_id, 1);
        assert!((d.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_top1_applies_softmax_to_logits() {
        let d = top1(&[-2.0, 0.5, 4.0], &labels()).unwrap();
        assert_eq!(d.class_name, "crane");
        assert!(d.confidence > 0.9 && d.confidence <= 1.0);
    }

    #[test]
    fn test_top1_falls_back_to_numeric_label() {
        let d = top1(&[0.0, 0.0, 0.0, 1.0], &labels()).unwrap();
        assert_eq!(d.class_name, "3");
        assert_eq!(d.class_id, 3);
    }

    #[test]
    fn test_top1_rejects_empty_output() {
        assert!(top1(&[], &labels()).is_err());
    }

    #[test]
    fn test_no_model_configured() {
        let cfg = InferenceSection {
            model_path: None,
            ..vigil_common::config::Config::default().inference
        };
        assert!(load_classifier(&cfg).unwrap().is_none());
    }

    #[test]
    fn test_missing_model_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = InferenceSection {
            model_path: Some(dir.path().join("absent.onnx")),
            ..vigil_common::config::Config::default().inference
        };
        assert!(load_classifier(&cfg).is_err());
    }

    #[test]
    fn test_load_labels_keeps_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        fs::write(&path, "background\n excavator \n\ncrane\n").unwrap();
        let labels = load_labels(&path).unwrap();
        assert_eq!(labels, vec!["background", "excavator", "", "crane"]);
    }

    // ── validate_tflite_file ─────────────────────────────────────────

    fn write(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, data).unwrap();
        path
    }

    fn padded(prefix: &[u8]) -> Vec<u8> {
        let mut data = prefix.to_vec();
        data.resize(2048, 0);
        data
    }

    #[test]
    fn test_validate_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let cases: Vec<(&str, Vec<u8>, &str)> = vec![
            ("empty.tflite", vec![], "empty"),
            ("tiny.tflite", b"hello".to_vec(), "suspiciously small"),
            ("zip.tflite", padded(b"PK\x03\x04"), "zip archive"),
            ("page.tflite", padded(b"<!DOCTYPE html>"), "HTML"),
            ("id.tflite", padded(b"\x10\x00\x00\x00XXXX"), "schema identifier"),
            ("trunc.tflite", padded(b"\x3f\x42\x0f\x00TFL3"), "exceeds"),
        ];
        for (name, data, expected) in cases {
            let path = write(&dir, name, &data);
            let msg = validate_tflite_file(&path).unwrap_err().to_string();
            assert!(msg.contains(expected), "{name}: got {msg}");
        }
        let missing = validate_tflite_file(&dir.path().join("absent.tflite")).unwrap_err();
        assert!(missing.to_string().contains("not found"));
    }

    #[test]
    fn test_validate_accepts_well_formed_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "good.tflite", &padded(b"\x10\x00\x00\x00TFL3"));
        assert!(validate_tflite_file(&path).is_ok());
    }
}
