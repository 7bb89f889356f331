use std::collections::HashSet;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use image::imageops::{self, FilterType};
use image::RgbImage;
use log::{info, warn};
use ndarray::Array4;
use serde::Serialize;

use crate::checkpoint::{self, StateDict};
use crate::efficientnet::EfficientNet;
use crate::error::EngineError;
use crate::provision::{self, Transfer};

/// Class order used at training time (ImageFolder sorts class folders alphabetically).
pub const LABELS: [&str; 5] = ["alert", "angry", "frown", "happy", "relax"];

pub const INPUT_SIZE: u32 = 224;
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Checkpoint entries that bind `LABELS` to the weights.
const HEAD_PARAMS: [&str; 2] = ["classifier.weight", "classifier.bias"];
const REPORT_PREVIEW: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub emotion: &'static str,
    pub confidence: f32,
}

impl Prediction {
    /// Picks the most likely label from a softmax distribution over `LABELS`.
    pub fn from_probabilities(probs: &[f32]) -> Result<Self, EngineError> {
        if probs.len() != LABELS.len() {
            return Err(EngineError::OutputWidth {
                expected: LABELS.len(),
                found: probs.len(),
            });
        }
        let (index, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        // NaN never wins a comparison, so a poisoned distribution leaves -inf behind
        if !confidence.is_finite() || probs.iter().any(|p| !p.is_finite()) {
            return Err(EngineError::NonFiniteScores(probs.to_vec()));
        }
        Ok(Self {
            emotion: LABELS[index],
            confidence,
        })
    }
}

/// Anything that can turn an RGB frame into a prediction.
pub trait Classify: Send + Sync {
    fn predict(&self, image: &RgbImage) -> Result<Prediction, EngineError>;
}

/// How much disagreement between checkpoint and model is acceptable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadPolicy {
    Strict,
    /// Fails only when more than this fraction of model parameters stays uninitialized.
    Tolerant { max_missing_ratio: f64 },
}

impl LoadPolicy {
    pub fn check(&self, report: &LoadReport) -> Result<(), EngineError> {
        match *self {
            LoadPolicy::Strict if !report.missing.is_empty() || !report.unexpected.is_empty() => {
                Err(EngineError::Policy(format!(
                    "strict load: {} missing, {} unexpected",
                    report.missing.len(),
                    report.unexpected.len()
                )))
            }
            LoadPolicy::Tolerant { max_missing_ratio } if report.missing_ratio() > max_missing_ratio => {
                Err(EngineError::Policy(format!(
                    "{:.1}% of model parameters missing (limit {:.1}%)",
                    report.missing_ratio() * 100.0,
                    max_missing_ratio * 100.0
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of copying a checkpoint onto the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub matched: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn missing_ratio(&self) -> f64 {
        let total = self.matched + self.missing.len();
        if total == 0 {
            return 1.0;
        }
        self.missing.len() as f64 / total as f64
    }

    fn log(&self) {
        info!(
            "model loaded: {} parameters matched, {} missing, {} unexpected",
            self.matched,
            self.missing.len(),
            self.unexpected.len()
        );
        if !self.missing.is_empty() {
            warn!("missing keys: {}", preview(&self.missing));
        }
        if !self.unexpected.is_empty() {
            warn!("unexpected keys: {}", preview(&self.unexpected));
        }
    }
}

fn preview(names: &[String]) -> String {
    let shown = names[..names.len().min(REPORT_PREVIEW)].join(", ");
    if names.len() > REPORT_PREVIEW {
        format!("{shown}, ...")
    } else {
        shown
    }
}

/// Copies every checkpoint tensor whose name the model knows; shapes must agree.
pub fn apply_state(varmap: &VarMap, state: &StateDict) -> Result<LoadReport, EngineError> {
    let vars = varmap.data().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut report = LoadReport::default();

    for (name, var) in vars.iter() {
        let Some(value) = state.get(name) else {
            report.missing.push(name.clone());
            continue;
        };
        if value.dims() != var.dims() {
            return Err(EngineError::ShapeMismatch {
                name: name.clone(),
                expected: var.dims().to_vec(),
                found: value.dims().to_vec(),
            });
        }
        var.set(&value.to_dtype(var.dtype())?)?;
        report.matched += 1;
    }

    let known: HashSet<&String> = vars.keys().collect();
    report.unexpected = state.keys().filter(|name| !known.contains(name)).cloned().collect();
    report.missing.sort();
    report.unexpected.sort();
    Ok(report)
}

/// The vocabulary is only meaningful if the trained classifier head came with the weights.
pub fn verify_label_binding(weights_path: &Path, state: &StateDict) -> Result<(), EngineError> {
    for name in HEAD_PARAMS {
        if !state.contains_key(name) {
            return Err(EngineError::LabelBinding(format!("checkpoint has no `{name}`")));
        }
    }

    let sidecar = labels_sidecar(weights_path);
    match std::fs::read(&sidecar) {
        Ok(bytes) => {
            let labels: Vec<String> = serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::LabelBinding(format!("{}: {e}", sidecar.display())))?;
            if labels != LABELS {
                return Err(EngineError::LabelBinding(format!(
                    "{} lists {labels:?}, server expects {LABELS:?}",
                    sidecar.display()
                )));
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => warn!(
            "no {} next to the weights; assuming class order {LABELS:?}",
            sidecar.display()
        ),
        Err(err) => {
            return Err(EngineError::LabelBinding(format!(
                "cannot read {}: {err}",
                sidecar.display()
            )))
        }
    }
    Ok(())
}

fn labels_sidecar(weights_path: &Path) -> PathBuf {
    weights_path.with_extension("labels.json")
}

/// Resize to 224x224 (aspect ratio is not kept), scale to [0, 1], normalize per channel.
pub fn preprocess(image: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let size = INPUT_SIZE as usize;

    let mut input_tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            input_tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    input_tensor
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub weights_path: PathBuf,
    pub weights_url: String,
    pub policy: LoadPolicy,
}

pub struct EmotionClassifier {
    model: EfficientNet,
    device: Device,
}

impl EmotionClassifier {
    /// provision -> adapt checkpoint -> construct model -> load parameters.
    pub fn load(settings: &EngineSettings, transfer: &dyn Transfer) -> Result<Self, EngineError> {
        provision::ensure_model_file(&settings.weights_path, &settings.weights_url, transfer)?;

        let device = Device::Cpu;
        let state = checkpoint::load_state(&settings.weights_path, &device)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = EfficientNet::b0(LABELS.len(), vb)?;

        let report = apply_state(&varmap, &state)?;
        report.log();
        settings.policy.check(&report)?;
        verify_label_binding(&settings.weights_path, &state)?;

        Ok(Self { model, device })
    }
}

impl Classify for EmotionClassifier {
    fn predict(&self, image: &RgbImage) -> Result<Prediction, EngineError> {
        let size = INPUT_SIZE as usize;
        let (data, _) = preprocess(image).into_raw_vec_and_offset();
        let input = Tensor::from_vec(data, (1, 3, size, size), &self.device)?;

        let logits = self.model.forward_t(&input, false)?;
        let probs = candle_nn::ops::softmax(&logits, 1)?.squeeze(0)?.to_vec1::<f32>()?;
        Prediction::from_probabilities(&probs)
    }
}
