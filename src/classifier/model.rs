//! Calibrated binary classifiers loaded from versioned JSON artifacts.
//!
//! An artifact declares the ordered feature columns it was trained on. The
//! schema is checked when the artifact is loaded, so a model that expects a
//! column the extractor no longer produces is rejected at startup of the
//! scoring run rather than silently fed zeros.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ScoreError};
use crate::features::FEATURE_COLUMNS;

pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// A binary classifier producing positive-class probabilities.
pub trait ProbabilityModel: Send + Sync {
    /// Feature columns, in the order `predict_proba` expects them.
    fn feature_names(&self) -> &[String];

    fn predict_proba(&self, rows: &[Vec<f64>]) -> Vec<f64>;
}

/// Resolves a model by device-class name.
pub trait ModelSource: Send + Sync {
    /// `Ok(None)` when no artifact exists for the name.
    fn load(&self, name: &str) -> Result<Option<Arc<dyn ProbabilityModel>>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub schema_version: u32,
    pub name: String,
    pub features: Vec<String>,
    pub model: ModelBody,
    #[serde(default)]
    pub calibration: Option<PlattCalibration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelBody {
    Logistic {
        intercept: f64,
        coefficients: Vec<f64>,
    },
    TreeEnsemble {
        #[serde(default)]
        base_score: f64,
        trees: Vec<Tree>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

/// Node 0 is the root. A split sends `x[feature] <= threshold` left.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// Platt scaling applied to the raw margin: `sigmoid(a * margin + b)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlattCalibration {
    pub a: f64,
    pub b: f64,
}

impl ModelArtifact {
    pub fn from_json(device: &str, text: &str) -> Result<Self> {
        let artifact: ModelArtifact = serde_json::from_str(text)
            .map_err(|e| ScoreError::model_unavailable(device, format!("invalid artifact: {e}")))?;
        artifact.validate(device)?;
        Ok(artifact)
    }

    /// Reject artifacts whose schema does not match what the extractor produces.
    pub fn validate(&self, device: &str) -> Result<()> {
        let fail = |reason: String| Err(ScoreError::model_unavailable(device, reason));

        if self.schema_version != SUPPORTED_SCHEMA_VERSION {
            return fail(format!(
                "artifact {} has schema version {}, expected {}",
                self.name, self.schema_version, SUPPORTED_SCHEMA_VERSION
            ));
        }
        if self.features.is_empty() {
            return fail(format!("artifact {} declares no features", self.name));
        }
        if let Some(unknown) = self
            .features
            .iter()
            .find(|f| !FEATURE_COLUMNS.contains(&f.as_str()))
        {
            return fail(format!(
                "artifact {} expects feature '{unknown}' which is not extracted",
                self.name
            ));
        }

        match &self.model {
            ModelBody::Logistic { coefficients, .. } => {
                if coefficients.len() != self.features.len() {
                    return fail(format!(
                        "artifact {} has {} coefficients for {} features",
                        self.name,
                        coefficients.len(),
                        self.features.len()
                    ));
                }
            }
            ModelBody::TreeEnsemble { trees, .. } => {
                for (t, tree) in trees.iter().enumerate() {
                    if tree.nodes.is_empty() {
                        return fail(format!("artifact {} tree {t} is empty", self.name));
                    }
                    for node in &tree.nodes {
                        if let TreeNode::Split {
                            feature,
                            left,
                            right,
                            ..
                        } = node
                        {
                            let n = tree.nodes.len();
                            if *feature >= self.features.len() || *left >= n || *right >= n {
                                return fail(format!(
                                    "artifact {} tree {t} references a node or feature out of range",
                                    self.name
                                ));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn margin(&self, row: &[f64]) -> f64 {
        match &self.model {
            ModelBody::Logistic {
                intercept,
                coefficients,
            } => {
                intercept
                    + coefficients
                        .iter()
                        .zip(row)
                        .map(|(c, x)| c * x)
                        .sum::<f64>()
            }
            ModelBody::TreeEnsemble { base_score, trees } => {
                base_score + trees.iter().map(|t| t.evaluate(row)).sum::<f64>()
            }
        }
    }
}

impl Tree {
    fn evaluate(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        // A malformed tree could cycle; never walk more steps than there are nodes.
        for _ in 0..=self.nodes.len() {
            let Some(node) = self.nodes.get(idx) else {
                return 0.0;
            };
            match node {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let x = row.get(*feature).copied().unwrap_or(0.0);
                    idx = if x <= *threshold { *left } else { *right };
                }
            }
        }
        0.0
    }
}

impl ProbabilityModel for ModelArtifact {
    fn feature_names(&self) -> &[String] {
        &self.features
    }

    fn predict_proba(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        let (a, b) = self
            .calibration
            .map(|c| (c.a, c.b))
            .unwrap_or((1.0, 0.0));
        rows.iter()
            .map(|row| sigmoid(a * self.margin(row) + b))
            .collect()
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Loads artifacts from a directory, first match of
/// `level4_{name}_slot_enhanced.json`, `level4_{name}_slot.json`, `level4_{name}.json`.
pub struct ArtifactDirectory {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<dyn ProbabilityModel>>>,
}

impl ArtifactDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn candidates(&self, name: &str) -> [PathBuf; 3] {
        [
            self.dir.join(format!("level4_{name}_slot_enhanced.json")),
            self.dir.join(format!("level4_{name}_slot.json")),
            self.dir.join(format!("level4_{name}.json")),
        ]
    }
}

impl ModelSource for ArtifactDirectory {
    fn load(&self, name: &str) -> Result<Option<Arc<dyn ProbabilityModel>>> {
        if let Some(model) = self.cache.lock().ok().and_then(|c| c.get(name).cloned()) {
            return Ok(Some(model));
        }

        let Some(path) = self.candidates(name).into_iter().find(|p| p.is_file()) else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(&path)?;
        let artifact = ModelArtifact::from_json(name, &text)?;
        info!(device = name, path = %path.display(), model = %artifact.name, "loaded model artifact");

        let model: Arc<dyn ProbabilityModel> = Arc::new(artifact);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name.to_string(), Arc::clone(&model));
        }
        Ok(Some(model))
    }
}

/// Fixed set of models, keyed by device-class name.
#[derive(Default)]
pub struct StaticModels {
    models: HashMap<String, Arc<dyn ProbabilityModel>>,
}

impl StaticModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, model: Arc<dyn ProbabilityModel>) -> Self {
        self.models.insert(name.to_string(), model);
        self
    }
}

impl ModelSource for StaticModels {
    fn load(&self, name: &str) -> Result<Option<Arc<dyn ProbabilityModel>>> {
        Ok(self.models.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logistic(features: &[&str], intercept: f64, coefficients: Vec<f64>) -> ModelArtifact {
        ModelArtifact {
            schema_version: SUPPORTED_SCHEMA_VERSION,
            name: "test".into(),
            features: features.iter().map(|s| s.to_string()).collect(),
            model: ModelBody::Logistic {
                intercept,
                coefficients,
            },
            calibration: None,
        }
    }

    #[test]
    fn logistic_zero_margin_is_one_half() {
        let model = logistic(&["slots"], 0.0, vec![0.0]);
        assert_eq!(model.predict_proba(&[vec![10.0]]), vec![0.5]);
    }

    #[test]
    fn logistic_increases_with_positive_coefficient() {
        let model = logistic(&["slots", "pageViews"], -1.0, vec![0.5, 0.1]);
        let p = model.predict_proba(&[vec![0.0, 0.0], vec![4.0, 10.0]]);
        assert!(p[0] < 0.5);
        assert!(p[1] > 0.5);
    }

    #[test]
    fn calibration_shifts_margin() {
        let mut model = logistic(&["slots"], 0.0, vec![0.0]);
        model.calibration = Some(PlattCalibration { a: 1.0, b: 2.0 });
        let p = model.predict_proba(&[vec![0.0]])[0];
        assert!((p - sigmoid(2.0)).abs() < 1e-12);
    }

    #[test]
    fn tree_ensemble_walks_splits() {
        let json = r#"{
            "schema_version": 1,
            "name": "level4_mobile_slot",
            "features": ["slots", "duration"],
            "model": {
                "kind": "tree_ensemble",
                "base_score": 0.0,
                "trees": [
                    {"nodes": [
                        {"feature": 0, "threshold": 2.5, "left": 1, "right": 2},
                        {"value": -2.0},
                        {"value": 2.0}
                    ]},
                    {"nodes": [{"value": 0.5}]}
                ]
            }
        }"#;
        let model = ModelArtifact::from_json("mobile", json).unwrap();
        let p = model.predict_proba(&[vec![1.0, 0.0], vec![3.0, 0.0]]);
        assert!((p[0] - sigmoid(-1.5)).abs() < 1e-12);
        assert!((p[1] - sigmoid(2.5)).abs() < 1e-12);
    }

    #[test]
    fn rejects_unknown_feature() {
        let model = logistic(&["slots", "scroll_depth"], 0.0, vec![1.0, 1.0]);
        let err = model.validate("desktop").unwrap_err();
        assert!(err.to_string().contains("scroll_depth"));
    }

    #[test]
    fn rejects_schema_version_mismatch() {
        let mut model = logistic(&["slots"], 0.0, vec![1.0]);
        model.schema_version = 2;
        assert!(matches!(
            model.validate("desktop"),
            Err(ScoreError::ModelUnavailable { .. })
        ));
    }

    #[test]
    fn rejects_coefficient_count_mismatch() {
        let model = logistic(&["slots", "duration"], 0.0, vec![1.0]);
        assert!(model.validate("desktop").is_err());
    }

    #[test]
    fn rejects_out_of_range_tree_node() {
        let json = r#"{
            "schema_version": 1, "name": "bad", "features": ["slots"],
            "model": {"kind": "tree_ensemble", "trees": [
                {"nodes": [{"feature": 0, "threshold": 1.0, "left": 1, "right": 5}, {"value": 1.0}]}
            ]}
        }"#;
        assert!(ModelArtifact::from_json("desktop", json).is_err());
    }

    #[test]
    fn directory_prefers_enhanced_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let plain = logistic(&["slots"], -5.0, vec![0.0]);
        let mut enhanced = logistic(&["slots"], 5.0, vec![0.0]);
        enhanced.name = "enhanced".into();
        std::fs::write(
            dir.path().join("level4_desktop.json"),
            serde_json::to_string(&plain).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("level4_desktop_slot_enhanced.json"),
            serde_json::to_string(&enhanced).unwrap(),
        )
        .unwrap();

        let source = ArtifactDirectory::new(dir.path());
        let model = source.load("desktop").unwrap().unwrap();
        assert!(model.predict_proba(&[vec![0.0]])[0] > 0.99);
        assert!(source.load("mobile").unwrap().is_none());
    }

    #[test]
    fn directory_surfaces_invalid_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("level4_mobile.json"), "{not json").unwrap();
        let source = ArtifactDirectory::new(dir.path());
        assert!(matches!(
            source.load("mobile"),
            Err(ScoreError::ModelUnavailable { .. })
        ));
    }
}
