//! Hybrid rule + model tier-4+ classification.
//!
//! Every visit is first checked against the deterministic engagement rule.
//! Visits that fail the rule are grouped by device class and scored by that
//! class's calibrated model; a visit is tier-4+ when its probability is
//! strictly greater than the class threshold.

mod model;

pub use model::{
    ArtifactDirectory, ModelArtifact, ModelBody, ModelSource, PlattCalibration, ProbabilityModel,
    StaticModels, Tree, TreeNode, SUPPORTED_SCHEMA_VERSION,
};

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, ScoreError};
use crate::features::{DeviceClass, FeatureVector, VisitFeatures};

pub const RULE_MIN_DURATION_SECS: i64 = 180;
pub const RULE_MIN_PAGE_VIEWS: i64 = 5;
pub const RULE_MIN_ACTIVE_SLOTS: usize = 5;

pub const THRESHOLDS_FILE: &str = "level4_thresholds.json";

/// Device classes that have a trained model. Rule-negative visits of any
/// other class are never tier-4+.
pub const MODEL_DEVICE_CLASSES: [DeviceClass; 2] = [DeviceClass::Desktop, DeviceClass::Mobile];

/// `duration >= 180s AND pageViews >= 5 AND activeSlots >= 5`.
pub fn rule_matches(f: &FeatureVector) -> bool {
    f.duration >= RULE_MIN_DURATION_SECS
        && f.page_views >= RULE_MIN_PAGE_VIEWS
        && f.active_slot_count >= RULE_MIN_ACTIVE_SLOTS
}

/// Probability thresholds keyed by device-class name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds(HashMap<String, f64>);

impl Default for Thresholds {
    fn default() -> Self {
        Self(HashMap::from([
            ("desktop".to_string(), 0.48),
            ("mobile".to_string(), 0.36),
        ]))
    }
}

impl Thresholds {
    pub fn get(&self, device: &str) -> Option<f64> {
        self.0.get(device).copied()
    }

    /// Entries in `other` replace existing ones.
    pub fn overlay(mut self, other: &HashMap<String, f64>) -> Self {
        self.0
            .extend(other.iter().map(|(k, v)| (k.clone(), *v)));
        self
    }

    /// Defaults overlaid with `level4_thresholds.json` from the model directory, if present.
    pub fn from_model_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(THRESHOLDS_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let file: HashMap<String, f64> = serde_json::from_str(&text).map_err(|e| {
            ScoreError::Configuration(format!("invalid {}: {e}", path.display()))
        })?;
        Ok(Self::default().overlay(&file))
    }
}

/// How a visit's label was decided.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    Rule,
    Model { probability: f64, threshold: f64 },
    /// Failed the rule and its device class has no model.
    NoModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub tier4_plus: bool,
    pub decision: Decision,
}

pub struct TierClassifier {
    models: Arc<dyn ModelSource>,
    thresholds: Thresholds,
}

impl TierClassifier {
    pub fn new(models: Arc<dyn ModelSource>, thresholds: Thresholds) -> Self {
        Self { models, thresholds }
    }

    /// One classification per visit, in input order.
    ///
    /// Only desktop and mobile visits are scored by a model. Fails with
    /// `ModelUnavailable` before scoring anything if one of those classes is
    /// present among rule-negative visits without a model or a threshold.
    pub fn classify(&self, visits: &[VisitFeatures]) -> Result<Vec<Classification>> {
        let rule_hits: Vec<bool> = visits.iter().map(|v| rule_matches(&v.features)).collect();

        let mut groups: BTreeMap<DeviceClass, Vec<usize>> = BTreeMap::new();
        for (idx, visit) in visits.iter().enumerate() {
            let device = visit.features.device;
            if !rule_hits[idx] && MODEL_DEVICE_CLASSES.contains(&device) {
                groups.entry(device).or_default().push(idx);
            }
        }

        let mut routed = Vec::with_capacity(groups.len());
        for (device, indices) in groups {
            let name = device.name();
            let model = self.models.load(&name)?.ok_or_else(|| {
                ScoreError::model_unavailable(&name, "no model artifact for this device class")
            })?;
            let threshold = self.thresholds.get(&name).ok_or_else(|| {
                ScoreError::model_unavailable(&name, "no probability threshold configured")
            })?;
            routed.push((name, model, threshold, indices));
        }

        let mut model_results: Vec<Option<Classification>> = vec![None; visits.len()];
        for (name, model, threshold, indices) in routed {
            let features = model.feature_names();
            let rows: Vec<Vec<f64>> = indices
                .iter()
                .map(|&i| {
                    features
                        .iter()
                        .map(|f| visits[i].features.column(f).unwrap_or(0.0))
                        .collect()
                })
                .collect();
            let probabilities = model.predict_proba(&rows);
            if probabilities.len() != indices.len() {
                return Err(ScoreError::model_unavailable(
                    &name,
                    format!(
                        "model returned {} probabilities for {} visits",
                        probabilities.len(),
                        indices.len()
                    ),
                ));
            }

            let mut positives = 0usize;
            for (&i, &probability) in indices.iter().zip(&probabilities) {
                let tier4_plus = probability > threshold;
                positives += usize::from(tier4_plus);
                model_results[i] = Some(Classification {
                    tier4_plus,
                    decision: Decision::Model {
                        probability,
                        threshold,
                    },
                });
            }
            debug!(device = %name, visits = indices.len(), positives, threshold, "applied model");
        }

        let out = rule_hits
            .iter()
            .zip(model_results)
            .enumerate()
            .map(|(idx, (&rule, scored))| {
                let device = visits[idx].features.device;
                if rule {
                    Ok(Classification {
                        tier4_plus: true,
                        decision: Decision::Rule,
                    })
                } else if !MODEL_DEVICE_CLASSES.contains(&device) {
                    Ok(Classification {
                        tier4_plus: false,
                        decision: Decision::NoModel,
                    })
                } else {
                    scored.ok_or_else(|| {
                        ScoreError::DataIntegrity(format!("visit {idx} was not routed to a model"))
                    })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            visits = visits.len(),
            rule_positive = rule_hits.iter().filter(|r| **r).count(),
            tier4_plus = out.iter().filter(|c| c.tier4_plus).count(),
            "classified visits"
        );
        Ok(out)
    }
}
