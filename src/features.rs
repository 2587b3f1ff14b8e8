//! Per-visit feature extraction from raw Metrika log exports.
//!
//! Two indexes are built from the hits table: watch id → timestamp, and
//! visit prefix → first-seen device category. Each visit then resolves the
//! watch ids it references and derives slot and pause statistics from
//! their timestamps. Unresolvable references degrade to zeroed features;
//! only structurally malformed input (missing columns, non-numeric
//! counters) is an error.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoreError};
use crate::metrika::LogTable;

/// Width of one activity slot, in seconds.
pub const SLOT_SECONDS: i64 = 15;

/// A watch id's leading characters identify the visit it belongs to.
pub const VISIT_PREFIX_LEN: usize = 19;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column names a model artifact may reference, in extraction order.
pub const FEATURE_COLUMNS: &[&str] = &[
    "visitDuration",
    "duration",
    "bounce",
    "pageViews",
    "device",
    "slots",
    "slot_range",
    "slot_density",
    "median_pause",
    "mean_pause",
    "std_pause",
];

mod columns {
    pub const VISIT_ID: &str = "ym:s:visitID";
    pub const CLIENT_ID: &str = "ym:s:clientID";
    pub const WATCH_IDS: &str = "ym:s:watchIDs";
    pub const VISIT_DATE_TIME: &str = "ym:s:dateTime";
    pub const VISIT_DURATION: &str = "ym:s:visitDuration";
    pub const BOUNCE: &str = "ym:s:bounce";
    pub const PAGE_VIEWS: &str = "ym:s:pageViews";

    pub const WATCH_ID: &str = "ym:pv:watchID";
    pub const HIT_DATE_TIME: &str = "ym:pv:dateTime";
    pub const HIT_DEVICE: &str = "ym:pv:deviceCategory";
}

/// Metrika device category, as reported on each hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Unknown,
    Desktop,
    Mobile,
    Tablet,
    Tv,
    Other(u32),
}

impl DeviceClass {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => DeviceClass::Unknown,
            1 => DeviceClass::Desktop,
            2 => DeviceClass::Mobile,
            3 => DeviceClass::Tablet,
            4 => DeviceClass::Tv,
            n => DeviceClass::Other(n),
        }
    }

    /// Empty or non-numeric categories are treated as unknown.
    pub fn parse(raw: &str) -> Self {
        raw.trim()
            .parse::<u32>()
            .map(Self::from_code)
            .unwrap_or(DeviceClass::Unknown)
    }

    pub fn code(&self) -> u32 {
        match self {
            DeviceClass::Unknown => 0,
            DeviceClass::Desktop => 1,
            DeviceClass::Mobile => 2,
            DeviceClass::Tablet => 3,
            DeviceClass::Tv => 4,
            DeviceClass::Other(n) => *n,
        }
    }

    /// Stable name used for model artifacts and threshold keys.
    pub fn name(&self) -> String {
        match self {
            DeviceClass::Unknown => "unknown".into(),
            DeviceClass::Desktop => "desktop".into(),
            DeviceClass::Mobile => "mobile".into(),
            DeviceClass::Tablet => "tablet".into(),
            DeviceClass::Tv => "tv".into(),
            DeviceClass::Other(n) => format!("other_{n}"),
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub device: DeviceClass,
    pub duration: i64,
    pub page_views: i64,
    pub bounce: bool,
    /// Distinct 15-second buckets with at least one hit.
    pub active_slot_count: usize,
    pub slot_range: i64,
    pub slot_density: f64,
    pub median_pause: f64,
    pub mean_pause: f64,
    pub std_pause: f64,
}

impl FeatureVector {
    /// Numeric value of a named feature column.
    pub fn column(&self, name: &str) -> Option<f64> {
        let value = match name {
            "visitDuration" | "duration" => self.duration as f64,
            "bounce" => {
                if self.bounce {
                    1.0
                } else {
                    0.0
                }
            }
            "pageViews" => self.page_views as f64,
            "device" => f64::from(self.device.code()),
            "slots" => self.active_slot_count as f64,
            "slot_range" => self.slot_range as f64,
            "slot_density" => self.slot_density,
            "median_pause" => self.median_pause,
            "mean_pause" => self.mean_pause,
            "std_pause" => self.std_pause,
            _ => return None,
        };
        Some(value)
    }
}

/// One visit with its identity fields and derived features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitFeatures {
    pub visit_id: String,
    pub client_id: String,
    pub date_time: String,
    pub features: FeatureVector,
}

/// Builds the feature table for one (counter, date) pair.
pub struct FeatureExtractor {
    watch_time: HashMap<String, NaiveDateTime>,
    device_by_visit: HashMap<String, DeviceClass>,
}

impl FeatureExtractor {
    /// Index the hits table. Hits whose timestamp does not parse are left
    /// out of the time index but still contribute a device class.
    pub fn from_hits(hits: &LogTable) -> Result<Self> {
        let watch_col = require_column(hits, "hits", columns::WATCH_ID)?;
        let time_col = require_column(hits, "hits", columns::HIT_DATE_TIME)?;
        let device_col = require_column(hits, "hits", columns::HIT_DEVICE)?;

        let mut watch_time = HashMap::with_capacity(hits.len());
        let mut device_by_visit = HashMap::new();

        for row in &hits.rows {
            let watch_id = cell(row, watch_col);
            if let Ok(ts) = NaiveDateTime::parse_from_str(cell(row, time_col).trim(), TIMESTAMP_FORMAT)
            {
                watch_time.insert(watch_id.to_string(), ts);
            }
            device_by_visit
                .entry(visit_prefix(watch_id).to_string())
                .or_insert_with(|| DeviceClass::parse(cell(row, device_col)));
        }

        Ok(Self {
            watch_time,
            device_by_visit,
        })
    }

    /// Derive features for every visit, preserving input order.
    pub fn extract(&self, visits: &LogTable) -> Result<Vec<VisitFeatures>> {
        let visit_col = require_column(visits, "visits", columns::VISIT_ID)?;
        let client_col = require_column(visits, "visits", columns::CLIENT_ID)?;
        let watch_col = require_column(visits, "visits", columns::WATCH_IDS)?;
        let time_col = require_column(visits, "visits", columns::VISIT_DATE_TIME)?;
        let duration_col = require_column(visits, "visits", columns::VISIT_DURATION)?;
        let bounce_col = require_column(visits, "visits", columns::BOUNCE)?;
        let views_col = require_column(visits, "visits", columns::PAGE_VIEWS)?;

        visits
            .rows
            .iter()
            .enumerate()
            .map(|(line, row)| {
                let visit_id = cell(row, visit_col).to_string();
                let duration = parse_count(row, duration_col, columns::VISIT_DURATION, line)?;
                let page_views = parse_count(row, views_col, columns::PAGE_VIEWS, line)?;
                let bounce = parse_count(row, bounce_col, columns::BOUNCE, line)? != 0;

                let times: Vec<NaiveDateTime> = watch_ids(cell(row, watch_col))
                    .filter_map(|id| self.watch_time.get(id).copied())
                    .collect();
                let slots = SlotStats::from_times(&times);
                let pauses = PauseStats::from_times(&times);
                let device = self
                    .device_by_visit
                    .get(visit_id.as_str())
                    .copied()
                    .unwrap_or(DeviceClass::Unknown);

                Ok(VisitFeatures {
                    client_id: cell(row, client_col).to_string(),
                    date_time: cell(row, time_col).to_string(),
                    features: FeatureVector {
                        device,
                        duration,
                        page_views,
                        bounce,
                        active_slot_count: slots.active,
                        slot_range: slots.range,
                        slot_density: slots.active as f64 / (duration as f64 / 60.0 + 1.0),
                        median_pause: pauses.median,
                        mean_pause: pauses.mean,
                        std_pause: pauses.std,
                    },
                    visit_id,
                })
            })
            .collect()
    }
}

#[derive(Debug, Default, PartialEq)]
struct SlotStats {
    active: usize,
    range: i64,
}

impl SlotStats {
    fn from_times(times: &[NaiveDateTime]) -> Self {
        let Some(t0) = times.iter().min() else {
            return Self::default();
        };
        let buckets: BTreeSet<i64> = times
            .iter()
            .map(|t| (*t - *t0).num_seconds().div_euclid(SLOT_SECONDS))
            .collect();
        let range = match (buckets.first(), buckets.last()) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0,
        };
        Self {
            active: buckets.len(),
            range,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct PauseStats {
    median: f64,
    mean: f64,
    std: f64,
}

impl PauseStats {
    /// Statistics over gaps between consecutive hits, sorted by time.
    fn from_times(times: &[NaiveDateTime]) -> Self {
        if times.len() < 2 {
            return Self::default();
        }
        let mut sorted = times.to_vec();
        sorted.sort();
        let mut gaps: Vec<f64> = sorted
            .windows(2)
            .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
            .collect();

        let n = gaps.len() as f64;
        let mean = gaps.iter().sum::<f64>() / n;
        let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n;

        gaps.sort_by(f64::total_cmp);
        let mid = gaps.len() / 2;
        let median = if gaps.len() % 2 == 0 {
            (gaps[mid - 1] + gaps[mid]) / 2.0
        } else {
            gaps[mid]
        };

        Self {
            median,
            mean,
            std: variance.sqrt(),
        }
    }
}

/// Watch ids appear as `[123,456]`; every run of digits is one id.
fn watch_ids(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
}

fn visit_prefix(watch_id: &str) -> &str {
    watch_id.get(..VISIT_PREFIX_LEN).unwrap_or(watch_id)
}

fn require_column(table: &LogTable, source: &str, name: &str) -> Result<usize> {
    table.column_index(name).ok_or_else(|| {
        ScoreError::DataIntegrity(format!("{source} export is missing column {name}"))
    })
}

fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(String::as_str).unwrap_or("")
}

fn parse_count(row: &[String], idx: usize, name: &str, line: usize) -> Result<i64> {
    let raw = cell(row, idx).trim();
    match raw.parse::<i64>() {
        Ok(v) if v >= 0 => Ok(v),
        _ => Err(ScoreError::DataIntegrity(format!(
            "visits row {line}: {name} is not a non-negative integer: '{raw}'"
        ))),
    }
}
