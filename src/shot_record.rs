// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! One exposure's entry in the session log.
//!
//! The entry is kept as an order-preserving JSON object so that fields this
//! crate does not know about (older or newer schema revisions, collaborator
//! extensions) survive a load/commit/save round trip verbatim. Only the
//! `analysis` section is interpreted through typed structures, and it is
//! written back field by field.

use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, invalid_argument_error};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::astro_util::{deg_to_dms, deg_to_hms};
use crate::solver_trait::{SkyCoord, SolveResult};

/// Schema tag written into newly created entries. Evolution is additive only.
pub const SCHEMA_VERSION: &str = "1.4.2";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolveStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

impl SolveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolveStatus::Pending => "pending",
            SolveStatus::Success => "success",
            SolveStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolvedCoords {
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub orientation: Option<f64>,
    pub ra_hms: String,
    pub dec_dms: String,
}

impl SolvedCoords {
    pub fn new(center: SkyCoord, orientation: Option<f64>) -> Self {
        SolvedCoords{
            ra_deg: center.ra,
            dec_deg: center.dec,
            orientation,
            ra_hms: deg_to_hms(center.ra),
            dec_dms: deg_to_dms(center.dec),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessStats {
    pub matched_stars: Option<u32>,
    pub solve_duration_sec: f64,
}

// Image quality measures. Produced by other tools; never written here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quality {
    pub hfr: Option<f64>,
    pub elongation: Option<f64>,
    pub stars: Option<u32>,
    pub satellite_detected: Option<bool>,
    pub sky_brightness: Option<f64>,
}

/// One solver invocation, kept for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolveAttempt {
    pub pass: u8,
    pub label: String,
    pub outcome: String,
    pub confidence: Option<f64>,
    pub duration_sec: f64,
    pub timestamp: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Analysis {
    pub solve_status: SolveStatus,

    // Label of the tier that produced the accepted solution.
    pub solve_path: Option<String>,

    // Version of the engine that wrote this analysis.
    pub sse_version: Option<String>,
    pub timestamp: Option<String>,

    // Log-odds of the accepted solution, or of the best rejected attempt.
    pub confidence: Option<f64>,

    // Present if and only if solve_status is Success.
    pub solved_coords: Option<SolvedCoords>,

    pub process_stats: Option<ProcessStats>,
    pub quality: Option<Quality>,

    // Highest tier attempted so far; the record's position on the ladder.
    pub last_pass: Option<u8>,

    pub attempts: Vec<SolveAttempt>,
}

impl Analysis {
    /// Overwrites the result fields with an accepted solution. `quality` and
    /// the attempt history are kept.
    pub fn mark_solved(&mut self, tier: u8, label: String, result: &SolveResult,
                       engine_version: &str, timestamp: String) {
        self.solve_status = SolveStatus::Success;
        self.solve_path = Some(label);
        self.sse_version = Some(engine_version.to_string());
        self.timestamp = Some(timestamp);
        self.confidence = Some(result.confidence);
        self.solved_coords = Some(SolvedCoords::new(result.center, result.orientation));
        self.process_stats = Some(ProcessStats{
            matched_stars: result.matched_stars,
            solve_duration_sec: round_centis(result.duration.as_secs_f64()),
        });
        self.last_pass = Some(self.last_pass.map_or(tier, |t| t.max(tier)));
    }

    /// Records a terminal failure. `best` is the highest-confidence rejected
    /// match, if any; its statistics are kept for diagnosis but no
    /// coordinates are recorded.
    pub fn mark_failed(&mut self, last_tier: Option<u8>, best: Option<&SolveResult>,
                       engine_version: &str, timestamp: String) {
        self.solve_status = SolveStatus::Failed;
        self.solve_path = None;
        self.sse_version = Some(engine_version.to_string());
        self.timestamp = Some(timestamp);
        self.solved_coords = None;
        self.confidence = best.map(|b| b.confidence);
        self.process_stats = best.map(|b| ProcessStats{
            matched_stars: b.matched_stars,
            solve_duration_sec: round_centis(b.duration.as_secs_f64()),
        });
        if let Some(tier) = last_tier {
            self.last_pass = Some(self.last_pass.map_or(tier, |t| t.max(tier)));
        }
    }
}

fn round_centis(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Clone, Debug, PartialEq)]
pub struct ShotRecord {
    // Cached from record.file.name; the store's natural key.
    file_name: String,
    entry: Map<String, Value>,
}

impl Serialize for ShotRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entry.serialize(serializer)
    }
}

impl ShotRecord {
    pub fn from_value(value: Value) -> Result<Self, CanonicalError> {
        let entry = match value {
            Value::Object(entry) => entry,
            other => {
                return Err(invalid_argument_error(
                    format!("log entry is not an object: {}", type_name(&other)).as_str()));
            }
        };
        let file_name = match lookup(&entry, &["record", "file", "name"]) {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => {
                return Err(invalid_argument_error(
                    "log entry has no record.file.name"));
            }
        };
        Ok(ShotRecord{file_name, entry})
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn entry(&self) -> &Map<String, Value> {
        &self.entry
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.entry)
    }

    /// Follows `path` through nested objects.
    pub fn lookup(&self, path: &[&str]) -> Option<&Value> {
        lookup(&self.entry, path)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.lookup(&["session_id"]).and_then(Value::as_str)
    }

    /// Mount pointing at exposure time, if the telemetry collaborator had it.
    pub fn hint(&self) -> Option<SkyCoord> {
        let ra = self.lookup(&["record", "mount", "ra_deg"]).and_then(Value::as_f64)?;
        let dec = self.lookup(&["record", "mount", "dec_deg"]).and_then(Value::as_f64)?;
        if !ra.is_finite() || !dec.is_finite() || dec.abs() > 90.0 {
            return None;
        }
        Some(SkyCoord{ra, dec})
    }

    /// Typed view of the analysis section. An absent or null section reads
    /// as a fresh `pending` analysis.
    pub fn analysis(&self) -> Result<Analysis, CanonicalError> {
        match self.lookup(&["record", "analysis"]) {
            None | Some(Value::Null) => Ok(Analysis::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                invalid_argument_error(
                    format!("{}: malformed analysis section: {}",
                            self.file_name, e).as_str())
            }),
        }
    }

    /// Writes `analysis` into the entry, one known field at a time. Fields the
    /// entry already has keep their position; unknown fields are left alone.
    /// A field that is None is nulled if present and otherwise not added.
    /// `quality` is never touched.
    pub fn apply_analysis(&mut self, analysis: &Analysis) {
        let record = object_slot(&mut self.entry, "record");
        let target = object_slot(record, "analysis");

        put(target, "solve_status", to_json(&analysis.solve_status));
        put(target, "solve_path", analysis.solve_path.as_ref().and_then(to_json));
        put(target, "sse_version", analysis.sse_version.as_ref().and_then(to_json));
        put(target, "timestamp", analysis.timestamp.as_ref().and_then(to_json));
        put(target, "confidence", analysis.confidence.as_ref().and_then(to_json));
        put(target, "solved_coords", analysis.solved_coords.as_ref().and_then(to_json));
        put(target, "process_stats", analysis.process_stats.as_ref().and_then(to_json));
        put(target, "last_pass", analysis.last_pass.as_ref().and_then(to_json));
        if analysis.attempts.is_empty() {
            put(target, "attempts", None);
        } else {
            put(target, "attempts", to_json(&analysis.attempts));
        }
    }

    /// Where the image for this record lives: next to the log if present
    /// there, else in the directory recorded at capture time.
    pub fn image_path(&self, session_dir: &Path) -> PathBuf {
        let local = session_dir.join(&self.file_name);
        if local.exists() {
            return local;
        }
        if let Some(dir) = self.lookup(&["record", "file", "path"]).and_then(Value::as_str) {
            let saved = Path::new(dir).join(&self.file_name);
            if saved.exists() {
                return saved;
            }
        }
        local
    }
}

fn lookup<'a>(entry: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut value = entry.get(*first)?;
    for key in rest {
        value = value.as_object()?.get(*key)?;
    }
    Some(value)
}

// Returns the object stored under `key`, replacing a missing or non-object
// value with an empty object.
fn object_slot<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = map.entry(key.to_string()).or_insert(Value::Null);
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(object) => object,
        _ => unreachable!(),
    }
}

fn put(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    match value {
        Some(v) => { map.insert(key.to_string(), v); },
        None => {
            if let Some(slot) = map.get_mut(key) {
                *slot = Value::Null;
            }
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// mod tests.
