// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Building the log entry for a freshly captured exposure.
//!
//! The shutter controller, the telemetry poller and the exif reader each
//! hand over their data in their own shape; this module assembles them into
//! a schema 1.4.2 entry whose analysis is `pending`. The result is committed
//! with `SessionStore::append`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use canonical_error::CanonicalError;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde_json::{Map, Value, json};

use crate::astro_util::{deg_to_dms, deg_to_hms, hours_to_hms, local_sidereal_time};
use crate::shot_record::{SCHEMA_VERSION, ShotRecord};

/// Session-wide settings, fixed when the session starts.
#[derive(Clone, Debug)]
pub struct CaptureContext {
    pub session_id: String,
    pub objective: String,
    // "Light", "Dark", "Flat", ...
    pub frame_type: String,
    // Where the camera's files are downloaded to.
    pub save_dir: PathBuf,
    // Optics and camera description; copied verbatim into every entry.
    pub equipment: Map<String, Value>,
    pub site_name: Option<String>,
    // How the local UTC offset was determined, e.g. "system" or "gps".
    pub tz_source: String,
}

/// A completed exposure, as reported by the shutter controller.
#[derive(Clone, Debug)]
pub struct ExposureEvent {
    pub file_name: String,
    pub format: String,
    pub size_mb: f64,
    pub shot_mode: String,
    // Shutter open time, in the observer's local offset.
    pub start: DateTime<FixedOffset>,
    // Measured shutter-open duration.
    pub elapsed: Duration,
}

/// Telemetry snapshot taken at shutter time, keyed the way the INDI poller
/// names its readings:
///   ra (hours), dec, ra_deg, dec_deg, status, side_of_pier,
///   lat, lon, alt,
///   weather_temp, weather_hum, weather_pres, weather_dew, cpu_temp,
///   host_cpu_temp.
/// Missing or unparseable readings become null.
pub type Telemetry = HashMap<String, String>;

/// Builds a pending entry. `exif` holds whatever the exif reader extracted
/// (iso, shutter_sec, model, lat, lon, alt, datetime, width, height).
pub fn build_record(context: &CaptureContext,
                    event: &ExposureEvent,
                    telemetry: &Telemetry,
                    exif: &Map<String, Value>)
                    -> Result<ShotRecord, CanonicalError> {
    let utc: DateTime<Utc> = event.start.with_timezone(&Utc);
    let exposure_actual_sec = round_to(event.elapsed.as_secs_f64(), 1000.0);

    let number = |key: &str| telemetry.get(key).and_then(|v| v.trim().parse::<f64>().ok());
    let text = |key: &str| telemetry.get(key).filter(|v| !v.is_empty()).cloned();

    let ra_deg = number("ra_deg").or_else(|| number("ra").map(|hours| hours * 15.0));
    let dec_deg = number("dec_deg").or_else(|| number("dec"));
    let lon = number("lon");
    let lst = lon.map(|lon| hours_to_hms(local_sidereal_time(&utc, lon)));

    let camera = context.equipment.get("camera").cloned().unwrap_or(Value::Null);
    let exif_field = |key: &str| exif.get(key).cloned().unwrap_or(Value::Null);
    let shutter_sec = match exif.get("shutter_sec") {
        Some(v) if !v.is_null() => v.clone(),
        _ => json!(exposure_actual_sec),
    };
    let model = match exif.get("model") {
        Some(Value::String(m)) if !m.is_empty() => json!(m),
        _ => camera,
    };

    let entry = json!({
        "version": SCHEMA_VERSION,
        "session_id": context.session_id,
        "objective": context.objective,
        "equipment": context.equipment,
        "record": {
            "meta": {
                "timestamp_local": event.start.to_rfc3339_opts(SecondsFormat::Millis, false),
                "timestamp_utc": utc.to_rfc3339_opts(SecondsFormat::Millis, true),
                "unixtime": utc.timestamp_millis() as f64 / 1000.0,
                "utc_offset": event.start.format("%:z").to_string(),
                "lst": lst,
                "exposure_actual_sec": exposure_actual_sec,
                "shot_mode": event.shot_mode,
                "frame_type": context.frame_type,
            },
            "file": {
                "name": event.file_name,
                "path": context.save_dir.to_string_lossy(),
                "format": event.format,
                "size_mb": round_to(event.size_mb, 100.0),
                "width": exif_field("width"),
                "height": exif_field("height"),
            },
            "exif": {
                "iso": exif_field("iso"),
                "shutter_sec": shutter_sec,
                "model": model,
                "lat": exif_field("lat"),
                "lon": exif_field("lon"),
                "alt": exif_field("alt"),
                "datetime": exif_field("datetime"),
            },
            "mount": {
                "ra_deg": ra_deg,
                "dec_deg": dec_deg,
                "ra_hms": ra_deg.map(deg_to_hms),
                "dec_dms": dec_deg.map(deg_to_dms),
                "status": text("status").unwrap_or_else(|| "Unknown".to_string()),
                "side_of_pier": text("side_of_pier").unwrap_or_else(|| "Unknown".to_string()),
            },
            "location": {
                "site_name": context.site_name,
                "lat": number("lat"),
                "lon": lon,
                "alt": number("alt"),
                "tz_source": context.tz_source,
            },
            "environment": {
                "temp_c": number("weather_temp"),
                "humidity_pct": number("weather_hum"),
                "pressure_hPa": number("weather_pres"),
                "dew_point_c": number("weather_dew"),
                "cpu_temp_c": number("cpu_temp"),
                "host_cpu_temp_c": number("host_cpu_temp"),
            },
            "analysis": {
                "solve_status": "pending",
                "solved_coords": null,
                "quality": {
                    "hfr": null,
                    "stars": null,
                    "elongation": null,
                    "satellite_detected": false,
                    "sky_brightness": null,
                },
            },
        },
    });
    ShotRecord::from_value(entry)
}

fn round_to(x: f64, scale: f64) -> f64 {
    (x * scale).round() / scale
}

// mod tests.
