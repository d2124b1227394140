// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Tabular projection of the master log.
//!
//! Each column is bound to one field of the entry (or a short list of
//! alternatives for fields renamed between schema revisions). Fields not
//! listed here, such as the mount's raw degrees or HFR, stay master-only.
//! Solve-result columns are filled only for records whose solve succeeded.

use serde_json::Value;

use crate::shot_record::{ShotRecord, SolveStatus};

pub struct Column {
    pub name: &'static str,

    // Candidate locations of the field; the first one present wins.
    paths: &'static [&'static [&'static str]],

    // Rendered empty unless analysis.solve_status is "success".
    success_only: bool,
}

const fn column(name: &'static str, paths: &'static [&'static [&'static str]])
                -> Column {
    Column{name, paths, success_only: false}
}

const fn solve_column(name: &'static str, paths: &'static [&'static [&'static str]])
                      -> Column {
    Column{name, paths, success_only: true}
}

pub const COLUMNS: &[Column] = &[
    column("Session_ID", &[&["session_id"]]),
    column("Objective", &[&["objective"]]),
    column("Telescope", &[&["equipment", "telescope"]]),
    column("Filter", &[&["equipment", "filter"]]),
    column("LocalTime", &[&["record", "meta", "timestamp_local"],
                          &["record", "meta", "timestamp_jst"]]),
    column("UTC_Offset", &[&["record", "meta", "utc_offset"]]),
    column("LST", &[&["record", "meta", "lst"]]),
    column("Frame_Type", &[&["record", "meta", "frame_type"]]),
    column("Filename", &[&["record", "file", "name"]]),
    column("SavedDir", &[&["record", "file", "path"]]),
    column("Format", &[&["record", "file", "format"]]),
    column("ISO_Exif", &[&["record", "exif", "iso"]]),
    column("Exposure_Exif", &[&["record", "exif", "shutter_sec"]]),
    column("DateTime_Exif", &[&["record", "exif", "datetime"]]),
    column("RA_HMS", &[&["record", "mount", "ra_hms"]]),
    column("DEC_DMS", &[&["record", "mount", "dec_dms"]]),
    column("Side", &[&["record", "mount", "side_of_pier"]]),
    column("Site_Name", &[&["record", "location", "site_name"]]),
    column("Lat", &[&["record", "location", "lat"]]),
    column("Lon", &[&["record", "location", "lon"]]),
    column("Elevation_m", &[&["record", "location", "alt"]]),
    column("TZ_Source", &[&["record", "location", "tz_source"]]),
    column("Temp_C", &[&["record", "environment", "temp_c"]]),
    column("Humidity_pct", &[&["record", "environment", "humidity_pct"]]),
    column("Pressure_hPa", &[&["record", "environment", "pressure_hPa"]]),
    column("DewPoint_C", &[&["record", "environment", "dew_point_c"]]),
    column("CPU_Temp_C", &[&["record", "environment", "cpu_temp_c"]]),
    column("Host_CPU_Temp_C", &[&["record", "environment", "host_cpu_temp_c"]]),
    column("Solve_Status", &[&["record", "analysis", "solve_status"]]),
    solve_column("Solve_Path", &[&["record", "analysis", "solve_path"]]),
    column("SSE_Version", &[&["record", "analysis", "sse_version"]]),
    solve_column("Solve_Confidence", &[&["record", "analysis", "confidence"]]),
    solve_column("Solve_RA", &[&["record", "analysis", "solved_coords", "ra_deg"]]),
    solve_column("Solve_DEC", &[&["record", "analysis", "solved_coords", "dec_deg"]]),
    solve_column("Solve_Orientation",
                 &[&["record", "analysis", "solved_coords", "orientation"]]),
    solve_column("Matched_Stars",
                 &[&["record", "analysis", "process_stats", "matched_stars"]]),
    solve_column("Solve_Time_sec",
                 &[&["record", "analysis", "process_stats", "solve_duration_sec"]]),
];

pub fn header() -> String {
    COLUMNS.iter().map(|c| csv_escape(c.name)).collect::<Vec<_>>().join(",")
}

pub fn row(record: &ShotRecord) -> String {
    let solved = record.lookup(&["record", "analysis", "solve_status"])
        .and_then(Value::as_str) == Some(SolveStatus::Success.as_str());
    COLUMNS.iter()
        .map(|c| {
            if c.success_only && !solved {
                return String::new();
            }
            csv_escape(&cell(record, c))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// The whole mirror document for `records`, in log order.
pub fn render(records: &[ShotRecord]) -> String {
    let mut out = header();
    out.push('\n');
    for record in records {
        out.push_str(&row(record));
        out.push('\n');
    }
    out
}

fn cell(record: &ShotRecord, column: &Column) -> String {
    let value = column.paths.iter()
        .filter_map(|path| record.lookup(path))
        .find(|v| !v.is_null());
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n')
        || value.contains('\r')
    {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// mod tests.
