// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use astro::angle::{anglr_sepr, limit_to_two_PI};
use astro::time::{CalType, Date, julian_day, mn_sidr};

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::solver_trait::SkyCoord;

/// Separation between mount pointing and solution at or above which the
/// mount should be re-synced, arcminutes.
pub const DRIFT_SYNC_ARCMIN: f64 = 5.0;

/// Formats right ascension (degrees) as HH:MM:SS.ss. Rounding is carried,
/// so seconds never print as 60.
pub fn deg_to_hms(ra_deg: f64) -> String {
    let ra = ra_deg.rem_euclid(360.0);
    let centis = (ra / 15.0 * 360_000.0).round() as u64 % (24 * 360_000);
    let h = centis / 360_000;
    let m = (centis / 6000) % 60;
    let s = centis % 6000;
    format!("{:02}:{:02}:{:02}.{:02}", h, m, s / 100, s % 100)
}

/// Formats declination (degrees) as +DD:MM:SS.ss.
pub fn deg_to_dms(dec_deg: f64) -> String {
    let sign = if dec_deg < 0.0 { '-' } else { '+' };
    let centis = (dec_deg.abs() * 360_000.0).round() as u64;
    let d = centis / 360_000;
    let m = (centis / 6000) % 60;
    let s = centis % 6000;
    format!("{}{:02}:{:02}:{:02}.{:02}", sign, d, m, s / 100, s % 100)
}

/// Formats hours (e.g. sidereal time) as HH:MM:SS.
pub fn hours_to_hms(hours: f64) -> String {
    let secs = (hours.rem_euclid(24.0) * 3600.0).round() as u64 % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Local mean sidereal time, hours in [0, 24).
/// `longitude_deg`: east positive.
pub fn local_sidereal_time(time: &DateTime<Utc>, longitude_deg: f64) -> f64 {
    let lst = limit_to_two_PI(
        greenwich_mean_sidereal_time(time) + longitude_deg.to_radians());
    lst.to_degrees() / 15.0
}

// Radians.
fn greenwich_mean_sidereal_time(time: &DateTime<Utc>) -> f64 {
    let date = Date{year: time.date_naive().year() as i16,
                    month: time.date_naive().month() as u8,
                    decimal_day: time.date_naive().day() as f64,
                    cal_type: CalType::Gregorian};
    let jd = julian_day(&date);

    let utc_hours = time.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours = mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;
    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

/// How far the solved field center is from where the mount said it was.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MountDrift {
    // Solved minus hint, degrees. RA difference wrapped to [-180, 180).
    pub d_ra_deg: f64,
    pub d_dec_deg: f64,

    // Great circle distance.
    pub separation_arcmin: f64,
}

impl MountDrift {
    pub fn needs_sync(&self) -> bool {
        self.separation_arcmin >= DRIFT_SYNC_ARCMIN
    }
}

pub fn mount_drift(hint: SkyCoord, solved: SkyCoord) -> MountDrift {
    let d_ra_deg = (solved.ra - hint.ra + 180.0).rem_euclid(360.0) - 180.0;
    let separation = anglr_sepr(hint.ra.to_radians(), hint.dec.to_radians(),
                                solved.ra.to_radians(), solved.dec.to_radians());
    MountDrift{
        d_ra_deg,
        d_dec_deg: solved.dec - hint.dec,
        separation_arcmin: separation.to_degrees() * 60.0,
    }
}

/// Coarse rating of a solve by number of matched stars.
pub fn star_rating(matched_stars: u32) -> &'static str {
    match matched_stars {
        50..=u32::MAX => "★★★★★",
        30..=49 => "★★★★☆",
        15..=29 => "★★★☆☆",
        10..=14 => "★★☆☆☆",
        _ => "★☆☆☆☆",
    }
}

// mod tests.
