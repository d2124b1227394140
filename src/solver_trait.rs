// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;
use std::time::Duration;

use canonical_error::CanonicalError;

use crate::pass_scheduler::PassSpec;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SkyCoord {
    // Degrees.
    pub ra: f64,
    pub dec: f64,
}

/// Approximate pointing used to bound the solver's search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveHint {
    pub coord: SkyCoord,
    pub radius_deg: f64,
}

#[derive(Clone, Debug, Default)]
pub struct SolveResult {
    // Field center.
    pub center: SkyCoord,

    // Degrees east of north ("up is X degrees"). None if the solver did not
    // report it.
    pub orientation: Option<f64>,

    // Log-odds of the accepted match. Higher is more reliable.
    pub confidence: f64,

    // Number of sources used for the match, if reported.
    pub matched_stars: Option<u32>,

    // Wall clock time of the solve, including process startup.
    pub duration: Duration,

    // Abbreviated hit/miss string from the verifier, diagnostic only.
    pub hit_miss: String,
}

// Solves `image` using the parameters of one pass tier. `hint` is None for
// blind tiers.
// If SolveResult is not returned, an error is returned:
//   NotFound: the solver ran to completion without finding a match.
//   DeadlineExceeded: `pass.time_budget` was reached; the solver was killed.
//   FailedPrecondition: the solver could not be started (e.g. binary missing).
//   InvalidArgument: the image is missing or unreadable.
//   Internal: the solver exited abnormally or its report was malformed.
// Implementations must not retry internally; escalation is the caller's job.
pub trait PlateSolver {
    // Note: this is a blocking call, and can take up to `pass.time_budget`.
    fn solve(&self,
             image: &Path,
             hint: Option<&SolveHint>,
             pass: &PassSpec)
             -> Result<SolveResult, CanonicalError>;

    // Identifies the solving engine, for logs.
    fn name(&self) -> String;
}
