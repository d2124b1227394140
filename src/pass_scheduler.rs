// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Escalation ladder for plate solving.
//!
//! A record is solved by trying an ordered list of pass tiers. Hinted tiers
//! search around the mount's reported pointing with progressively wider
//! radius and scale tolerance; blind tiers search the whole sky with
//! progressively coarser downsampling. [`PassScheduler::next_pass`] is a pure
//! function of the record's escalation state and the caller's flags, so every
//! transition can be tested in isolation.

use std::time::Duration;

use canonical_error::{CanonicalError, CanonicalErrorCode, invalid_argument_error};
use serde::{Deserialize, Serialize};

use crate::shot_record::{Analysis, SolveStatus};
use crate::solver_trait::{SkyCoord, SolveHint, SolveResult};

/// Default acceptance threshold, ln(1e9). This is the log-odds at which
/// astrometry.net itself considers a match verified.
pub const DEFAULT_ACCEPTANCE_LOG_ODDS: f64 = 20.7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    // Requires hint coordinates; searches within `search_radius_deg`.
    Hinted,
    // Requires the blind-search flag; no positional constraint.
    Blind,
}

/// One rung of the ladder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassSpec {
    // 1-based position in the ladder. Assigned by PassScheduler::new().
    #[serde(skip)]
    pub tier: u8,

    pub kind: PassKind,

    // Degrees around the hint. Required for Hinted passes, ignored for Blind.
    #[serde(default)]
    pub search_radius_deg: Option<f64>,

    // Pixel scale bounds, in the solver's configured scale units.
    pub scale_low: f64,
    pub scale_high: f64,

    pub downsample: u32,

    // Source detection threshold; lower finds fainter stars.
    pub sigma: f64,

    // Maximum number of sources the solver considers.
    pub max_objects: u32,

    pub time_budget_secs: f64,
}

impl PassSpec {
    pub fn label(&self) -> String {
        format!("Pass {}", self.tier)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs_f64(self.time_budget_secs)
    }

    /// Hint to hand to the solver for this pass, if the pass uses one.
    pub fn hint_for(&self, coord: Option<SkyCoord>) -> Option<SolveHint> {
        match (self.kind, coord, self.search_radius_deg) {
            (PassKind::Hinted, Some(coord), Some(radius_deg)) =>
                Some(SolveHint{coord, radius_deg}),
            _ => None,
        }
    }

    fn hinted(radius: f64, scale: (f64, f64), downsample: u32, sigma: f64,
              max_objects: u32, time_budget_secs: f64) -> Self {
        PassSpec{
            tier: 0,
            kind: PassKind::Hinted,
            search_radius_deg: Some(radius),
            scale_low: scale.0,
            scale_high: scale.1,
            downsample, sigma, max_objects, time_budget_secs,
        }
    }

    fn blind(downsample: u32, sigma: f64, time_budget_secs: f64) -> Self {
        PassSpec{
            tier: 0,
            kind: PassKind::Blind,
            search_radius_deg: None,
            scale_low: 1.0,
            scale_high: 15.0,
            downsample, sigma,
            max_objects: 100,
            time_budget_secs,
        }
    }
}

/// The six-tier ladder used when the configuration does not supply one.
pub fn default_ladder() -> Vec<PassSpec> {
    vec![
        PassSpec::hinted(5.0, (1.0, 15.0), 1, 30.0, 100, 25.0),
        PassSpec::hinted(15.0, (1.0, 15.0), 2, 15.0, 100, 25.0),
        PassSpec::hinted(30.0, (0.5, 30.0), 2, 10.0, 150, 25.0),
        PassSpec::blind(2, 30.0, 45.0),
        PassSpec::blind(4, 15.0, 45.0),
        PassSpec::blind(8, 10.0, 45.0),
    ]
}

/// Checks a ladder for values that cannot be handed to a solver.
pub fn validate_ladder(ladder: &[PassSpec]) -> Result<(), CanonicalError> {
    if ladder.is_empty() {
        return Err(invalid_argument_error("pass ladder must not be empty"));
    }
    if ladder.len() > u8::MAX as usize {
        return Err(invalid_argument_error(
            format!("pass ladder has {} tiers; at most {} allowed",
                    ladder.len(), u8::MAX).as_str()));
    }
    for (i, pass) in ladder.iter().enumerate() {
        let tier = i + 1;
        if pass.kind == PassKind::Hinted {
            match pass.search_radius_deg {
                Some(r) if r > 0.0 && r.is_finite() => {},
                _ => {
                    return Err(invalid_argument_error(
                        format!("Pass {} is hinted but has no positive search radius",
                                tier).as_str()));
                }
            }
        }
        if pass.downsample < 1 {
            return Err(invalid_argument_error(
                format!("Pass {} downsample must be at least 1; got {}",
                        tier, pass.downsample).as_str()));
        }
        if !(pass.time_budget_secs > 0.0) || !pass.time_budget_secs.is_finite() {
            return Err(invalid_argument_error(
                format!("Pass {} time budget must be positive; got {}",
                        tier, pass.time_budget_secs).as_str()));
        }
        if !(pass.scale_low > 0.0) || pass.scale_low > pass.scale_high {
            return Err(invalid_argument_error(
                format!("Pass {} scale range [{}, {}] is invalid",
                        tier, pass.scale_low, pass.scale_high).as_str()));
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SolveFlags {
    // Re-evaluate from Pass 1 regardless of the record's prior status.
    pub force: bool,
    // Allow Blind tiers.
    pub blind_search: bool,
}

/// Where a record stands on the ladder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscalationState {
    // Durable state, as loaded from the record.
    pub prior_status: SolveStatus,
    pub prior_last_pass: Option<u8>,
    pub hint_available: bool,

    // Highest tier attempted during the current invocation.
    pub run_last_pass: Option<u8>,
}

impl EscalationState {
    pub fn from_analysis(analysis: &Analysis, hint_available: bool) -> Self {
        EscalationState{
            prior_status: analysis.solve_status,
            prior_last_pass: analysis.last_pass,
            hint_available,
            run_last_pass: None,
        }
    }

    pub fn record_attempt(&mut self, tier: u8) {
        self.run_last_pass = Some(self.run_last_pass.map_or(tier, |t| t.max(tier)));
    }
}

#[derive(Debug, PartialEq)]
pub enum NextPass<'a> {
    Attempt(&'a PassSpec),
    Exhausted,
}

/// Classification of a single solver attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    // The solver matched, but with confidence below the acceptance threshold.
    BelowThreshold,
    NoMatch,
    Timeout,
    SolverError,
}

impl AttemptOutcome {
    pub fn from_error(error: &CanonicalError) -> Self {
        match error.code {
            CanonicalErrorCode::NotFound => AttemptOutcome::NoMatch,
            CanonicalErrorCode::DeadlineExceeded => AttemptOutcome::Timeout,
            _ => AttemptOutcome::SolverError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::BelowThreshold => "below_threshold",
            AttemptOutcome::NoMatch => "no_match",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::SolverError => "solver_error",
        }
    }
}

pub struct PassScheduler {
    ladder: Vec<PassSpec>,
    acceptance_log_odds: f64,
}

impl PassScheduler {
    pub fn new(mut ladder: Vec<PassSpec>, acceptance_log_odds: f64)
               -> Result<Self, CanonicalError> {
        validate_ladder(&ladder)?;
        if !acceptance_log_odds.is_finite() {
            return Err(invalid_argument_error(
                format!("acceptance_log_odds must be finite; got {}",
                        acceptance_log_odds).as_str()));
        }
        for (i, pass) in ladder.iter_mut().enumerate() {
            pass.tier = (i + 1) as u8;
        }
        Ok(PassScheduler{ladder, acceptance_log_odds})
    }

    pub fn ladder(&self) -> &[PassSpec] {
        &self.ladder
    }

    pub fn acceptance_log_odds(&self) -> f64 {
        self.acceptance_log_odds
    }

    /// Returns the next tier to attempt, or Exhausted.
    ///
    /// Within an invocation, escalation continues strictly upward from the
    /// last tier tried. At the start of an invocation:
    /// * `success` records are Exhausted unless `flags.force`;
    /// * `failed` records resume above their durable `last_pass`, so they are
    ///   retried only when a higher tier has become applicable;
    /// * `flags.force` restarts from the bottom of the ladder.
    /// Hinted tiers need a hint; Blind tiers need `flags.blind_search`.
    pub fn next_pass(&self, state: &EscalationState, flags: &SolveFlags)
                     -> NextPass<'_> {
        let floor = match state.run_last_pass {
            Some(tier) => Some(tier),
            None if flags.force => None,
            None => match state.prior_status {
                SolveStatus::Success => return NextPass::Exhausted,
                SolveStatus::Failed | SolveStatus::Pending => state.prior_last_pass,
            },
        };
        self.ladder.iter()
            .filter(|pass| floor.map_or(true, |f| pass.tier > f))
            .find(|pass| Self::applicable(pass, state, flags))
            .map_or(NextPass::Exhausted, NextPass::Attempt)
    }

    /// A match is accepted only at or above the configured log-odds.
    pub fn classify(&self, result: &SolveResult) -> AttemptOutcome {
        if result.confidence >= self.acceptance_log_odds {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::BelowThreshold
        }
    }

    fn applicable(pass: &PassSpec, state: &EscalationState, flags: &SolveFlags)
                  -> bool {
        match pass.kind {
            PassKind::Hinted => state.hint_available,
            PassKind::Blind => flags.blind_search,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> PassScheduler {
        PassScheduler::new(default_ladder(), DEFAULT_ACCEPTANCE_LOG_ODDS).unwrap()
    }

    fn state(prior_status: SolveStatus, prior_last_pass: Option<u8>,
             hint_available: bool) -> EscalationState {
        EscalationState{prior_status, prior_last_pass, hint_available,
                        run_last_pass: None}
    }

    // Runs the scheduler to exhaustion as though every attempt failed.
    fn walk(scheduler: &PassScheduler, mut state: EscalationState,
            flags: &SolveFlags) -> Vec<u8> {
        let mut tiers = Vec::new();
        while let NextPass::Attempt(pass) = scheduler.next_pass(&state, flags) {
            tiers.push(pass.tier);
            state.record_attempt(pass.tier);
        }
        tiers
    }

    #[test]
    fn test_tiers_are_numbered_in_order() {
        let s = scheduler();
        let tiers: Vec<u8> = s.ladder().iter().map(|p| p.tier).collect();
        assert_eq!(tiers, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(s.ladder()[0].label(), "Pass 1");
    }

    #[test]
    fn test_hint_without_blind_search() {
        let s = scheduler();
        let flags = SolveFlags::default();
        assert_eq!(walk(&s, state(SolveStatus::Pending, None, true), &flags),
                   vec![1, 2, 3]);
    }

    #[test]
    fn test_no_hint_with_blind_search() {
        let s = scheduler();
        let flags = SolveFlags{blind_search: true, ..Default::default()};
        assert_eq!(walk(&s, state(SolveStatus::Pending, None, false), &flags),
                   vec![4, 5, 6]);
    }

    #[test]
    fn test_hint_with_blind_search() {
        let s = scheduler();
        let flags = SolveFlags{blind_search: true, ..Default::default()};
        assert_eq!(walk(&s, state(SolveStatus::Pending, None, true), &flags),
                   vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_no_hint_no_blind_search() {
        let s = scheduler();
        assert_eq!(s.next_pass(&state(SolveStatus::Pending, None, false),
                               &SolveFlags::default()),
                   NextPass::Exhausted);
    }

    #[test]
    fn test_success_is_exhausted_without_force() {
        let s = scheduler();
        let flags = SolveFlags{blind_search: true, ..Default::default()};
        assert_eq!(s.next_pass(&state(SolveStatus::Success, Some(1), true), &flags),
                   NextPass::Exhausted);
    }

    #[test]
    fn test_force_restarts_at_first_tier() {
        let s = scheduler();
        let flags = SolveFlags{force: true, ..Default::default()};
        assert_eq!(walk(&s, state(SolveStatus::Success, Some(2), true), &flags),
                   vec![1, 2, 3]);
        assert_eq!(walk(&s, state(SolveStatus::Failed, Some(6), true), &flags),
                   vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_record_retried_only_at_higher_tiers() {
        let s = scheduler();
        // Hinted tiers already tried; nothing new without blind search.
        assert_eq!(s.next_pass(&state(SolveStatus::Failed, Some(3), true),
                               &SolveFlags::default()),
                   NextPass::Exhausted);
        // Blind search opens up tiers 4-6.
        let flags = SolveFlags{blind_search: true, ..Default::default()};
        assert_eq!(walk(&s, state(SolveStatus::Failed, Some(3), true), &flags),
                   vec![4, 5, 6]);
        // Everything tried.
        assert_eq!(s.next_pass(&state(SolveStatus::Failed, Some(6), true), &flags),
                   NextPass::Exhausted);
    }

    #[test]
    fn test_next_pass_is_deterministic() {
        let s = scheduler();
        let flags = SolveFlags{blind_search: true, ..Default::default()};
        let mut st = state(SolveStatus::Pending, None, true);
        st.record_attempt(2);
        let first = s.next_pass(&st, &flags);
        for _ in 0..10 {
            assert_eq!(s.next_pass(&st, &flags), first);
        }
        assert!(matches!(first, NextPass::Attempt(p) if p.tier == 3));
    }

    #[test]
    fn test_record_attempt_keeps_maximum() {
        let mut st = state(SolveStatus::Pending, None, true);
        st.record_attempt(3);
        st.record_attempt(1);
        assert_eq!(st.run_last_pass, Some(3));
    }

    #[test]
    fn test_classify_threshold() {
        let s = PassScheduler::new(default_ladder(), 25.0).unwrap();
        let mut result = SolveResult{confidence: 25.0, ..Default::default()};
        assert_eq!(s.classify(&result), AttemptOutcome::Success);
        result.confidence = 24.99;
        assert_eq!(s.classify(&result), AttemptOutcome::BelowThreshold);
    }

    #[test]
    fn test_hint_for() {
        let ladder = default_ladder();
        let coord = SkyCoord{ra: 83.8, dec: -5.4};
        let hint = ladder[0].hint_for(Some(coord)).unwrap();
        assert_eq!(hint.coord, coord);
        assert_eq!(hint.radius_deg, 5.0);
        assert_eq!(ladder[0].hint_for(None), None);
        assert_eq!(ladder[3].hint_for(Some(coord)), None);
    }

    #[test]
    fn test_validate_ladder() {
        assert!(validate_ladder(&default_ladder()).is_ok());
        assert!(validate_ladder(&[]).is_err());

        let mut ladder = default_ladder();
        ladder[1].search_radius_deg = None;
        assert!(validate_ladder(&ladder).is_err());

        let mut ladder = default_ladder();
        ladder[4].downsample = 0;
        assert!(validate_ladder(&ladder).is_err());

        let mut ladder = default_ladder();
        ladder[5].time_budget_secs = 0.0;
        assert!(validate_ladder(&ladder).is_err());

        let mut ladder = default_ladder();
        ladder[0].scale_low = 20.0;
        assert!(validate_ladder(&ladder).is_err());

        assert!(PassScheduler::new(default_ladder(), f64::NAN).is_err());
    }

    #[test]
    fn test_attempt_outcome_from_error() {
        use canonical_error::{deadline_exceeded_error, failed_precondition_error,
                              not_found_error};
        assert_eq!(AttemptOutcome::from_error(&not_found_error("no match")),
                   AttemptOutcome::NoMatch);
        assert_eq!(AttemptOutcome::from_error(&deadline_exceeded_error("slow")),
                   AttemptOutcome::Timeout);
        assert_eq!(AttemptOutcome::from_error(&failed_precondition_error("gone")),
                   AttemptOutcome::SolverError);
    }

}  // mod tests.
