// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Drives the pass ladder over session records and commits the outcomes.
//!
//! Targeted mode solves one record (normally the shot just taken) without
//! blind search. Batch mode walks the whole log. Either way each record that
//! reaches the solver gets exactly one commit, whether it solved or not, so
//! its attempt history is durable; an interrupted batch loses at most the
//! record in flight.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, CanonicalErrorCode, failed_precondition_error,
                      not_found_error};
use chrono::Local;
use log::{debug, info, warn};

use crate::astro_util::{MountDrift, mount_drift};
use crate::pass_scheduler::{AttemptOutcome, EscalationState, NextPass,
                            PassScheduler, SolveFlags};
use crate::session_store::SessionStore;
use crate::shot_record::{SolveAttempt, SolveStatus};
use crate::solver_trait::{PlateSolver, SkyCoord, SolveResult};
use crate::value_stats::{ValueStats, ValueStatsAccumulator};

/// Written to analysis.sse_version.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

// Window for the "recent" half of the batch statistics.
const STATS_CAPACITY: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    // A tier produced an accepted solution; committed as success.
    Solved,
    // Every applicable tier failed; committed as failed.
    Failed,
    // Override run failed; the earlier success was kept and only the new
    // attempts were committed.
    KeptPrior,
    // Already solved and not overridden. Not committed.
    Skipped,
    // No tier is applicable (no hint and no blind search, or every
    // applicable tier was already tried). Not committed.
    NothingToTry,
}

impl RecordOutcome {
    pub fn committed(&self) -> bool {
        matches!(self, RecordOutcome::Solved | RecordOutcome::Failed |
                       RecordOutcome::KeptPrior)
    }
}

#[derive(Clone, Debug)]
pub struct RecordReport {
    pub file_name: String,
    pub outcome: RecordOutcome,

    // Attempts made during this run, in order.
    pub attempts: Vec<SolveAttempt>,

    // The accepted solution and the tier label that produced it.
    pub solution: Option<SolveResult>,
    pub solve_path: Option<String>,

    pub hint: Option<SkyCoord>,
    // Present when both a hint and a solution exist.
    pub drift: Option<MountDrift>,

    // Wall clock time for the whole record, all attempts included.
    pub elapsed: Duration,

    // Committed, but the mirror could not be regenerated.
    pub mirror_stale: bool,

    // Targeted mode only: whether the latest-shot snapshot was updated.
    pub snapshot_updated: bool,
}

impl RecordReport {
    /// A targeted run that could try no tier at all is an error for the
    /// caller; every other outcome is not.
    pub fn check_attempted(&self) -> Result<(), CanonicalError> {
        if self.outcome == RecordOutcome::NothingToTry {
            return Err(failed_precondition_error(
                format!("No solve tier applies to {}; it has no pointing hint \
                         or every hinted tier was already tried",
                        self.file_name).as_str()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub reports: Vec<RecordReport>,

    // Records that could not be processed, with the reason. The batch
    // continued past them.
    pub errors: Vec<(String, String)>,

    // Seconds per accepted solution.
    pub solve_latency_stats: ValueStats,
    // Solver invocations per committed record.
    pub solve_attempt_stats: ValueStats,
    // 1 for each solved record, 0 for each failed one.
    pub solve_success_stats: ValueStats,
}

impl BatchSummary {
    pub fn count(&self, outcome: RecordOutcome) -> usize {
        self.reports.iter().filter(|r| r.outcome == outcome).count()
    }
}

pub struct Reconciler {
    store: SessionStore,
    solver: Box<dyn PlateSolver>,
    scheduler: PassScheduler,
    flags: SolveFlags,

    solve_latency_stats: ValueStatsAccumulator,
    solve_attempt_stats: ValueStatsAccumulator,
    solve_success_stats: ValueStatsAccumulator,
}

impl Reconciler {
    pub fn new(store: SessionStore,
               solver: Box<dyn PlateSolver>,
               scheduler: PassScheduler,
               flags: SolveFlags) -> Self {
        info!("Reconciler using {}, {} tiers, acceptance log-odds {}, {:?}",
              solver.name(), scheduler.ladder().len(),
              scheduler.acceptance_log_odds(), flags);
        Reconciler{
            store, solver, scheduler, flags,
            solve_latency_stats: ValueStatsAccumulator::new(STATS_CAPACITY),
            solve_attempt_stats: ValueStatsAccumulator::new(STATS_CAPACITY),
            solve_success_stats: ValueStatsAccumulator::new(STATS_CAPACITY),
        }
    }

    /// Solves one record with blind search disabled. With no `file_name`
    /// the record named by the latest-shot snapshot is used, or failing
    /// that the last record in the log. A missing record is an error.
    pub fn run_targeted(&mut self, file_name: Option<&str>)
                        -> Result<RecordReport, CanonicalError> {
        let file_name = match file_name {
            Some(name) => name.to_string(),
            None => self.store.latest_snapshot_file_name()
                .or_else(|| self.store.latest().map(|r| r.file_name().to_string()))
                .ok_or_else(|| not_found_error(
                    format!("No records in {:?}", self.store.master_path()).as_str()))?,
        };
        let flags = SolveFlags{blind_search: false, ..self.flags};
        let mut report = self.reconcile_record(&file_name, &flags)?;
        if report.outcome.committed() {
            let committed = self.store.find(&file_name)?;
            report.snapshot_updated = match self.store.sync_latest_snapshot(committed) {
                Ok(updated) => updated,
                Err(e) => {
                    warn!("Could not update latest-shot snapshot: {}", e.message);
                    false
                }
            };
        }
        Ok(report)
    }

    /// Processes every record in log order, or just `only` if given.
    /// Per-record problems are collected in the summary and the batch moves
    /// on; a store that cannot be read or locked ends the batch with an
    /// error.
    pub fn run_batch(&mut self, only: Option<&str>)
                     -> Result<BatchSummary, CanonicalError> {
        let mut names: Vec<String> = match only {
            Some(name) => vec![name.to_string()],
            None => self.store.records().iter()
                .map(|r| r.file_name().to_string()).collect(),
        };
        let mut seen = HashSet::new();
        names.retain(|name| seen.insert(name.clone()));
        info!("Batch over {} records", names.len());

        let flags = self.flags;
        let mut summary = BatchSummary::default();
        for name in names {
            match self.reconcile_record(&name, &flags) {
                Ok(report) => summary.reports.push(report),
                Err(e) => match e.code {
                    CanonicalErrorCode::DataLoss | CanonicalErrorCode::Aborted => {
                        return Err(e);
                    },
                    _ => {
                        warn!("Skipping {}: {}", name, e.message);
                        summary.errors.push((name, e.message));
                    },
                },
            }
        }
        summary.solve_latency_stats = self.solve_latency_stats.value_stats.clone();
        summary.solve_attempt_stats = self.solve_attempt_stats.value_stats.clone();
        summary.solve_success_stats = self.solve_success_stats.value_stats.clone();
        info!("Batch done: {} solved, {} failed, {} kept prior, {} skipped, \
               {} nothing to try, {} errors",
              summary.count(RecordOutcome::Solved), summary.count(RecordOutcome::Failed),
              summary.count(RecordOutcome::KeptPrior), summary.count(RecordOutcome::Skipped),
              summary.count(RecordOutcome::NothingToTry), summary.errors.len());
        Ok(summary)
    }

    /// Runs the ladder for one record and commits the outcome. The record
    /// is re-read from disk first, so work committed by another process
    /// since this reconciler was created decides where escalation starts.
    pub fn reconcile_record(&mut self, file_name: &str, flags: &SolveFlags)
                            -> Result<RecordReport, CanonicalError> {
        let start = Instant::now();
        let mut record = self.store.reload_record(file_name)?.clone();
        let mut analysis = record.analysis()?;
        let hint = record.hint();
        let image = record.image_path(self.store.session_dir());
        let mut state = EscalationState::from_analysis(&analysis, hint.is_some());

        let mut attempts = Vec::new();
        let mut accepted: Option<(u8, String, SolveResult)> = None;
        // Highest-confidence match that fell short of the threshold.
        let mut best_rejected: Option<SolveResult> = None;

        while let NextPass::Attempt(pass) = self.scheduler.next_pass(&state, flags) {
            state.record_attempt(pass.tier);
            let pass_hint = pass.hint_for(hint);
            info!("{}: {} ({:?}, radius {:?}, downsample {}, sigma {})",
                  file_name, pass.label(), pass.kind, pass.search_radius_deg,
                  pass.downsample, pass.sigma);

            let attempt_start = Instant::now();
            let solved = self.solver.solve(&image, pass_hint.as_ref(), pass);
            let (outcome, confidence, duration) = match &solved {
                Ok(result) => (self.scheduler.classify(result), Some(result.confidence),
                               result.duration),
                Err(e) => (AttemptOutcome::from_error(e), None, attempt_start.elapsed()),
            };
            attempts.push(SolveAttempt{
                pass: pass.tier,
                label: pass.label(),
                outcome: outcome.as_str().to_string(),
                confidence,
                duration_sec: (duration.as_secs_f64() * 100.0).round() / 100.0,
                timestamp: now(),
            });

            match solved {
                Ok(result) if outcome == AttemptOutcome::Success => {
                    info!("{}: {} solved, log-odds {:.2}, hit/miss {}",
                          file_name, pass.label(), result.confidence, result.hit_miss);
                    accepted = Some((pass.tier, pass.label(), result));
                    break;
                },
                Ok(result) => {
                    info!("{}: {} match rejected, log-odds {:.2} < {}",
                          file_name, pass.label(), result.confidence,
                          self.scheduler.acceptance_log_odds());
                    if best_rejected.as_ref().map_or(true, |b| result.confidence > b.confidence) {
                        best_rejected = Some(result);
                    }
                },
                Err(e) => {
                    info!("{}: {} {}: {}", file_name, pass.label(), outcome.as_str(), e.message);
                },
            }
        }

        let mut report = RecordReport{
            file_name: file_name.to_string(),
            outcome: RecordOutcome::NothingToTry,
            attempts: attempts.clone(),
            solution: None,
            solve_path: None,
            hint,
            drift: None,
            elapsed: Duration::ZERO,
            mirror_stale: false,
            snapshot_updated: false,
        };
        if attempts.is_empty() {
            report.outcome =
                if analysis.solve_status == SolveStatus::Success && !flags.force {
                    RecordOutcome::Skipped
                } else {
                    RecordOutcome::NothingToTry
                };
            debug!("{}: {:?}", file_name, report.outcome);
            report.elapsed = start.elapsed();
            return Ok(report);
        }

        let attempt_count = attempts.len();
        analysis.attempts.extend(attempts);
        report.outcome = match accepted {
            Some((tier, label, result)) => {
                analysis.mark_solved(tier, label.clone(), &result, ENGINE_VERSION, now());
                report.drift = hint.map(|h| mount_drift(h, result.center));
                report.solve_path = Some(label);
                report.solution = Some(result);
                RecordOutcome::Solved
            },
            None if analysis.solve_status == SolveStatus::Success => {
                warn!("{}: override found no better solution; keeping {}",
                      file_name, analysis.solve_path.as_deref().unwrap_or("prior result"));
                RecordOutcome::KeptPrior
            },
            None => {
                analysis.mark_failed(state.run_last_pass, best_rejected.as_ref(),
                                     ENGINE_VERSION, now());
                RecordOutcome::Failed
            },
        };
        record.apply_analysis(&analysis);
        let commit = self.store.commit(&record)?;
        report.mirror_stale = commit.mirror_error.is_some();
        if commit.kept_success {
            // Another process solved it while the ladder ran.
            report.outcome = RecordOutcome::KeptPrior;
        }
        report.elapsed = start.elapsed();

        self.solve_attempt_stats.add_value(attempt_count as f64);
        match report.outcome {
            RecordOutcome::Solved => {
                self.solve_success_stats.add_value(1.0);
                self.solve_latency_stats.add_value(report.elapsed.as_secs_f64());
            },
            RecordOutcome::Failed => self.solve_success_stats.add_value(0.0),
            _ => {},
        }
        Ok(report)
    }
}

fn now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

// mod tests.
