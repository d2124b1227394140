// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use canonical_error::{CanonicalError, invalid_argument_error, not_found_error};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use skysolve::astro_util::{deg_to_dms, deg_to_hms, star_rating};
use skysolve::astrometry_subprocess::{SolveFieldSolver, kill_running_solver};
use skysolve::config::SkysolveConfig;
use skysolve::pass_scheduler::SolveFlags;
use skysolve::reconciler::{BatchSummary, RecordReport, Reconciler};
use skysolve::session_store::SessionStore;
use skysolve::value_stats::ValueStats;

/// Plate-solves the exposures recorded in a session log and writes the
/// results back into the log.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// JSON configuration file. Built-in defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Minimum log-odds for a solution to be accepted. Overrides the
    /// configuration file.
    #[arg(long)]
    threshold: Option<f64>,

    /// solve-field executable. Overrides the configuration file.
    #[arg(long)]
    solver: Option<String>,

    /// Directory for the rolling log file.
    #[arg(long, default_value = ".")]
    log_dir: String,

    /// Prefix of the rolling log file name.
    #[arg(long, default_value = "skysolve_log.txt")]
    log_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Solve the most recent shot of a session, without blind search.
    Latest {
        session_dir: PathBuf,
    },
    /// Solve every record of a session directory, or the one record named
    /// by an image file.
    Select {
        target: PathBuf,

        /// Fall back to blind (all-sky) tiers when hinted tiers fail or no
        /// hint is available.
        #[arg(long)]
        allsky: bool,

        /// Re-solve records that are already solved.
        #[arg(long)]
        force: bool,
    },
    /// Rewrite the CSV mirror from the master log.
    Mirror {
        session_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging.
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Could not open log file in {:?}: {}", args.log_dir, e);
            return ExitCode::FAILURE;
        }
    };

    // Create non-blocking writers for both the file and stdout
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    // Commits are atomic renames, so stopping mid-run leaves the log intact.
    // solve-field runs in its own process group and must be killed here.
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        kill_running_solver();
        std::process::exit(1);
    }) {
        warn!("Could not install control-c handler: {}", e);
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<SkysolveConfig, CanonicalError> {
    let mut config = match &args.config {
        Some(path) => SkysolveConfig::load(path)?,
        None => SkysolveConfig::default(),
    };
    if let Some(threshold) = args.threshold {
        config.acceptance_log_odds = threshold;
    }
    if let Some(solver) = &args.solver {
        config.solver.command = solver.clone();
    }
    config.validate()?;
    Ok(config)
}

fn make_reconciler(config: &SkysolveConfig, session_dir: &Path, flags: SolveFlags)
                   -> Result<Reconciler, CanonicalError> {
    let store = SessionStore::open(session_dir, &config.store)?;
    let solver = SolveFieldSolver::new(&config.solver)?;
    Ok(Reconciler::new(store, Box::new(solver), config.scheduler()?, flags))
}

fn run(args: &Args) -> Result<(), CanonicalError> {
    let config = load_config(args)?;
    match &args.command {
        Command::Latest{session_dir} => {
            let mut reconciler = make_reconciler(&config, session_dir,
                                                 SolveFlags::default())?;
            let report = reconciler.run_targeted(None)?;
            print_report(&report);
            report.check_attempted()?;
        },
        Command::Select{target, allsky, force} => {
            let (session_dir, only) = split_target(target)?;
            let flags = SolveFlags{force: *force, blind_search: *allsky};
            let mut reconciler = make_reconciler(&config, &session_dir, flags)?;
            let summary = reconciler.run_batch(only.as_deref())?;
            if let Some(name) = &only {
                if summary.reports.is_empty() {
                    // Batch errors are collected rather than returned; a
                    // named record that is missing is still a failure.
                    let message = summary.errors.first()
                        .map(|(_, message)| message.clone())
                        .unwrap_or_else(|| format!("{} was not processed", name));
                    return Err(not_found_error(message.as_str()));
                }
            }
            print_summary(&summary);
        },
        Command::Mirror{session_dir} => {
            let mut store = SessionStore::open(session_dir, &config.store)?;
            store.rebuild_mirror()?;
            println!("Wrote {} rows to {:?}", store.records().len(), store.mirror_path());
        },
    }
    Ok(())
}

// A directory is a whole session; a file names one record in the session
// log of its parent directory.
fn split_target(target: &Path) -> Result<(PathBuf, Option<String>), CanonicalError> {
    if target.is_dir() {
        return Ok((target.to_path_buf(), None));
    }
    if !target.is_file() {
        return Err(invalid_argument_error(
            format!("{:?} is neither a session directory nor an image file",
                    target).as_str()));
    }
    let file_name = target.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| invalid_argument_error(
            format!("No file name in {:?}", target).as_str()))?;
    let session_dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((session_dir, Some(file_name)))
}

fn print_report(report: &RecordReport) {
    println!("{}: {:?} after {} attempts in {:.1}s",
             report.file_name, report.outcome, report.attempts.len(),
             report.elapsed.as_secs_f64());
    if let Some(solution) = &report.solution {
        println!("  solve path  {}", report.solve_path.as_deref().unwrap_or("-"));
        println!("  solve time  {:.2}s", solution.duration.as_secs_f64());
        println!("  confidence  {:.1}", solution.confidence);
        if let Some(stars) = solution.matched_stars {
            println!("  stars       {} {}", stars, star_rating(stars));
        }
        println!("  RA / Dec    {} {}",
                 deg_to_hms(solution.center.ra), deg_to_dms(solution.center.dec));
        if let Some(orientation) = solution.orientation {
            println!("  rotation    {:.2} deg", orientation);
        }
    }
    if let Some(drift) = &report.drift {
        println!("  drift       dRA {:+.3} deg, dDec {:+.3} deg, {:.1}'{}",
                 drift.d_ra_deg, drift.d_dec_deg, drift.separation_arcmin,
                 if drift.needs_sync() { "  SYNC MOUNT" } else { "" });
    }
    for attempt in &report.attempts {
        println!("  pass {} {:<12} {:<16} {:>6.1}s",
                 attempt.pass, attempt.label, attempt.outcome, attempt.duration_sec);
    }
    if report.mirror_stale {
        println!("  mirror is stale; run `skysolve mirror` to rebuild it");
    }
    if report.snapshot_updated {
        println!("  latest-shot snapshot updated");
    }
}

fn print_summary(summary: &BatchSummary) {
    for report in &summary.reports {
        print_report(report);
    }
    for (name, message) in &summary.errors {
        println!("{}: {}", name, message);
    }
    log_stats("Solve time (s)", &summary.solve_latency_stats);
    log_stats("Attempts per record", &summary.solve_attempt_stats);
    log_stats("Success rate", &summary.solve_success_stats);
}

fn log_stats(what: &str, stats: &ValueStats) {
    if stats.session_count > 0 {
        info!("{}: {}", what, stats);
    }
}
