// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, deadline_exceeded_error,
                      failed_precondition_error, internal_error,
                      invalid_argument_error, not_found_error};
use log::{debug, warn};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use regex::Regex;

use crate::config::SolverConfig;
use crate::pass_scheduler::PassSpec;
use crate::solver_trait::{PlateSolver, SkyCoord, SolveHint, SolveResult};

// How often we check whether solve-field has exited.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

// Process group of the solve-field currently running, or zero. solve-field
// runs in its own group, so a terminal interrupt does not reach it.
static RUNNING_SOLVER_GROUP: AtomicI32 = AtomicI32::new(0);

/// Kills the process group of the solve-field run in progress, if any. Safe
/// to call from a signal handler thread.
pub fn kill_running_solver() {
    let pgid = RUNNING_SOLVER_GROUP.swap(0, Ordering::SeqCst);
    if pgid != 0 {
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pgid, e);
        }
    }
}

/// Runs astrometry.net's `solve-field` once per solve() call, killing it if
/// it outlives the pass's time budget.
pub struct SolveFieldSolver {
    command: String,
    work_dir: PathBuf,
    cpu_limit_secs: u32,
    scale_units: String,

    report: ReportPatterns,
}

struct ReportPatterns {
    solved: Regex,
    center: Regex,
    rotation: Regex,
    sources: Regex,
    log_odds: Regex,
    hit_miss: Regex,
}

impl ReportPatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(ReportPatterns{
            solved: Regex::new(r"Field 1: solved")?,
            center: Regex::new(
                r"Field center: \(RA,Dec\) = \(([\d\.-]+), ([\d\.-]+)\) deg")?,
            rotation: Regex::new(r"Field rotation angle: up is ([\d\.-]+) degrees")?,
            sources: Regex::new(r"found (\d+) sources")?,
            log_odds: Regex::new(r"log-odds ratio ([\d\.]+)")?,
            hit_miss: Regex::new(r"Hit/miss: ([\+\-]+)")?,
        })
    }
}

impl SolveFieldSolver {
    pub fn new(config: &SolverConfig) -> Result<Self, CanonicalError> {
        fs::create_dir_all(&config.work_dir).map_err(|e| {
            failed_precondition_error(
                format!("Could not create solver work dir {:?}: {:?}",
                        config.work_dir, e).as_str())
        })?;
        let report = ReportPatterns::new().map_err(|e| {
            internal_error(format!("Bad report pattern: {:?}", e).as_str())
        })?;
        Ok(SolveFieldSolver{
            command: config.command.clone(),
            work_dir: config.work_dir.clone(),
            cpu_limit_secs: config.cpu_limit_secs,
            scale_units: config.scale_units.clone(),
            report,
        })
    }

    fn build_args(&self, image: &Path, hint: Option<&SolveHint>, pass: &PassSpec)
                  -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            image.into(),
            "--dir".into(), self.work_dir.clone().into(),
            "--overwrite".into(),
            "--no-plots".into(),
            "--scale-low".into(), pass.scale_low.to_string().into(),
            "--scale-high".into(), pass.scale_high.to_string().into(),
            "--scale-units".into(), self.scale_units.clone().into(),
            "--cpulimit".into(), self.cpu_limit_secs.to_string().into(),
            "--sigma".into(), pass.sigma.to_string().into(),
            "--downsample".into(), pass.downsample.to_string().into(),
            "--objs".into(), pass.max_objects.to_string().into(),
        ];
        if let Some(hint) = hint {
            let hint_args: [OsString; 6] = [
                "--ra".into(), hint.coord.ra.to_string().into(),
                "--dec".into(), hint.coord.dec.to_string().into(),
                "--radius".into(), hint.radius_deg.to_string().into(),
            ];
            args.extend(hint_args);
        }
        args
    }

    fn make_child(&self, args: &[OsString]) -> Result<Child, CanonicalError> {
        match Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so a timeout also stops solve-field's helpers.
            .process_group(0)
            .spawn() {
                Err(e) => {
                    Err(failed_precondition_error(
                        format!("Could not start {}: {:?}", self.command, e).as_str()))
                },
                Ok(child) => {
                    debug!("{} started, pid {}", self.command, child.id());
                    RUNNING_SOLVER_GROUP.store(child.id() as i32, Ordering::SeqCst);
                    Ok(child)
                }
            }
    }

    // Collects stdout, echoing it to the debug log.
    fn make_stdout_worker(stdout: impl Read + Send + 'static) -> JoinHandle<String> {
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut collected = String::new();
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,  // EOF, or the pipe went away.
                    Ok(_) => {
                        debug!("{}", line.trim_end());
                        collected.push_str(&line);
                    }
                }
            }
            collected
        })
    }

    fn make_stderr_worker(stderr: impl Read + Send + 'static) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut reader = BufReader::new(stderr);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => warn!("{}", line.trim_end()),
                }
            }
        })
    }

    // Runs solve-field to completion or until `budget` elapses. Returns the
    // exit status and everything it wrote to stdout.
    fn run_with_timeout(&self, args: &[OsString], budget: Duration)
                        -> Result<(ExitStatus, String), CanonicalError> {
        let deadline = Instant::now() + budget;
        let mut child = self.make_child(args)?;
        let stdout_worker = child.stdout.take().map(Self::make_stdout_worker);
        let stderr_worker = child.stderr.take().map(Self::make_stderr_worker);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    RUNNING_SOLVER_GROUP.store(0, Ordering::SeqCst);
                    break status;
                },
                Ok(None) => {},
                Err(e) => {
                    Self::terminate(&mut child);
                    return Err(internal_error(
                        format!("Could not wait for {}: {:?}", self.command, e).as_str()));
                }
            }
            if Instant::now() >= deadline {
                Self::terminate(&mut child);
                // Reader threads exit on their own once the pipes close.
                return Err(deadline_exceeded_error(
                    format!("{} did not finish within {:?}", self.command, budget).as_str()));
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = match stdout_worker {
            Some(worker) => worker.join().unwrap_or_default(),
            None => String::new(),
        };
        if let Some(worker) = stderr_worker {
            let _ = worker.join();
        }
        Ok((status, stdout))
    }

    fn terminate(child: &mut Child) {
        let pgid = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            debug!("killpg({}) failed: {}; killing child only", pgid, e);
            let _ = child.kill();
        }
        let _ = child.wait();
        RUNNING_SOLVER_GROUP.store(0, Ordering::SeqCst);
    }

    /// Extracts the solution from solve-field's stdout. `duration` is left
    /// zero for the caller to fill in.
    fn parse_report(&self, stdout: &str) -> Result<SolveResult, CanonicalError> {
        if !self.report.solved.is_match(stdout) {
            return Err(not_found_error("solve-field did not find a match"));
        }
        let center = self.report.center.captures(stdout).ok_or_else(|| {
            internal_error("solve-field reported a solution without a field center")
        })?;
        let ra = parse_number(&center[1])?;
        let dec = parse_number(&center[2])?;
        let orientation = match self.report.rotation.captures(stdout) {
            Some(c) => Some(parse_number(&c[1])?),
            None => None,
        };
        let matched_stars = match self.report.sources.captures(stdout) {
            Some(c) => Some(c[1].parse::<u32>().map_err(|e| {
                internal_error(format!("Bad source count {:?}: {:?}", &c[1], e).as_str())
            })?),
            None => None,
        };
        // A solution without a reported log-odds is not trusted.
        let confidence = match self.report.log_odds.captures(stdout) {
            Some(c) => parse_number(&c[1])?,
            None => 0.0,
        };
        let hit_miss = self.report.hit_miss.captures(stdout)
            .map(|c| c[1].chars().take(15).collect())
            .unwrap_or_default();
        Ok(SolveResult{
            center: SkyCoord{ra, dec},
            orientation,
            confidence,
            matched_stars,
            duration: Duration::ZERO,
            hit_miss,
        })
    }
}

fn parse_number(text: &str) -> Result<f64, CanonicalError> {
    text.parse::<f64>().map_err(|e| {
        internal_error(format!("Bad number {:?} in solver report: {:?}", text, e).as_str())
    })
}

impl PlateSolver for SolveFieldSolver {
    fn solve(&self,
             image: &Path,
             hint: Option<&SolveHint>,
             pass: &PassSpec)
             -> Result<SolveResult, CanonicalError> {
        if !image.is_file() {
            return Err(invalid_argument_error(
                format!("Image {:?} does not exist", image).as_str()));
        }
        let start = Instant::now();
        let args = self.build_args(image, hint, pass);
        let (status, stdout) = self.run_with_timeout(&args, pass.time_budget())?;

        match self.parse_report(&stdout) {
            Ok(mut result) => {
                result.duration = start.elapsed();
                Ok(result)
            },
            Err(e) if status.success() => Err(e),
            Err(_) => Err(internal_error(
                format!("{} exited with {} on {:?}", self.command, status, image).as_str())),
        }
    }

    fn name(&self) -> String {
        format!("astrometry.net ({})", self.command)
    }
}

// mod tests.
