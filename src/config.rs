// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};
use serde::{Deserialize, Serialize};

use crate::pass_scheduler::{DEFAULT_ACCEPTANCE_LOG_ODDS, PassScheduler, PassSpec,
                            default_ladder, validate_ladder};

/// Settings for one `skysolve` run. Every field has a default, so an empty
/// JSON object (or no file at all) is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkysolveConfig {
    // Solutions below this log-odds are not accepted.
    pub acceptance_log_odds: f64,

    pub solver: SolverConfig,

    // Escalation ladder, lowest tier first.
    pub passes: Vec<PassSpec>,

    pub store: StoreConfig,
}

impl Default for SkysolveConfig {
    fn default() -> Self {
        SkysolveConfig{
            acceptance_log_odds: DEFAULT_ACCEPTANCE_LOG_ODDS,
            solver: SolverConfig::default(),
            passes: default_ladder(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    // Executable name or path of astrometry.net's solve-field.
    pub command: String,

    // Scratch directory for solver output files.
    pub work_dir: PathBuf,

    // Passed as --cpulimit.
    pub cpu_limit_secs: u32,

    // Units of PassSpec scale_low/scale_high, passed as --scale-units.
    pub scale_units: String,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig{
            command: "solve-field".to_string(),
            work_dir: PathBuf::from("/tmp/skysolver"),
            cpu_limit_secs: 20,
            scale_units: "arcsecperpix".to_string(),
        }
    }
}

/// File names within a session directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub master_file: String,
    pub mirror_file: String,
    pub latest_file: String,

    // How long a commit waits for another process to release the log.
    pub lock_wait_secs: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig{
            master_file: "shutter_log.json".to_string(),
            mirror_file: "shutter_log.csv".to_string(),
            latest_file: "latest_shot.json".to_string(),
            lock_wait_secs: 10.0,
        }
    }
}

impl StoreConfig {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs_f64(self.lock_wait_secs)
    }
}

impl SkysolveConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, CanonicalError> {
        let text = fs::read_to_string(path).map_err(|e| {
            invalid_argument_error(
                format!("Could not read config file {:?}: {:?}", path, e).as_str())
        })?;
        let config: SkysolveConfig = serde_json::from_str(&text).map_err(|e| {
            invalid_argument_error(
                format!("Could not parse config file {:?}: {}", path, e).as_str())
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CanonicalError> {
        if !self.acceptance_log_odds.is_finite() {
            return Err(invalid_argument_error(
                format!("acceptance_log_odds must be finite; got {}",
                        self.acceptance_log_odds).as_str()));
        }
        validate_ladder(&self.passes)?;
        if self.solver.command.trim().is_empty() {
            return Err(invalid_argument_error("solver command must not be empty"));
        }
        for (what, name) in [("master_file", &self.store.master_file),
                             ("mirror_file", &self.store.mirror_file),
                             ("latest_file", &self.store.latest_file)] {
            if name.is_empty() {
                return Err(invalid_argument_error(
                    format!("store {} must not be empty", what).as_str()));
            }
        }
        if !(self.store.lock_wait_secs > 0.0) || !self.store.lock_wait_secs.is_finite() {
            return Err(invalid_argument_error(
                format!("lock_wait_secs must be positive; got {}",
                        self.store.lock_wait_secs).as_str()));
        }
        Ok(())
    }

    pub fn scheduler(&self) -> Result<PassScheduler, CanonicalError> {
        PassScheduler::new(self.passes.clone(), self.acceptance_log_odds)
    }
}

// mod tests.
