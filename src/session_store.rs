// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Durable per-session log of ShotRecords.
//!
//! The master log is a JSON array written with four-space indentation. Every
//! commit rewrites the whole document: it is serialized to a scratch file,
//! synced, and renamed over the master, so readers see either the old or the
//! new document and never a torn one. The previous master is kept as a
//! single `.bak` copy for recovery. After the master is installed the CSV
//! mirror is regenerated from it; mirror failures are reported but do not
//! undo the commit.
//!
//! Commits from different processes are serialized with an exclusive
//! advisory lock on a sidecar `<master>.lock` file (the master itself is
//! replaced on every commit, so it cannot carry the lock). While holding
//! the lock a commit re-reads the master, so a record committed by another
//! process in the meantime is not lost.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, aborted_error, already_exists_error,
                      data_loss_error, internal_error, not_found_error};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde_json::Value;
use serde_json::ser::PrettyFormatter;

use crate::config::StoreConfig;
use crate::csv_mirror;
use crate::shot_record::{ShotRecord, SolveStatus};

/// Where the in-memory collection came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadSource {
    Master,
    // The master was missing or corrupt; the backup was used.
    Backup,
    // Neither file exists yet.
    Empty,
}

#[derive(Debug)]
pub struct CommitReport {
    // True if an existing record was replaced, false if appended.
    pub replaced: bool,

    // A success already on disk was kept instead of the committed non-success
    // analysis; only the committed record's new attempts were added.
    pub kept_success: bool,

    // The master write succeeded but the mirror could not be regenerated.
    pub mirror_error: Option<CanonicalError>,
}

pub struct SessionStore {
    session_dir: PathBuf,
    master_path: PathBuf,
    backup_path: PathBuf,
    lock_path: PathBuf,
    mirror_path: PathBuf,
    latest_path: PathBuf,
    lock_wait: Duration,

    records: Vec<ShotRecord>,
    load_source: LoadSource,
}

// Result of reading the on-disk log.
struct DiskLog {
    records: Vec<ShotRecord>,
    source: LoadSource,
    // The master exists but could not be parsed.
    master_corrupt: bool,
}

impl SessionStore {
    /// Loads the session log in `session_dir`. A corrupt master is recovered
    /// from its backup; if neither is usable a DataLoss error is returned.
    /// Loading never modifies the files.
    pub fn open(session_dir: &Path, config: &StoreConfig)
                -> Result<Self, CanonicalError> {
        let master_path = session_dir.join(&config.master_file);
        let mut store = SessionStore{
            session_dir: session_dir.to_path_buf(),
            backup_path: with_suffix(&master_path, ".bak"),
            lock_path: with_suffix(&master_path, ".lock"),
            master_path,
            mirror_path: session_dir.join(&config.mirror_file),
            latest_path: session_dir.join(&config.latest_file),
            lock_wait: config.lock_wait(),
            records: Vec::new(),
            load_source: LoadSource::Empty,
        };
        store.load()?;
        Ok(store)
    }

    /// Re-reads the log from disk, discarding the in-memory collection.
    pub fn load(&mut self) -> Result<&[ShotRecord], CanonicalError> {
        let disk = self.read_disk()?;
        warn_duplicates(&disk.records);
        info!("Loaded {} records from {:?} ({:?})",
              disk.records.len(), self.master_path, disk.source);
        self.records = disk.records;
        self.load_source = disk.source;
        Ok(&self.records)
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn master_path(&self) -> &Path {
        &self.master_path
    }

    pub fn mirror_path(&self) -> &Path {
        &self.mirror_path
    }

    pub fn load_source(&self) -> LoadSource {
        self.load_source
    }

    pub fn records(&self) -> &[ShotRecord] {
        &self.records
    }

    /// First record with the given file name.
    pub fn find(&self, file_name: &str) -> Result<&ShotRecord, CanonicalError> {
        self.records.iter().find(|r| r.file_name() == file_name).ok_or_else(|| {
            not_found_error(
                format!("{} is not in {:?}", file_name, self.master_path).as_str())
        })
    }

    /// Re-reads the log and returns the current state of `file_name`, which
    /// another process may have committed since this store was loaded.
    pub fn reload_record(&mut self, file_name: &str)
                         -> Result<&ShotRecord, CanonicalError> {
        let disk = self.read_disk()?;
        self.records = disk.records;
        self.load_source = disk.source;
        self.find(file_name)
    }

    /// Most recently logged record.
    pub fn latest(&self) -> Option<&ShotRecord> {
        self.records.last()
    }

    /// Replaces the record with the same file name, or appends it if there
    /// is none, and persists the whole log. A `success` analysis on disk is
    /// never replaced by a non-success one: the disk entry is kept and only
    /// the attempts it does not have yet are added.
    pub fn commit(&mut self, record: &ShotRecord)
                  -> Result<CommitReport, CanonicalError> {
        self.locked_commit(record, /*allow_replace=*/true)
    }

    /// Adds a newly captured record. Fails with AlreadyExists if the log
    /// already has a record with this file name.
    pub fn append(&mut self, record: &ShotRecord)
                  -> Result<CommitReport, CanonicalError> {
        self.locked_commit(record, /*allow_replace=*/false)
    }

    /// Regenerates the mirror from the master as it is on disk.
    pub fn rebuild_mirror(&mut self) -> Result<(), CanonicalError> {
        let _lock = StoreLock::acquire(&self.lock_path, self.lock_wait)?;
        let disk = self.read_disk()?;
        self.records = disk.records;
        self.load_source = disk.source;
        self.write_mirror(&self.records)
    }

    /// File name recorded in the latest-shot snapshot, if there is one.
    pub fn latest_snapshot_file_name(&self) -> Option<String> {
        match self.read_snapshot() {
            Ok(Some((_, entry))) => Some(entry.file_name().to_string()),
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring latest-shot snapshot: {}", e.message);
                None
            }
        }
    }

    /// Copies `record`'s analysis into the latest-shot snapshot, but only if
    /// the snapshot still describes the same file. Returns whether the
    /// snapshot was updated; a snapshot that has moved on to a newer shot is
    /// left alone.
    pub fn sync_latest_snapshot(&self, record: &ShotRecord)
                                -> Result<bool, CanonicalError> {
        let (document, mut entry) = match self.read_snapshot()? {
            Some(snapshot) => snapshot,
            None => {
                debug!("No latest-shot snapshot at {:?}", self.latest_path);
                return Ok(false);
            }
        };
        if entry.file_name() != record.file_name() {
            warn!("Latest-shot snapshot now describes {}, not {}; not updating it",
                  entry.file_name(), record.file_name());
            return Ok(false);
        }
        entry.apply_analysis(&record.analysis()?);
        // Keep the snapshot's shape: a bare entry or a one-element array.
        let updated = match document {
            Value::Array(_) => Value::Array(vec![entry.into_value()]),
            _ => entry.into_value(),
        };
        let bytes = to_pretty_json(&updated)?;
        let scratch = with_suffix(&self.latest_path, ".tmp");
        write_synced(&scratch, &bytes)?;
        rename(&scratch, &self.latest_path)?;
        info!("Updated latest-shot snapshot for {}", record.file_name());
        Ok(true)
    }

    fn locked_commit(&mut self, record: &ShotRecord, allow_replace: bool)
                     -> Result<CommitReport, CanonicalError> {
        let _lock = StoreLock::acquire(&self.lock_path, self.lock_wait)?;
        let disk = self.read_disk()?;
        let mut records = disk.records;
        let mut kept_success = false;
        let replaced = match records.iter().position(|r| r.file_name() == record.file_name()) {
            Some(_) if !allow_replace => {
                return Err(already_exists_error(
                    format!("{} is already in {:?}",
                            record.file_name(), self.master_path).as_str()));
            },
            Some(index) => {
                records[index] = match keep_disk_success(&records[index], record) {
                    Some(merged) => {
                        warn!("{} was solved by another run; keeping that solution",
                              record.file_name());
                        kept_success = true;
                        merged
                    },
                    None => record.clone(),
                };
                true
            },
            None => {
                records.push(record.clone());
                false
            },
        };

        let scratch = self.write_temp(&records)?;
        self.install_temp(&scratch, disk.master_corrupt)?;
        debug!("Committed {} ({} records)", record.file_name(), records.len());
        self.records = records;
        self.load_source = LoadSource::Master;

        let mirror_error = self.write_mirror(&self.records).err();
        if let Some(e) = &mirror_error {
            warn!("Master log committed but mirror {:?} is stale: {}",
                  self.mirror_path, e.message);
        }
        Ok(CommitReport{replaced, kept_success, mirror_error})
    }

    // Serializes `records` to the scratch file and syncs it.
    fn write_temp(&self, records: &[ShotRecord]) -> Result<PathBuf, CanonicalError> {
        let bytes = to_pretty_json(records)?;
        let scratch = with_suffix(&self.master_path, ".tmp");
        write_synced(&scratch, &bytes)?;
        Ok(scratch)
    }

    // Rotates the current master into the backup slot (or moves it aside if
    // it is corrupt, so the good backup survives) and renames the scratch
    // file over it.
    fn install_temp(&self, scratch: &Path, master_corrupt: bool)
                    -> Result<(), CanonicalError> {
        if self.master_path.exists() {
            if master_corrupt {
                let aside = with_suffix(
                    &self.master_path,
                    format!(".corrupt.{}", chrono::Utc::now().timestamp()).as_str());
                warn!("Moving corrupt master {:?} to {:?}", self.master_path, aside);
                rename(&self.master_path, &aside)?;
            } else {
                let backup_scratch = with_suffix(&self.backup_path, ".tmp");
                fs::copy(&self.master_path, &backup_scratch).map_err(|e| {
                    internal_error(format!("Could not copy {:?} to {:?}: {:?}",
                                           self.master_path, backup_scratch, e).as_str())
                })?;
                File::open(&backup_scratch).and_then(|f| f.sync_all()).map_err(|e| {
                    internal_error(format!("Could not sync {:?}: {:?}",
                                           backup_scratch, e).as_str())
                })?;
                rename(&backup_scratch, &self.backup_path)?;
            }
        }
        rename(scratch, &self.master_path)?;
        if let Err(e) = File::open(&self.session_dir).and_then(|d| d.sync_all()) {
            debug!("Could not sync directory {:?}: {:?}", self.session_dir, e);
        }
        Ok(())
    }

    fn write_mirror(&self, records: &[ShotRecord]) -> Result<(), CanonicalError> {
        let scratch = with_suffix(&self.mirror_path, ".tmp");
        write_synced(&scratch, csv_mirror::render(records).as_bytes())?;
        rename(&scratch, &self.mirror_path)
    }

    fn read_disk(&self) -> Result<DiskLog, CanonicalError> {
        let mut master_problem = None;
        match fs::read(&self.master_path) {
            Ok(bytes) => match parse_log(&bytes, &self.master_path) {
                Ok(records) => {
                    return Ok(DiskLog{records, source: LoadSource::Master,
                                      master_corrupt: false});
                },
                Err(e) => {
                    warn!("{}; trying backup {:?}", e.message, self.backup_path);
                    master_problem = Some(e.message);
                },
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => {
                let message = format!("Could not read {:?}: {:?}", self.master_path, e);
                warn!("{}; trying backup {:?}", message, self.backup_path);
                master_problem = Some(message);
            },
        }
        let master_corrupt = master_problem.is_some();

        match fs::read(&self.backup_path) {
            Ok(bytes) => match parse_log(&bytes, &self.backup_path) {
                Ok(records) => {
                    warn!("Recovered {} records from backup {:?}",
                          records.len(), self.backup_path);
                    Ok(DiskLog{records, source: LoadSource::Backup, master_corrupt})
                },
                Err(e) => Err(data_loss_error(
                    format!("{}; backup is unusable too: {}",
                            master_problem.unwrap_or_else(
                                || format!("{:?} is missing", self.master_path)),
                            e.message).as_str())),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => match master_problem {
                Some(problem) => Err(data_loss_error(
                    format!("{}; no backup at {:?}", problem, self.backup_path).as_str())),
                None => Ok(DiskLog{records: Vec::new(), source: LoadSource::Empty,
                                   master_corrupt: false}),
            },
            Err(e) => Err(data_loss_error(
                format!("Could not read backup {:?}: {:?}", self.backup_path, e).as_str())),
        }
    }

    // The snapshot document and its (single) entry.
    fn read_snapshot(&self) -> Result<Option<(Value, ShotRecord)>, CanonicalError> {
        let bytes = match fs::read(&self.latest_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(internal_error(
                    format!("Could not read {:?}: {:?}", self.latest_path, e).as_str()));
            }
        };
        let document: Value = serde_json::from_slice(&bytes).map_err(|e| {
            data_loss_error(format!("Could not parse {:?}: {}", self.latest_path, e).as_str())
        })?;
        let entry = match &document {
            Value::Array(entries) if entries.len() == 1 => entries[0].clone(),
            Value::Object(_) => document.clone(),
            _ => {
                return Err(data_loss_error(
                    format!("{:?} is neither an entry nor a one-entry array",
                            self.latest_path).as_str()));
            }
        };
        Ok(Some((document, ShotRecord::from_value(entry)?)))
    }
}

// Exclusive advisory lock, released when dropped.
struct StoreLock {
    _flock: Flock<File>,
}

impl StoreLock {
    fn acquire(path: &Path, wait: Duration) -> Result<Self, CanonicalError> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(1);
        loop {
            let file = OpenOptions::new().create(true).truncate(false).write(true)
                .open(path).map_err(|e| {
                    internal_error(format!("Could not open lock file {:?}: {:?}",
                                           path, e).as_str())
                })?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => return Ok(StoreLock{_flock: flock}),
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {},
                Err((_, errno)) => {
                    return Err(internal_error(
                        format!("Could not lock {:?}: {}", path, errno).as_str()));
                },
            }
            let elapsed = start.elapsed();
            if elapsed >= wait {
                return Err(aborted_error(
                    format!("Timed out after {:?} waiting for lock {:?}",
                            wait, path).as_str()));
            }
            thread::sleep(delay.min(wait - elapsed));
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }
}

fn parse_log(bytes: &[u8], origin: &Path) -> Result<Vec<ShotRecord>, CanonicalError> {
    let document: Value = serde_json::from_slice(bytes).map_err(|e| {
        data_loss_error(format!("Could not parse {:?}: {}", origin, e).as_str())
    })?;
    let entries = match document {
        Value::Array(entries) => entries,
        _ => {
            return Err(data_loss_error(
                format!("{:?} is not a JSON array of entries", origin).as_str()));
        }
    };
    entries.into_iter().enumerate()
        .map(|(index, entry)| {
            ShotRecord::from_value(entry).map_err(|e| {
                data_loss_error(
                    format!("{:?} entry {}: {}", origin, index, e.message).as_str())
            })
        })
        .collect()
}

// The disk entry with `incoming`'s extra attempts, if the disk entry is a
// success that `incoming` would downgrade.
fn keep_disk_success(on_disk: &ShotRecord, incoming: &ShotRecord) -> Option<ShotRecord> {
    let mut kept = on_disk.analysis().ok()?;
    let offered = incoming.analysis().ok()?;
    if kept.solve_status != SolveStatus::Success || offered.solve_status == SolveStatus::Success {
        return None;
    }
    for attempt in offered.attempts {
        if !kept.attempts.contains(&attempt) {
            kept.attempts.push(attempt);
        }
    }
    kept.last_pass = kept.last_pass.max(offered.last_pass);
    let mut merged = on_disk.clone();
    merged.apply_analysis(&kept);
    Some(merged)
}

fn warn_duplicates(records: &[ShotRecord]) {
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(record.file_name()) {
            warn!("Duplicate entry for {}; only the first is updated",
                  record.file_name());
        }
    }
}

// Four-space indentation, no trailing newline.
fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(
        &mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer).map_err(|e| {
        internal_error(format!("Could not serialize log: {}", e).as_str())
    })?;
    Ok(buf)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), CanonicalError> {
    let mut file = File::create(path).map_err(|e| {
        internal_error(format!("Could not create {:?}: {:?}", path, e).as_str())
    })?;
    file.write_all(bytes).and_then(|_| file.sync_all()).map_err(|e| {
        internal_error(format!("Could not write {:?}: {:?}", path, e).as_str())
    })
}

fn rename(from: &Path, to: &Path) -> Result<(), CanonicalError> {
    fs::rename(from, to).map_err(|e| {
        internal_error(format!("Could not rename {:?} to {:?}: {:?}", from, to, e).as_str())
    })
}

// "dir/name.json" + ".bak" -> "dir/name.json.bak"
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use canonical_error::CanonicalErrorCode;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::shot_record::{Analysis, SolveAttempt, SolveStatus};
    use crate::solver_trait::{SkyCoord, SolveResult};
    use super::*;

    // As written by the capture logger (Python json.dump, indent=4).
    const LEGACY_LOG: &str = r#"[
    {
        "version": "1.3.2",
        "session_id": "20250301_m42",
        "objective": "M42",
        "equipment": {
            "telescope": "R200SS",
            "camera": "Generic Camera"
        },
        "record": {
            "meta": {
                "timestamp_jst": "2025-03-01T21:00:00.000+09:00",
                "exposure_actual_sec": 30.012
            },
            "file": {
                "name": "IMG_0001.DNG",
                "path": "/home/pi/Pictures",
                "size_mb": 24.0
            },
            "exif": {
                "iso": 1600,
                "shutter_sec": 6.25e-05,
                "fnumber": 4.50
            },
            "mount": {
                "ra_deg": 83.82,
                "dec_deg": -5.39,
                "side_of_pier": "West"
            },
            "analysis": {
                "solve_status": "pending",
                "solved_coords": null,
                "quality": {
                    "hfr": null,
                    "satellite_detected": false
                },
                "tags": [],
                "note": "結露"
            }
        },
        "custom_extension": {}
    },
    {
        "version": "1.3.2",
        "session_id": "20250301_m42",
        "record": {
            "file": {
                "name": "IMG_0002.DNG"
            },
            "mount": {
                "ra_deg": null,
                "dec_deg": null
            },
            "analysis": {
                "solve_status": "pending"
            }
        }
    }
]"#;

    fn store_config() -> StoreConfig {
        StoreConfig{lock_wait_secs: 0.2, ..Default::default()}
    }

    fn session_with(master: &str) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shutter_log.json"), master).unwrap();
        dir
    }

    fn solved(record: &ShotRecord) -> ShotRecord {
        let mut record = record.clone();
        let mut analysis = record.analysis().unwrap();
        let result = SolveResult{
            center: SkyCoord{ra: 83.63, dec: -5.45},
            orientation: Some(91.5),
            confidence: 55.0,
            matched_stars: Some(42),
            duration: Duration::from_millis(4_500),
            hit_miss: String::new(),
        };
        analysis.mark_solved(1, "Pass 1".to_string(), &result, "2.1.0",
                             "2025-03-01T21:01:00".to_string());
        record.apply_analysis(&analysis);
        record
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_round_trip_is_byte_exact() {
        let dir = session_with(LEGACY_LOG);
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        assert_eq!(store.load_source(), LoadSource::Master);
        assert_eq!(store.records().len(), 2);

        let unchanged = store.find("IMG_0001.DNG").unwrap().clone();
        let report = store.commit(&unchanged).unwrap();
        assert!(report.replaced);
        assert!(report.mirror_error.is_none());

        assert_eq!(read(store.master_path()), LEGACY_LOG);
        // The previous master became the backup.
        assert_eq!(read(&dir.path().join("shutter_log.json.bak")), LEGACY_LOG);
        store.load().unwrap();
        assert_eq!(store.find("IMG_0001.DNG").unwrap(), &unchanged);

        // Exponent-form numbers keep their text but still read as floats.
        let shutter = unchanged.lookup(&["record", "exif", "shutter_sec"]).unwrap();
        assert_eq!(shutter.as_f64(), Some(6.25e-5));
        let mirror = read(store.mirror_path());
        assert!(mirror.lines().nth(1).unwrap().contains(",1600,6.25e-05,"));
    }

    #[test]
    fn test_commit_is_idempotent() {
        let dir = session_with(LEGACY_LOG);
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        let record = solved(store.find("IMG_0002.DNG").unwrap());
        store.commit(&record).unwrap();
        let once = read(store.master_path());
        store.commit(&record).unwrap();
        assert_eq!(read(store.master_path()), once);

        store.load().unwrap();
        assert_eq!(store.records().len(), 2);
        assert_eq!(store.records().iter()
                   .filter(|r| r.file_name() == "IMG_0002.DNG").count(), 1);
        // Order is preserved.
        assert_eq!(store.latest().unwrap().file_name(), "IMG_0002.DNG");
        assert_eq!(store.latest().unwrap().analysis().unwrap().solve_status,
                   SolveStatus::Success);
    }

    #[test]
    fn test_crash_before_rename_keeps_master() {
        let dir = session_with(LEGACY_LOG);
        let store = SessionStore::open(dir.path(), &store_config()).unwrap();
        let record = solved(store.find("IMG_0001.DNG").unwrap());
        let mut records = store.records().to_vec();
        records[0] = record.clone();

        // Scratch file written and synced, then the process dies.
        let scratch = store.write_temp(&records).unwrap();
        assert!(scratch.exists());
        assert_eq!(read(store.master_path()), LEGACY_LOG);

        let mut reopened = SessionStore::open(dir.path(), &store_config()).unwrap();
        assert_eq!(reopened.load_source(), LoadSource::Master);
        assert_eq!(reopened.find("IMG_0001.DNG").unwrap().analysis().unwrap().solve_status,
                   SolveStatus::Pending);

        // The stale scratch file does not get in the way of the next commit.
        reopened.commit(&record).unwrap();
        assert!(!scratch.exists());
        reopened.load().unwrap();
        assert_eq!(reopened.find("IMG_0001.DNG").unwrap(), &record);
    }

    #[test]
    fn test_recovery_from_backup() {
        let dir = session_with(LEGACY_LOG);
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        let record = solved(store.find("IMG_0001.DNG").unwrap());
        store.commit(&record).unwrap();

        // Torn master; the backup holds the pre-commit log.
        let torn = "[\n    {\n        \"version\": ";
        fs::write(store.master_path(), torn).unwrap();
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        assert_eq!(store.load_source(), LoadSource::Backup);
        assert_eq!(store.records().len(), 2);
        // Loading does not touch the files.
        assert_eq!(read(store.master_path()), torn);

        // Committing moves the corrupt master aside and keeps the backup.
        store.commit(&record).unwrap();
        assert_eq!(read(&dir.path().join("shutter_log.json.bak")), LEGACY_LOG);
        let aside: Vec<_> = fs::read_dir(dir.path()).unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.starts_with("shutter_log.json.corrupt."))
            .collect();
        assert_eq!(aside.len(), 1);
        assert_eq!(read(&dir.path().join(&aside[0])), torn);

        store.load().unwrap();
        assert_eq!(store.load_source(), LoadSource::Master);
        assert_eq!(store.find("IMG_0001.DNG").unwrap(), &record);
    }

    #[test]
    fn test_missing_master_uses_backup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shutter_log.json.bak"), LEGACY_LOG).unwrap();
        let store = SessionStore::open(dir.path(), &store_config()).unwrap();
        assert_eq!(store.load_source(), LoadSource::Backup);
        assert_eq!(store.records().len(), 2);
    }

    #[test]
    fn test_unrecoverable_store() {
        let dir = session_with("{not json");
        fs::write(dir.path().join("shutter_log.json.bak"), "[1, 2]").unwrap();
        let err = SessionStore::open(dir.path(), &store_config()).err().unwrap();
        assert!(matches!(err.code, CanonicalErrorCode::DataLoss));

        // Corrupt master and no backup.
        let dir = session_with("{not json");
        let err = SessionStore::open(dir.path(), &store_config()).err().unwrap();
        assert!(matches!(err.code, CanonicalErrorCode::DataLoss));
        assert_eq!(read(&dir.path().join("shutter_log.json")), "{not json");
    }

    #[test]
    fn test_commit_on_unrecoverable_store_leaves_disk_untouched() {
        let dir = session_with(LEGACY_LOG);
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        let record = solved(store.find("IMG_0001.DNG").unwrap());
        fs::write(store.master_path(), "garbage").unwrap();

        let err = store.commit(&record).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::DataLoss));
        assert_eq!(read(store.master_path()), "garbage");
        assert!(!dir.path().join("shutter_log.csv").exists());
    }

    #[test]
    fn test_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        assert_eq!(store.load_source(), LoadSource::Empty);
        assert!(store.latest().is_none());
        let err = store.find("IMG_0001.DNG").unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::NotFound));

        let legacy = SessionStore::open(session_with(LEGACY_LOG).path(),
                                        &store_config()).unwrap();
        let record = legacy.find("IMG_0001.DNG").unwrap().clone();
        let report = store.append(&record).unwrap();
        assert!(!report.replaced);
        assert!(!dir.path().join("shutter_log.json.bak").exists());
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn test_append_rejects_duplicate() {
        let dir = session_with(LEGACY_LOG);
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        let record = store.find("IMG_0001.DNG").unwrap().clone();
        let err = store.append(&record).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::AlreadyExists));
        assert_eq!(read(store.master_path()), LEGACY_LOG);
    }

    #[test]
    fn test_lock_timeout() {
        let dir = session_with(LEGACY_LOG);
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        let record = solved(store.find("IMG_0001.DNG").unwrap());

        let held = StoreLock::acquire(&dir.path().join("shutter_log.json.lock"),
                                      Duration::from_secs(1)).unwrap();
        let start = Instant::now();
        let err = store.commit(&record).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::Aborted));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(read(store.master_path()), LEGACY_LOG);

        drop(held);
        store.commit(&record).unwrap();
    }

    #[test]
    fn test_commit_merges_concurrent_append() {
        let dir = session_with(LEGACY_LOG);
        let mut batch = SessionStore::open(dir.path(), &store_config()).unwrap();
        let mut capture = SessionStore::open(dir.path(), &store_config()).unwrap();

        let mut entry = batch.find("IMG_0002.DNG").unwrap().clone().into_value();
        entry["record"]["file"]["name"] = json!("IMG_0003.DNG");
        capture.append(&ShotRecord::from_value(entry).unwrap()).unwrap();

        // `batch` loaded before the append; its commit must not drop it.
        let record = solved(batch.find("IMG_0001.DNG").unwrap());
        batch.commit(&record).unwrap();
        assert_eq!(batch.records().len(), 3);
        batch.load().unwrap();
        assert!(batch.find("IMG_0003.DNG").is_ok());
    }

    #[test]
    fn test_stale_failure_does_not_replace_success() {
        let dir = session_with(LEGACY_LOG);
        let mut batch = SessionStore::open(dir.path(), &store_config()).unwrap();
        let mut targeted = SessionStore::open(dir.path(), &store_config()).unwrap();
        let success = solved(targeted.find("IMG_0001.DNG").unwrap());
        assert!(!targeted.commit(&success).unwrap().kept_success);

        // `batch` loaded before the solution landed and fails the record.
        let mut stale = batch.find("IMG_0001.DNG").unwrap().clone();
        let mut analysis = stale.analysis().unwrap();
        assert_eq!(analysis.solve_status, SolveStatus::Pending);
        analysis.attempts.push(SolveAttempt{
            pass: 3,
            label: "Pass 3".to_string(),
            outcome: "no_match".to_string(),
            confidence: None,
            duration_sec: 2.0,
            timestamp: "2025-03-01T21:03:00".to_string(),
        });
        analysis.mark_failed(Some(3), None, "2.1.0", "2025-03-01T21:03:00".to_string());
        stale.apply_analysis(&analysis);
        let report = batch.commit(&stale).unwrap();
        assert!(report.kept_success);

        batch.load().unwrap();
        let kept = batch.find("IMG_0001.DNG").unwrap().analysis().unwrap();
        let solution = success.analysis().unwrap();
        assert_eq!(kept.solve_status, SolveStatus::Success);
        assert_eq!(kept.solve_path.as_deref(), Some("Pass 1"));
        assert_eq!(kept.solved_coords, solution.solved_coords);
        assert_eq!(kept.last_pass, Some(3));
        assert_eq!(kept.attempts.len(), solution.attempts.len() + 1);
        assert_eq!(kept.attempts.last().unwrap().outcome, "no_match");
    }

    #[test]
    fn test_mirror_follows_master() {
        let dir = session_with(LEGACY_LOG);
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        let record = solved(store.find("IMG_0001.DNG").unwrap());
        store.commit(&record).unwrap();

        let mirror = read(store.mirror_path());
        assert_eq!(mirror, csv_mirror::render(store.records()));
        let rows: Vec<&str> = mirror.lines().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[1].contains(",success,Pass 1,2.1.0,55.0,83.63,-5.45,91.5,42,4.5"));
        assert!(rows[2].ends_with(",pending,,,,,,,,"));

        // Rebuild from scratch.
        fs::remove_file(store.mirror_path()).unwrap();
        store.rebuild_mirror().unwrap();
        assert_eq!(read(store.mirror_path()), mirror);
    }

    #[test]
    fn test_mirror_failure_is_not_fatal() {
        let dir = session_with(LEGACY_LOG);
        let config = StoreConfig{mirror_file: "no_such_dir/log.csv".to_string(),
                                 ..store_config()};
        let mut store = SessionStore::open(dir.path(), &config).unwrap();
        let record = solved(store.find("IMG_0001.DNG").unwrap());
        let report = store.commit(&record).unwrap();
        assert!(report.mirror_error.is_some());
        store.load().unwrap();
        assert_eq!(store.find("IMG_0001.DNG").unwrap(), &record);
    }

    #[test]
    fn test_duplicates_address_first_occurrence() {
        let mut doc: Value = serde_json::from_str(LEGACY_LOG).unwrap();
        let mut dup = doc[0].clone();
        dup["objective"] = json!("duplicate");
        doc.as_array_mut().unwrap().push(dup);
        let dir = session_with(&serde_json::to_string(&doc).unwrap());

        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        assert_eq!(store.find("IMG_0001.DNG").unwrap().lookup(&["objective"]),
                   Some(&json!("M42")));
        let record = solved(store.find("IMG_0001.DNG").unwrap());
        store.commit(&record).unwrap();
        assert_eq!(store.records().len(), 3);
        assert_eq!(store.records()[2].lookup(&["objective"]), Some(&json!("duplicate")));
        assert_eq!(store.records()[2].analysis().unwrap().solve_status,
                   SolveStatus::Pending);
    }

    #[test]
    fn test_sync_latest_snapshot() {
        let dir = session_with(LEGACY_LOG);
        let store = SessionStore::open(dir.path(), &store_config()).unwrap();
        let record = solved(store.find("IMG_0001.DNG").unwrap());
        let snapshot_path = dir.path().join("latest_shot.json");

        // No snapshot.
        assert!(!store.sync_latest_snapshot(&record).unwrap());
        assert_eq!(store.latest_snapshot_file_name(), None);

        // One-element array form; shape preserved.
        let doc: Value = serde_json::from_str(LEGACY_LOG).unwrap();
        fs::write(&snapshot_path,
                  serde_json::to_string(&json!([doc[0].clone()])).unwrap()).unwrap();
        assert_eq!(store.latest_snapshot_file_name().as_deref(), Some("IMG_0001.DNG"));
        assert!(store.sync_latest_snapshot(&record).unwrap());
        let updated: Value = serde_json::from_str(&read(&snapshot_path)).unwrap();
        assert!(updated.is_array());
        assert_eq!(updated[0]["record"]["analysis"]["solve_status"], json!("success"));
        assert_eq!(updated[0]["record"]["analysis"]["note"], json!("結露"));

        // Bare object form describing the next shot: left alone.
        let next = serde_json::to_string(&doc[1]).unwrap();
        fs::write(&snapshot_path, &next).unwrap();
        assert!(!store.sync_latest_snapshot(&record).unwrap());
        assert_eq!(read(&snapshot_path), next);
    }

    #[test]
    fn test_analysis_survives_reload() {
        let dir = session_with(LEGACY_LOG);
        let mut store = SessionStore::open(dir.path(), &store_config()).unwrap();
        let mut record = store.find("IMG_0002.DNG").unwrap().clone();
        let mut analysis = Analysis::default();
        analysis.mark_failed(Some(3), None, "2.1.0", "2025-03-01T21:02:00".to_string());
        record.apply_analysis(&analysis);
        store.commit(&record).unwrap();

        let reopened = SessionStore::open(dir.path(), &store_config()).unwrap();
        let reread = reopened.find("IMG_0002.DNG").unwrap().analysis().unwrap();
        assert_eq!(reread.solve_status, SolveStatus::Failed);
        assert_eq!(reread.last_pass, Some(3));
        assert_eq!(reread.solved_coords, None);
    }

}  // mod tests.
