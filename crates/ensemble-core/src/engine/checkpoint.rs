//! Incremental, content-addressed checkpointing of a worker's scratch directory.
//!
//! Each checkpoint appends only the files that changed since the previous one. Change
//! detection first compares modification time and size, and only hashes a file when those
//! differ. Files carrying the completion-marker suffix are always appended after every other
//! file of the same checkpoint, so an archive that holds a marker also holds the data it
//! vouches for.

use crate::core::io::archive::{self, ArchiveAppender, ArchiveError};
use crate::core::io::digest::{ContentDigest, FileStamp, digest_file};
use crate::core::transport::TransportError;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, trace};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to inspect '{path}': {source}", path = path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Could not obtain an I/O ticket: {0}")]
    Ticket(#[from] TransportError),
}

/// Last checkpointed state of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    pub stamp: FileStamp,
    pub digest: ContentDigest,
}

/// A file that must be appended by the next commit.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub name: String,
    pub path: PathBuf,
    pub record: FileRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReport {
    pub files: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Admission control around shared-storage I/O.
pub trait IoGate {
    fn acquire(&mut self) -> Result<(), TransportError>;
    fn release(&mut self) -> Result<(), TransportError>;
}

/// A held ticket. Dropping it gives the ticket back, whichever way the I/O ended.
pub struct TicketGuard<'a> {
    gate: &'a mut dyn IoGate,
}

impl<'a> TicketGuard<'a> {
    pub fn acquire(gate: &'a mut dyn IoGate) -> Result<Self, TransportError> {
        gate.acquire()?;
        trace!("I/O ticket acquired");
        Ok(Self { gate })
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.gate.release() {
            error!("Failed to return I/O ticket: {}", e);
        } else {
            trace!("I/O ticket returned");
        }
    }
}

pub struct CheckpointEngine {
    scratch: PathBuf,
    archive: PathBuf,
    executable: Option<String>,
    marker_suffix: String,
    interval: Duration,
    records: HashMap<String, FileRecord>,
    last_checkpoint: Instant,
}

impl CheckpointEngine {
    pub fn new(
        scratch: impl Into<PathBuf>,
        archive: impl Into<PathBuf>,
        marker_suffix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            scratch: scratch.into(),
            archive: archive.into(),
            executable: None,
            marker_suffix: marker_suffix.into(),
            interval,
            records: HashMap::new(),
            last_checkpoint: Instant::now(),
        }
    }

    /// Excludes the named file from every checkpoint.
    pub fn with_executable(mut self, executable: Option<&str>) -> Self {
        self.executable = executable.map(|e| {
            Path::new(e)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| e.to_string())
        });
        self
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn records(&self) -> &HashMap<String, FileRecord> {
        &self.records
    }

    pub fn is_due(&self) -> bool {
        self.last_checkpoint.elapsed() >= self.interval
    }

    /// Records the current on-disk state as already checkpointed, without writing anything.
    /// Used when the archive being appended to is the one the files were unpacked from.
    pub fn seed_from_disk(&mut self) -> Result<usize, CheckpointError> {
        let mut seeded = 0;
        for (name, path) in self.list_files()? {
            let Some(stamp) = self.stamp(&path)? else {
                continue;
            };
            let digest = digest_file(&path).map_err(|source| CheckpointError::Scan {
                path: path.clone(),
                source,
            })?;
            self.records.insert(name, FileRecord { stamp, digest });
            seeded += 1;
        }
        debug!("Seeded {} file record(s) from '{}'", seeded, self.scratch.display());
        Ok(seeded)
    }

    /// Computes the files to append, non-markers first, markers last, each group in discovery
    /// order.
    pub fn plan(&self) -> Result<Vec<PlannedFile>, CheckpointError> {
        let mut regular = Vec::new();
        let mut markers = Vec::new();

        for (name, path) in self.list_files()? {
            let Some(stamp) = self.stamp(&path)? else {
                continue;
            };
            let known = self.records.get(&name);
            if known.is_some_and(|r| r.stamp == stamp) {
                continue;
            }

            let digest = match digest_file(&path) {
                Ok(d) => d,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => return Err(CheckpointError::Scan { path, source }),
            };
            if known.is_some_and(|r| r.digest == digest) {
                debug!("Rehashed {} but hash didn't change", name);
                continue;
            }

            let planned = PlannedFile {
                record: FileRecord { stamp, digest },
                name,
                path,
            };
            if planned.name.ends_with(&self.marker_suffix) {
                markers.push(planned);
            } else {
                regular.push(planned);
            }
        }

        regular.extend(markers);
        Ok(regular)
    }

    /// Appends `plan` to the archive under a ticket. Each file's record is updated as soon as
    /// it has been written, so a failure part-way leaves the unwritten files dirty.
    pub fn commit(
        &mut self,
        plan: Vec<PlannedFile>,
        gate: &mut dyn IoGate,
    ) -> Result<CheckpointReport, CheckpointError> {
        let _ticket = TicketGuard::acquire(gate)?;
        let start = Instant::now();

        let mut appender = ArchiveAppender::open(&self.archive)?;
        let mut bytes = 0;
        for file in &plan {
            bytes += appender.append_file(&file.path, &file.name)?;
            self.records.insert(file.name.clone(), file.record);
        }
        appender.finish()?;

        let elapsed = start.elapsed();
        self.last_checkpoint = Instant::now();
        archive::log_transfer(&self.archive.display().to_string(), bytes, elapsed);
        Ok(CheckpointReport {
            files: plan.len(),
            bytes,
            elapsed,
        })
    }

    /// Plans and commits. Returns `None`, without touching the gate, when nothing changed.
    pub fn checkpoint(
        &mut self,
        gate: &mut dyn IoGate,
    ) -> Result<Option<CheckpointReport>, CheckpointError> {
        let plan = self.plan()?;
        if plan.is_empty() {
            self.last_checkpoint = Instant::now();
            trace!("Nothing changed since the last checkpoint");
            return Ok(None);
        }
        self.commit(plan, gate).map(Some)
    }

    fn list_files(&self) -> Result<Vec<(String, PathBuf)>, CheckpointError> {
        let scan_err = |source| CheckpointError::Scan {
            path: self.scratch.clone(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.scratch).map_err(scan_err)? {
            let entry = entry.map_err(scan_err)?;
            if !entry.file_type().map_err(scan_err)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.executable.as_deref() == Some(name.as_str()) {
                continue;
            }
            files.push((name, entry.path()));
        }
        files.sort();
        Ok(files)
    }

    /// `None` when the file vanished since it was listed.
    fn stamp(&self, path: &Path) -> Result<Option<FileStamp>, CheckpointError> {
        match FileStamp::of(path) {
            Ok(stamp) => Ok(Some(stamp)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CheckpointError::Scan {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::archive::list_entries;
    use std::fs;
    use std::time::SystemTime;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct CountingGate {
        acquired: usize,
        released: usize,
        refuse: bool,
    }

    impl IoGate for CountingGate {
        fn acquire(&mut self) -> Result<(), TransportError> {
            if self.refuse {
                return Err(TransportError::Aborted);
            }
            assert_eq!(self.acquired, self.released, "ticket acquired twice");
            self.acquired += 1;
            Ok(())
        }
        fn release(&mut self) -> Result<(), TransportError> {
            self.released += 1;
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        scratch: PathBuf,
        archive: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();
        let archive = dir.path().join("wt_0.tar");
        Fixture {
            _dir: dir,
            scratch,
            archive,
        }
    }

    fn engine(f: &Fixture) -> CheckpointEngine {
        CheckpointEngine::new(&f.scratch, &f.archive, ".log.zst", Duration::from_secs(600))
    }

    fn write(f: &Fixture, name: &str, content: &str) {
        fs::write(f.scratch.join(name), content).unwrap();
    }

    #[test]
    fn second_checkpoint_without_changes_is_empty() {
        let f = fixture();
        write(&f, "a.inp", "a");
        write(&f, "b.re", "b");
        let mut engine = engine(&f);
        let mut gate = CountingGate::default();

        let report = engine.checkpoint(&mut gate).unwrap().unwrap();
        assert_eq!(report.files, 2);
        assert!(engine.plan().unwrap().is_empty());
        assert!(engine.checkpoint(&mut gate).unwrap().is_none());
        assert_eq!((gate.acquired, gate.released), (1, 1));
    }

    #[test]
    fn markers_are_written_after_everything_else() {
        let f = fixture();
        write(&f, "0_eq.log.zst", "m0");
        write(&f, "1_fep.re", "r1");
        write(&f, "0_eq.re", "r0");
        write(&f, "1_fep.log.zst", "m1");
        let mut engine = engine(&f);

        let plan = engine.plan().unwrap();
        let names: Vec<_> = plan.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["0_eq.re", "1_fep.re", "0_eq.log.zst", "1_fep.log.zst"]
        );

        engine.commit(plan, &mut CountingGate::default()).unwrap();
        assert_eq!(
            list_entries(&f.archive).unwrap(),
            vec!["0_eq.re", "1_fep.re", "0_eq.log.zst", "1_fep.log.zst"]
        );
    }

    #[test]
    fn executable_is_never_checkpointed() {
        let f = fixture();
        write(&f, "qdyn5", "binary");
        write(&f, "a.inp", "a");
        let engine = engine(&f).with_executable(Some("/usr/local/bin/qdyn5"));

        let plan = engine.plan().unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "a.inp");
    }

    #[test]
    fn only_changed_files_are_appended() {
        let f = fixture();
        write(&f, "a.inp", "a");
        write(&f, "b.re", "b1");
        let mut engine = engine(&f);
        let mut gate = CountingGate::default();
        engine.checkpoint(&mut gate).unwrap();

        write(&f, "b.re", "b2 longer");
        write(&f, "c.en", "c");
        let report = engine.checkpoint(&mut gate).unwrap().unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(
            list_entries(&f.archive).unwrap(),
            vec!["a.inp", "b.re", "b.re", "c.en"]
        );
    }

    #[test]
    fn touched_but_unchanged_file_is_skipped() {
        let f = fixture();
        write(&f, "a.inp", "same");
        let mut engine = engine(&f);
        engine.checkpoint(&mut CountingGate::default()).unwrap();

        let file = fs::File::options()
            .write(true)
            .open(f.scratch.join("a.inp"))
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        assert!(engine.plan().unwrap().is_empty());
    }

    #[test]
    fn seeding_prevents_reappending_unpacked_files() {
        let f = fixture();
        write(&f, "a.inp", "a");
        write(&f, "top.prm", "t");
        let mut engine = engine(&f);

        assert_eq!(engine.seed_from_disk().unwrap(), 2);
        assert!(engine.plan().unwrap().is_empty());

        write(&f, "new.re", "n");
        let plan = engine.plan().unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "new.re");
    }

    #[test]
    fn failed_append_releases_ticket_and_leaves_records_untouched() {
        let f = fixture();
        write(&f, "a.inp", "a");
        fs::create_dir(&f.archive).unwrap();
        let mut engine = engine(&f);
        let mut gate = CountingGate::default();

        let err = engine.checkpoint(&mut gate).unwrap_err();
        assert!(matches!(err, CheckpointError::Archive(_)));
        assert_eq!((gate.acquired, gate.released), (1, 1));
        assert!(engine.records().is_empty());
        assert_eq!(engine.plan().unwrap().len(), 1);
    }

    #[test]
    fn refused_ticket_writes_nothing() {
        let f = fixture();
        write(&f, "a.inp", "a");
        let mut engine = engine(&f);
        let mut gate = CountingGate {
            refuse: true,
            ..Default::default()
        };

        let err = engine.checkpoint(&mut gate).unwrap_err();
        assert!(matches!(err, CheckpointError::Ticket(TransportError::Aborted)));
        assert_eq!(gate.released, 0);
        assert!(!f.archive.exists());
    }

    #[test]
    fn checkpoint_is_due_after_interval() {
        let f = fixture();
        let engine =
            CheckpointEngine::new(&f.scratch, &f.archive, ".log.zst", Duration::ZERO);
        assert!(engine.is_due());
        let engine = CheckpointEngine::new(
            &f.scratch,
            &f.archive,
            ".log.zst",
            Duration::from_secs(3600),
        );
        assert!(!engine.is_due());
    }
}
