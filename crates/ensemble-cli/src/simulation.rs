//! The compute step that drives an external MD executable through the numbered inputs of a
//! simulation package.

use cadee_ensemble::core::io::sink::{ColumnType, SinkSchema};
use cadee_ensemble::core::models::results::{ResultTuple, ResultValue};
use cadee_ensemble::core::models::unit::{UnitLabel, WorkUnit};
use cadee_ensemble::engine::step::{ComputeStep, StepError, StepFactory};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const INPUT_EXTENSION: &str = "inp";
const ZSTD_LEVEL: i32 = 9;

/// Columns of the record a finished [`QdynRun`] yields.
pub fn summary_schema() -> SinkSchema {
    use ColumnType::*;
    SinkSchema::new(
        "runs",
        &[
            ("time", Integer),
            ("mutant", Text),
            ("replik", Integer),
            ("name", Text),
            ("steps", Integer),
            ("steps_run", Integer),
            ("wall_seconds", Real),
        ],
    )
}

/// Resolves `name` through `PATH` unless it already contains a path separator.
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

/// Numbered inputs (`NNN_<anything>.inp`) in `dir`, in numeric order.
pub fn numbered_inputs(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut inputs: Vec<(u32, String)> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| input_number(&name).map(|n| (n, name)))
        .collect();
    inputs.sort();
    Ok(inputs.into_iter().map(|(_, name)| name).collect())
}

/// The number `NNN` of an input named `NNN_<anything>.inp`.
pub fn input_number(name: &str) -> Option<u32> {
    let path = Path::new(name);
    if path.extension()? != INPUT_EXTENSION {
        return None;
    }
    let (prefix, _) = name.split_once('_')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

#[derive(Debug, Clone)]
pub struct QdynFactory {
    program: PathBuf,
    file_name: Option<String>,
    marker_suffix: String,
}

impl QdynFactory {
    pub fn new(executable: &str, marker_suffix: impl Into<String>) -> Result<Self, StepError> {
        let program = resolve_executable(executable).ok_or_else(|| {
            StepError::Prepare(format!("executable '{}' not found", executable))
        })?;
        info!("Using simulation executable {}", program.display());
        let file_name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(Self {
            program,
            file_name,
            marker_suffix: marker_suffix.into(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl StepFactory for QdynFactory {
    fn executable(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    fn prepare(
        &mut self,
        scratch: &Path,
        unit: &WorkUnit,
    ) -> Result<Box<dyn ComputeStep>, StepError> {
        let inputs = numbered_inputs(scratch)?;
        if inputs.is_empty() {
            return Err(StepError::Prepare(format!(
                "{} contains no numbered .{} inputs",
                unit.name(),
                INPUT_EXTENSION
            )));
        }
        let mut run = QdynRun {
            program: self.program.clone(),
            scratch: scratch.to_path_buf(),
            marker_suffix: self.marker_suffix.clone(),
            label: unit.label(),
            name: unit.name(),
            inputs,
            next: 0,
            ran: 0,
            started: Instant::now(),
        };
        run.skip_completed();
        if run.next > 0 {
            info!(
                "Resuming {} at input {} of {}",
                run.name,
                run.next + 1,
                run.inputs.len()
            );
        }
        Ok(Box::new(run))
    }
}

/// One package: runs every input that has no completion marker yet, in order.
pub struct QdynRun {
    program: PathBuf,
    scratch: PathBuf,
    marker_suffix: String,
    label: UnitLabel,
    name: String,
    inputs: Vec<String>,
    next: usize,
    ran: usize,
    started: Instant,
}

impl QdynRun {
    fn stem(input: &str) -> &str {
        input
            .strip_suffix(INPUT_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .unwrap_or(input)
    }

    fn marker_for(&self, input: &str) -> PathBuf {
        self.scratch
            .join(format!("{}{}", Self::stem(input), self.marker_suffix))
    }

    fn skip_completed(&mut self) {
        while let Some(input) = self.inputs.get(self.next) {
            if !self.marker_for(input).is_file() {
                break;
            }
            debug!("{} already finished, skipping", input);
            self.next += 1;
        }
    }

    fn run_input(&self, input: &str) -> Result<(), StepError> {
        let log = self.scratch.join(format!("{}.log", Self::stem(input)));
        let stdout = File::create(&log)?;
        let stderr = stdout.try_clone()?;

        debug!("{} {}", self.program.display(), input);
        let start = Instant::now();
        let status = Command::new(&self.program)
            .arg(input)
            .current_dir(&self.scratch)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()?;
        if !status.success() {
            return Err(StepError::Failed(format!(
                "{} exited with {} on {}",
                self.program.display(),
                status,
                input
            )));
        }
        info!(
            "{} finished {} in {:.1}s",
            self.name,
            input,
            start.elapsed().as_secs_f64()
        );

        let marker = self.marker_for(input);
        if let Err(e) = compress(&log, &marker) {
            let _ = std::fs::remove_file(&marker);
            return Err(e.into());
        }
        std::fs::remove_file(&log)?;
        Ok(())
    }
}

fn compress(source: &Path, dest: &Path) -> std::io::Result<()> {
    let reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(dest)?);
    zstd::stream::copy_encode(reader, &mut writer, ZSTD_LEVEL)?;
    writer.flush()
}

impl ComputeStep for QdynRun {
    fn advance(&mut self) -> Result<(), StepError> {
        let Some(input) = self.inputs.get(self.next).cloned() else {
            return Ok(());
        };
        self.run_input(&input)?;
        self.ran += 1;
        self.next += 1;
        self.skip_completed();
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.next >= self.inputs.len()
    }

    fn results(&self) -> Option<ResultTuple> {
        if !self.is_finished() {
            warn!("{} has no result before its last input ran", self.name);
            return None;
        }
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64);
        Some(ResultTuple::new(vec![
            ResultValue::from(time),
            ResultValue::from(self.label.mutant.as_str()),
            ResultValue::from(i64::from(self.label.replica)),
            ResultValue::from(self.name.as_str()),
            ResultValue::from(self.inputs.len() as i64),
            ResultValue::from(self.ran as i64),
            ResultValue::from(self.started.elapsed().as_secs_f64()),
        ]))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::io::Read;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{TempDir, tempdir};

    fn fake_md(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake_qdyn");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn scratch_with(inputs: &[&str]) -> TempDir {
        let dir = tempdir().unwrap();
        for name in inputs {
            fs::write(dir.path().join(name), "steps 10\n").unwrap();
        }
        dir
    }

    fn unit() -> WorkUnit {
        WorkUnit::new("/packs/wt_2.tar")
    }

    fn decompress(path: &Path) -> String {
        let mut out = String::new();
        zstd::stream::read::Decoder::new(File::open(path).unwrap())
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn numbered_inputs_are_sorted_numerically() {
        let dir = scratch_with(&["10_fep.inp", "2_eq.inp", "001_relax.inp", "readme.inp", "3_x.txt"]);
        assert_eq!(
            numbered_inputs(dir.path()).unwrap(),
            vec!["001_relax.inp", "2_eq.inp", "10_fep.inp"]
        );
    }

    #[test]
    #[serial]
    fn resolve_executable_accepts_explicit_paths_only_when_present() {
        let bin = tempdir().unwrap();
        let exe = fake_md(bin.path(), "exit 0");
        assert_eq!(resolve_executable(exe.to_str().unwrap()), Some(exe.clone()));
        assert_eq!(
            resolve_executable(bin.path().join("missing").to_str().unwrap()),
            None
        );
        assert!(QdynFactory::new("/definitely/not/here/qdyn5", ".log.zst").is_err());
    }

    #[test]
    #[serial]
    fn runs_every_input_and_leaves_compressed_markers() {
        let bin = tempdir().unwrap();
        let exe = fake_md(bin.path(), "echo \"ran $1\"");
        let scratch = scratch_with(&["1_eq.inp", "2_fep.inp"]);

        let mut factory = QdynFactory::new(exe.to_str().unwrap(), ".log.zst").unwrap();
        assert_eq!(factory.executable(), Some("fake_qdyn"));
        let mut step = factory.prepare(scratch.path(), &unit()).unwrap();
        assert!(step.results().is_none());

        while !step.is_finished() {
            step.advance().unwrap();
        }

        for stem in ["1_eq", "2_fep"] {
            let marker = scratch.path().join(format!("{stem}.log.zst"));
            assert!(marker.is_file());
            assert_eq!(decompress(&marker), format!("ran {stem}.inp\n"));
            assert!(!scratch.path().join(format!("{stem}.log")).exists());
        }

        let row = step.results().unwrap();
        assert_eq!(row.arity(), summary_schema().arity());
        assert_eq!(row.values()[1], ResultValue::from("wt"));
        assert_eq!(row.values()[2], ResultValue::from(2i64));
        assert_eq!(row.values()[3], ResultValue::from("wt_2"));
        assert_eq!(row.values()[4], ResultValue::from(2i64));
        assert_eq!(row.values()[5], ResultValue::from(2i64));
    }

    #[test]
    #[serial]
    fn resumed_packages_skip_inputs_with_markers() {
        let bin = tempdir().unwrap();
        let exe = fake_md(bin.path(), "echo \"ran $1\"");
        let scratch = scratch_with(&["1_eq.inp", "2_fep.inp", "3_fep.inp"]);
        fs::write(scratch.path().join("1_eq.log.zst"), b"old").unwrap();

        let mut factory = QdynFactory::new(exe.to_str().unwrap(), ".log.zst").unwrap();
        let mut step = factory.prepare(scratch.path(), &unit()).unwrap();
        let mut advances = 0;
        while !step.is_finished() {
            step.advance().unwrap();
            advances += 1;
        }
        assert_eq!(advances, 2);
        assert_eq!(fs::read(scratch.path().join("1_eq.log.zst")).unwrap(), b"old");

        let row = step.results().unwrap();
        assert_eq!(row.values()[4], ResultValue::from(3i64));
        assert_eq!(row.values()[5], ResultValue::from(2i64));
    }

    #[test]
    #[serial]
    fn a_failing_input_fails_the_step_without_a_marker() {
        let bin = tempdir().unwrap();
        let exe = fake_md(bin.path(), "echo boom; exit 3");
        let scratch = scratch_with(&["1_eq.inp"]);

        let mut factory = QdynFactory::new(exe.to_str().unwrap(), ".log.zst").unwrap();
        let mut step = factory.prepare(scratch.path(), &unit()).unwrap();
        assert!(matches!(step.advance(), Err(StepError::Failed(_))));
        assert!(!step.is_finished());
        assert!(!scratch.path().join("1_eq.log.zst").exists());
        assert!(scratch.path().join("1_eq.log").is_file());
    }

    #[test]
    #[serial]
    fn packages_without_inputs_cannot_be_prepared() {
        let bin = tempdir().unwrap();
        let exe = fake_md(bin.path(), "exit 0");
        let scratch = scratch_with(&["notes.txt"]);
        let mut factory = QdynFactory::new(exe.to_str().unwrap(), ".log.zst").unwrap();
        assert!(matches!(
            factory.prepare(scratch.path(), &unit()),
            Err(StepError::Prepare(_))
        ));
    }
}
