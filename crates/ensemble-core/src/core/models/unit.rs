use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One independently schedulable job: an input archive and, optionally, a separate
/// archive that receives its checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
}

impl WorkUnit {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// The archive checkpoints are appended to. Without an explicit output the input
    /// archive is extended in place.
    pub fn archive(&self) -> &Path {
        self.output.as_deref().unwrap_or(&self.input)
    }

    /// Whether checkpoints land in the archive the unit was unpacked from, in which case the
    /// unpacked files are already durably stored.
    pub fn resumes_in_place(&self) -> bool {
        self.archive() == self.input.as_path()
    }

    pub fn name(&self) -> String {
        self.input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input.display().to_string())
    }

    pub fn label(&self) -> UnitLabel {
        UnitLabel::from_name(&self.name())
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.output {
            Some(output) if output != &self.input => {
                write!(f, "{} -> {}", self.input.display(), output.display())
            }
            _ => write!(f, "{}", self.input.display()),
        }
    }
}

/// Simulation packages are named `<mutant>_<replica>.tar`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLabel {
    pub mutant: String,
    pub replica: u32,
}

impl UnitLabel {
    pub fn from_name(name: &str) -> Self {
        let mutant = name.split('_').next().unwrap_or_default().to_string();

        match Self::replica_of(name) {
            Some(replica) => Self { mutant, replica },
            None => {
                warn!("No replica info found in '{}'. Setting to 0.", name);
                Self { mutant, replica: 0 }
            }
        }
    }

    /// The replica number encoded after the first underscore, if any.
    pub fn replica_of(name: &str) -> Option<u32> {
        let (_, rest) = name.split_once('_')?;
        rest.split(['.', '_']).next()?.parse().ok()
    }
}

/// The payload of an `INPUTS` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assignment {
    Unit(WorkUnit),
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_falls_back_to_input_when_no_output_is_given() {
        let unit = WorkUnit::new("/packs/wt_0.tar");
        assert_eq!(unit.archive(), Path::new("/packs/wt_0.tar"));
        assert!(unit.resumes_in_place());
    }

    #[test]
    fn explicit_output_equal_to_input_resumes_in_place() {
        let unit = WorkUnit::new("/packs/wt_0.tar").with_output("/packs/wt_0.tar");
        assert!(unit.resumes_in_place());

        let split = WorkUnit::new("/packs/wt_0.tar").with_output("/out/wt_0.tar");
        assert!(!split.resumes_in_place());
        assert_eq!(split.archive(), Path::new("/out/wt_0.tar"));
    }

    #[test]
    fn label_parses_mutant_and_replica_from_file_name() {
        let unit = WorkUnit::new("/packs/A123G_7.tar");
        assert_eq!(unit.name(), "A123G_7");
        assert_eq!(
            unit.label(),
            UnitLabel {
                mutant: "A123G".to_string(),
                replica: 7
            }
        );
    }

    #[test]
    fn label_without_replica_defaults_to_zero() {
        let label = UnitLabel::from_name("wildtype");
        assert_eq!(label.mutant, "wildtype");
        assert_eq!(label.replica, 0);
    }

    #[test]
    fn shutdown_assignment_serializes_as_literal_sentinel() {
        let json = serde_json::to_string(&Assignment::Shutdown).unwrap();
        assert_eq!(json, "\"SHUTDOWN\"");
    }
}
