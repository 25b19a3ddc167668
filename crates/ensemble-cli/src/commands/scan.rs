use crate::cli::ScanArgs;
use crate::error::Result;
use crate::simulation::input_number;
use cadee_ensemble::core::io::archive::{self, ArchiveError};
use cadee_ensemble::core::io::scan::{prioritize, scan_simpacks};
use cadee_ensemble::engine::config::DEFAULT_MARKER_SUFFIX;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{info, warn};

/// How far one package got, judged from the entries in its archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackStatus {
    pub inputs: usize,
    pub finished: usize,
}

impl PackStatus {
    pub fn is_complete(&self) -> bool {
        self.inputs > 0 && self.finished >= self.inputs
    }
}

pub fn describe_pack(path: &Path, marker_suffix: &str) -> std::result::Result<PackStatus, ArchiveError> {
    let entries = archive::list_entries(path)?;
    let inputs: BTreeSet<&str> = entries
        .iter()
        .filter(|name| input_number(name).is_some())
        .filter_map(|name| name.strip_suffix(".inp"))
        .collect();
    // Later checkpoints repeat entries, so count distinct names only.
    let finished = entries
        .iter()
        .filter_map(|name| name.strip_suffix(marker_suffix))
        .collect::<BTreeSet<_>>()
        .intersection(&inputs)
        .count();
    Ok(PackStatus {
        inputs: inputs.len(),
        finished,
    })
}

pub async fn run(args: ScanArgs) -> Result<()> {
    let marker_suffix = args
        .marker_suffix
        .as_deref()
        .unwrap_or(DEFAULT_MARKER_SUFFIX);
    let packs = prioritize(scan_simpacks(&args.simpack_dir)?);
    info!("Scanning {} package(s) for '{}' markers", packs.len(), marker_suffix);

    let mut complete = 0;
    for (position, pack) in packs.iter().enumerate() {
        let name = pack
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match describe_pack(pack, marker_suffix) {
            Ok(status) => {
                if status.is_complete() {
                    complete += 1;
                }
                let mark = if status.is_complete() { "✓" } else { " " };
                println!(
                    "{:>5}  {} {:>3}/{:<3} {}",
                    position + 1,
                    mark,
                    status.finished,
                    status.inputs,
                    name
                );
            }
            Err(e) => {
                warn!("Could not read {}: {}", pack.display(), e);
                println!("{:>5}  ?   ?/?   {}", position + 1, name);
            }
        }
    }
    println!(
        "{} package(s), {} complete, {} to run.",
        packs.len(),
        complete,
        packs.len() - complete
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadee_ensemble::core::io::archive::ArchiveAppender;
    use std::fs;
    use tempfile::tempdir;

    fn pack(dir: &Path, name: &str, files: &[&str]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut appender = ArchiveAppender::open(&path).unwrap();
        for file in files {
            let source = dir.join(file);
            fs::write(&source, file.as_bytes()).unwrap();
            appender.append_file(&source, file).unwrap();
            fs::remove_file(&source).unwrap();
        }
        appender.finish().unwrap();
        path
    }

    #[test]
    fn counts_distinct_markers_of_numbered_inputs() {
        let dir = tempdir().unwrap();
        let path = pack(
            dir.path(),
            "wt_0.tar",
            &[
                "1_eq.inp",
                "2_fep.inp",
                "topology.top",
                "1_eq.log.zst",
                "1_eq.log.zst",
                "stray.log.zst",
            ],
        );
        let status = describe_pack(&path, ".log.zst").unwrap();
        assert_eq!(
            status,
            PackStatus {
                inputs: 2,
                finished: 1
            }
        );
        assert!(!status.is_complete());
    }

    #[test]
    fn a_pack_with_every_marker_is_complete() {
        let dir = tempdir().unwrap();
        let path = pack(
            dir.path(),
            "wt_1.tar",
            &["1_eq.inp", "1_eq.log.zst"],
        );
        assert!(describe_pack(&path, ".log.zst").unwrap().is_complete());
    }

    #[test]
    fn missing_archives_are_errors() {
        let dir = tempdir().unwrap();
        assert!(describe_pack(&dir.path().join("nope.tar"), ".log.zst").is_err());
    }
}
