use crate::core::models::unit::UnitLabel;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const ARCHIVE_EXTENSION: &str = "tar";

/// Lists the simulation packages (`*.tar`) in `dir` as sorted absolute paths.
pub fn scan_simpacks(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let dir = std::fs::canonicalize(dir)?;
    let mut packs = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION) {
            packs.push(path);
        }
    }
    packs.sort();
    info!("Found {} simpack(s) in '{}'", packs.len(), dir.display());
    Ok(packs)
}

/// Orders packages so that every mutant's replica 0 comes first, then replica 1, 2 and 3, then
/// everything else. Order within a tier is preserved.
pub fn prioritize(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut tiered: Vec<(u32, PathBuf)> = paths
        .into_iter()
        .map(|path| {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let tier = UnitLabel::replica_of(&stem).map_or(4, |r| r.min(4));
            (tier, path)
        })
        .collect();
    tiered.sort_by_key(|(tier, _)| *tier);
    debug!("Prioritized {} simpack(s)", tiered.len());
    tiered.into_iter().map(|(_, path)| path).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn scan_finds_only_tar_files_sorted() {
        let dir = tempdir().unwrap();
        for name in ["b_1.tar", "a_0.tar", "notes.txt", "c_0.tar.gz"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("d_0.tar")).unwrap();

        let packs = scan_simpacks(dir.path()).unwrap();
        assert_eq!(names(&packs), vec!["a_0.tar", "b_1.tar"]);
        assert!(packs.iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn prioritize_groups_by_replica_tier_stably() {
        let input: Vec<PathBuf> = [
            "x_5.tar", "a_1.tar", "b_0.tar", "c_3.tar", "a_0.tar", "d_2.tar", "e_9.tar", "f_1.tar",
            "wt.tar",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();

        let ordered = prioritize(input);
        assert_eq!(
            names(&ordered),
            vec![
                "b_0.tar", "a_0.tar", "a_1.tar", "f_1.tar", "d_2.tar", "c_3.tar", "x_5.tar",
                "e_9.tar", "wt.tar"
            ]
        );
    }
}
