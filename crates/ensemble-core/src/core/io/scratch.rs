use crate::core::models::ids::Rank;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable that overrides the scratch root.
pub const SCRATCH_ENV: &str = "CADEE_TMP";

/// Conventional fast local storage, tried in order when no override is set.
pub const SCRATCH_FALLBACKS: [&str; 3] = ["/scratch/", "/tmp/", "/dev/shm"];

/// Picks the base directory for per-rank working directories. A non-empty `override_dir`
/// wins; otherwise the first existing fallback is used, then the platform temp dir.
pub fn resolve_scratch_root(override_dir: Option<&str>) -> PathBuf {
    if let Some(dir) = override_dir.map(str::trim).filter(|d| !d.is_empty()) {
        debug!("Using scratch root '{}' from {}", dir, SCRATCH_ENV);
        return PathBuf::from(dir);
    }

    SCRATCH_FALLBACKS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_dir())
        .unwrap_or_else(std::env::temp_dir)
}

/// Resolves the scratch root from the process environment.
pub fn scratch_root() -> PathBuf {
    resolve_scratch_root(std::env::var(SCRATCH_ENV).ok().as_deref())
}

/// Directory shared by every rank of one fleet run.
pub fn fleet_dir(root: &Path, fleet_id: &str) -> PathBuf {
    root.join("cadee").join(fleet_id)
}

/// Rank-private working directory inside a fleet directory.
pub fn rank_dir(root: &Path, fleet_id: &str, rank: Rank) -> PathBuf {
    fleet_dir(root, fleet_id).join(rank.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_when_non_empty() {
        assert_eq!(
            resolve_scratch_root(Some("/fast/disk")),
            PathBuf::from("/fast/disk")
        );
    }

    #[test]
    fn empty_override_falls_back_to_an_existing_directory() {
        let root = resolve_scratch_root(Some("  "));
        assert!(root.is_dir());
        assert_eq!(root, resolve_scratch_root(None));
    }

    #[test]
    fn rank_dirs_are_namespaced_by_fleet() {
        let root = Path::new("/scratch");
        assert_eq!(
            rank_dir(root, "4242", 3),
            PathBuf::from("/scratch/cadee/4242/3")
        );
        assert_ne!(rank_dir(root, "1", 3), rank_dir(root, "2", 3));
    }
}
