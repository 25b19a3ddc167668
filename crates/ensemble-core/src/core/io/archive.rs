//! Append-only named-entry containers backed by the `tar` format.
//!
//! Appending never rewrites existing entries. A later entry with the same name as an earlier
//! one shadows it on unpack, so the newest checkpoint of a file always wins.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tar::{Archive, Builder, EntryType, Header, HeaderMode};
use thiserror::Error;
use tracing::{debug, info, warn};

const BLOCK: u64 = 512;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive '{path}' could not be read: {source}", path = path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Archive '{path}' could not be written: {source}", path = path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to unpack '{path}' into '{dest}': {source}", path = path.display(), dest = dest.display())]
    Unpack {
        path: PathBuf,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Extracts every entry of `archive` into `dest`, creating `dest` if needed.
pub fn unpack(archive: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    let unpack_err = |source| ArchiveError::Unpack {
        path: archive.to_path_buf(),
        dest: dest.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dest).map_err(unpack_err)?;
    let file = File::open(archive).map_err(unpack_err)?;
    let bytes = file.metadata().map_err(unpack_err)?.len();

    let mut tar = Archive::new(file);
    tar.set_overwrite(true);
    tar.set_preserve_mtime(true);
    tar.unpack(dest).map_err(unpack_err)?;

    debug!("Unpacked '{}' into '{}'", archive.display(), dest.display());
    Ok(bytes)
}

/// Names of all entries in `archive`, in storage order (duplicates included).
pub fn list_entries(archive: &Path) -> Result<Vec<String>, ArchiveError> {
    let read_err = |source| ArchiveError::Read {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(read_err)?;
    let mut tar = Archive::new(file);
    let mut names = Vec::new();
    for entry in tar.entries().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path().map_err(read_err)?;
        names.push(path.to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Whether `archive` holds an entry whose name ends with `suffix`, i.e. whether the unit
/// it belongs to finished cleanly.
pub fn has_entry_with_suffix(archive: &Path, suffix: &str) -> Result<bool, ArchiveError> {
    Ok(list_entries(archive)?
        .iter()
        .any(|name| name.ends_with(suffix)))
}

pub fn log_transfer(name: &str, bytes: u64, elapsed: Duration) {
    let megabytes = bytes as f64 / 1024.0 / 1024.0;
    let seconds = elapsed.as_secs_f64();
    let speed = if seconds > 0.0 {
        megabytes / seconds
    } else {
        f64::INFINITY
    };
    info!(
        "Backup-timing for {}, {:5.3}s, MB: {:6.2} Speed: {:.2} MB/s",
        name, seconds, megabytes, speed
    );
}

/// An open archive positioned for appending.
pub struct ArchiveAppender {
    path: PathBuf,
    builder: Builder<File>,
    appended: u64,
}

impl ArchiveAppender {
    /// Opens `path` for appending, creating it when absent. An existing archive is cut back to
    /// the end of its last complete entry, which drops both the end-of-archive marker and any
    /// half-written entry left by an interrupted append.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let write_err = |source| ArchiveError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(write_err)?;

        let len = file.metadata().map_err(write_err)?.len();
        let end = complete_prefix_len(&mut file, len).map_err(|source| ArchiveError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if end + 2 * BLOCK < len {
            warn!(
                "Discarding {} trailing byte(s) of incomplete data in '{}'",
                len - end,
                path.display()
            );
        }

        file.set_len(end).map_err(write_err)?;
        file.seek(SeekFrom::Start(end)).map_err(write_err)?;

        let mut builder = Builder::new(file);
        builder.mode(HeaderMode::Complete);
        builder.follow_symlinks(true);

        Ok(Self {
            path: path.to_path_buf(),
            builder,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends the file at `source` under the entry name `name`.
    pub fn append_file(&mut self, source: &Path, name: &str) -> Result<u64, ArchiveError> {
        let size = std::fs::metadata(source)
            .map_err(|source| ArchiveError::Read {
                path: self.path.clone(),
                source,
            })?
            .len();
        self.builder
            .append_path_with_name(source, name)
            .map_err(|source| ArchiveError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.appended += size;
        Ok(size)
    }

    /// Writes the end-of-archive marker and syncs the file. Returns the payload bytes appended.
    pub fn finish(self) -> Result<u64, ArchiveError> {
        let write_err = |source| ArchiveError::Write {
            path: self.path.clone(),
            source,
        };
        let file = self.builder.into_inner().map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        Ok(self.appended)
    }
}

/// Walks the header chain and returns the offset just past the last entry whose header and data
/// are fully present. Long-name and extended-attribute headers only count once the entry they
/// describe is complete.
fn complete_prefix_len(file: &mut File, len: u64) -> io::Result<u64> {
    let mut complete = 0;
    let mut pos = 0;
    let mut block = [0u8; BLOCK as usize];

    while pos + BLOCK <= len {
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut block)?;

        if block.iter().all(|&b| b == 0) || !checksum_ok(&block) {
            break;
        }

        let header = Header::from_byte_slice(&block);
        let size = header.entry_size()?;
        let next = pos + BLOCK + size.div_ceil(BLOCK) * BLOCK;
        if next > len {
            break;
        }

        match header.entry_type() {
            EntryType::GNULongName | EntryType::GNULongLink | EntryType::XHeader => {}
            _ => complete = next,
        }
        pos = next;
    }

    Ok(complete)
}

fn checksum_ok(block: &[u8; BLOCK as usize]) -> bool {
    let header = Header::from_byte_slice(block);
    let Ok(stored) = header.cksum() else {
        return false;
    };
    let computed: u32 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { u32::from(b' ') } else { u32::from(b) })
        .sum();
    stored == computed
}
