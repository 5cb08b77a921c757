//! Archive Writer: assembles tar/gzip streams from file trees and files.
//!
//! Not a general-purpose archiver (per the Non-goals) — just enough to
//! build the single gzipped tar stream each backup component and the final
//! combined archive need. File errors abort the archive; entries preserve
//! relative paths under their declared roots; symbolic links are followed
//! as regular files (the default behavior of [`tar::Builder::append_path`]).

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::Result;

/// One file to place at an explicit path inside the archive.
pub struct ArchiveEntry {
    /// Path the file will have inside the archive.
    pub logical_path: PathBuf,
    /// Where to read the file's bytes from on disk.
    pub source_path: PathBuf,
}

/// Build a gzipped tar archive at `output_path` from a set of directory
/// roots (archived recursively under their own base name) and a set of
/// explicit `(logicalPath, sourcePath)` entries.
///
/// Returns the number of bytes written to `output_path`.
pub fn write_archive(
    output_path: &Path,
    roots: &[PathBuf],
    entries: &[ArchiveEntry],
) -> Result<u64> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(output_path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    for root in roots {
        let Ok(meta) = std::fs::metadata(root) else {
            continue;
        };
        let base = root
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("root"));
        if meta.is_dir() {
            builder.append_dir_all(&base, root)?;
        } else {
            builder.append_path_with_name(root, &base)?;
        }
    }

    for entry in entries {
        builder.append_path_with_name(&entry.source_path, &entry.logical_path)?;
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    drop(writer);

    Ok(std::fs::metadata(output_path)?.len())
}

/// Extract a gzipped tar archive into `destination`, creating it if needed.
pub fn extract_archive(archive_path: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    let file = File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(destination)?;
    Ok(())
}
