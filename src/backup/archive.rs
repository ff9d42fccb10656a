// Single-entry ZIP archives holding one SQL dump.
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::{AppError, Result};

/// Compresses `source_file` into a new ZIP archive at `archive_dest_path`.
///
/// The archive holds exactly one entry, named after the source file.
pub fn create_zip_archive(source_file: &Path, archive_dest_path: &Path) -> Result<PathBuf> {
    if !source_file.is_file() {
        return Err(AppError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("source for archival is not a file: {}", source_file.display()),
        )));
    }
    if let Some(parent) = archive_dest_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let entry_name = source_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dump.sql".to_string());

    debug!(
        "Creating zip archive from {} to {}",
        source_file.display(),
        archive_dest_path.display()
    );

    let archive_file = File::create(archive_dest_path)?;
    let mut writer = ZipWriter::new(archive_file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(entry_name, options)?;

    let mut source = File::open(source_file)?;
    std::io::copy(&mut source, &mut writer)?;
    writer.finish()?;

    Ok(archive_dest_path.to_path_buf())
}

/// Returns the contents of the first `.sql` entry of an in-memory archive.
pub fn extract_sql_entry(archive_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))
        .map_err(|e| AppError::ArchiveCorrupt(format!("cannot open ZIP archive: {}", e)))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| AppError::ArchiveCorrupt(format!("cannot read entry {}: {}", index, e)))?;
        if !entry.name().ends_with(".sql") {
            continue;
        }
        let mut sql = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut sql)
            .map_err(|e| AppError::ArchiveCorrupt(format!("cannot inflate {}: {}", entry.name(), e)))?;
        return Ok(sql);
    }

    Err(AppError::ArchiveCorrupt(
        "no SQL file found in the archive".to_string(),
    ))
}
