// src/archive.rs

use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Only `.zip` archives are unpacked after download.
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Extracts `archive` into `into` and deletes the archive.
///
/// Returns the first regular file in archive order, or `None` when the
/// archive held no files. Blocking; call from `spawn_blocking`.
pub fn extract_zip(archive: &Path, into: &Path) -> Result<Option<PathBuf>, ArchiveError> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;

    let mut first_file = None;
    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;
        if !entry.is_file() {
            continue;
        }
        if let Some(relative) = entry.enclosed_name() {
            first_file = Some(into.join(relative));
            break;
        }
    }

    zip.extract(into)?;
    std::fs::remove_file(archive)?;
    Ok(first_file)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Builds an in-memory zip with the given `(name, contents)` entries.
    pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(contents).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn recognises_zip_extension_case_insensitively() {
        assert!(is_archive(Path::new("a/Game.ZIP")));
        assert!(is_archive(Path::new("game.zip")));
        assert!(!is_archive(Path::new("game.gba")));
        assert!(!is_archive(Path::new("zip")));
    }

    #[test]
    fn extracts_and_removes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("Tetris.zip");
        std::fs::write(&archive, zip_bytes(&[("Tetris.gb", b"rom-bytes")])).unwrap();

        let first = extract_zip(&archive, dir.path()).unwrap();

        assert_eq!(first, Some(dir.path().join("Tetris.gb")));
        assert_eq!(std::fs::read(dir.path().join("Tetris.gb")).unwrap(), b"rom-bytes");
        assert!(!archive.exists());
    }

    #[test]
    fn skips_directories_when_picking_first_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[("docs/", b""), ("docs/readme.txt", b"hi")]),
        )
        .unwrap();

        let first = extract_zip(&archive, dir.path()).unwrap();
        assert_eq!(first, Some(dir.path().join("docs").join("readme.txt")));
    }

    #[test]
    fn empty_archive_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.zip");
        std::fs::write(&archive, zip_bytes(&[])).unwrap();

        assert_eq!(extract_zip(&archive, dir.path()).unwrap(), None);
        assert!(!archive.exists());
    }

    #[test]
    fn corrupt_archive_is_an_error_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();

        assert!(extract_zip(&archive, dir.path()).is_err());
        assert!(archive.exists());
    }
}
