//! Per-line attachment files.
//!
//! Attachments live under `<base>/<dataset-id>/attachments/<line-id>/
//! <digest>/<file-name>`; the digest subdirectory makes successive versions
//! of one line's attachment distinguishable, which matters when history mode
//! keeps old revisions pointing at old files. File operations are not
//! transactional with the line write — an orphaned directory is reclaimed by
//! the next attachment sync.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Root attachment directory of a dataset.
pub fn dataset_dir(base: &Path, dataset_id: &str) -> PathBuf {
    base.join(dataset_id).join("attachments")
}

/// Attachment directory of one line.
pub fn line_dir(base: &Path, dataset_id: &str, line_id: &str) -> PathBuf {
    dataset_dir(base, dataset_id).join(line_id)
}

/// Removes a line's attachment directory; missing is fine.
pub fn remove_line_dir(base: &Path, dataset_id: &str, line_id: &str) -> io::Result<()> {
    let dir = line_dir(base, dataset_id, line_id);
    match fs::remove_dir_all(&dir) {
        Ok(()) => {
            debug!(dataset = dataset_id, line = line_id, "attachment directory removed");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Stores an uploaded attachment for a line, returning the relative path
/// (`<line-id>/<digest>/<file-name>`) to record in the path field. With
/// history off the line keeps a single attachment version.
pub fn store_attachment(
    base: &Path,
    dataset_id: &str,
    line_id: &str,
    file_name: &str,
    source: &Path,
    keep_versions: bool,
) -> io::Result<String> {
    let dir = line_dir(base, dataset_id, line_id);
    if !keep_versions && dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    let digest = format!("{:x}", crc32fast::hash(&fs::read(source)?));
    let target_dir = dir.join(&digest);
    fs::create_dir_all(&target_dir)?;
    let target = target_dir.join(file_name);
    // rename first, fall back to copy across filesystems
    if fs::rename(source, &target).is_err() {
        fs::copy(source, &target)?;
        fs::remove_file(source)?;
    }
    Ok(format!("{line_id}/{digest}/{file_name}"))
}

/// Lists all attachment files of a dataset as relative paths matching the
/// values stored in the attachment path field.
pub fn ls_attachments(base: &Path, dataset_id: &str) -> io::Result<Vec<String>> {
    let root = dataset_dir(base, dataset_id);
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for line_entry in fs::read_dir(&root)? {
        let line_entry = line_entry?;
        if !line_entry.file_type()?.is_dir() {
            continue;
        }
        let line_id = line_entry.file_name().to_string_lossy().into_owned();
        for digest_entry in fs::read_dir(line_entry.path())? {
            let digest_entry = digest_entry?;
            if !digest_entry.file_type()?.is_dir() {
                continue;
            }
            let digest = digest_entry.file_name().to_string_lossy().into_owned();
            for file_entry in fs::read_dir(digest_entry.path())? {
                let file_entry = file_entry?;
                let name = file_entry.file_name().to_string_lossy().into_owned();
                out.push(format!("{line_id}/{digest}/{name}"));
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_list_remove() {
        let base = TempDir::new().unwrap();
        let upload = base.path().join("upload.pdf");
        fs::write(&upload, b"content").unwrap();

        let rel = store_attachment(base.path(), "ds1", "l1", "doc.pdf", &upload, false).unwrap();
        assert!(rel.starts_with("l1/"));
        assert!(rel.ends_with("/doc.pdf"));
        assert!(!upload.exists());

        let listed = ls_attachments(base.path(), "ds1").unwrap();
        assert_eq!(listed, vec![rel]);

        remove_line_dir(base.path(), "ds1", "l1").unwrap();
        assert!(ls_attachments(base.path(), "ds1").unwrap().is_empty());
        // idempotent
        remove_line_dir(base.path(), "ds1", "l1").unwrap();
    }

    #[test]
    fn test_store_replaces_without_history() {
        let base = TempDir::new().unwrap();
        for content in [b"one".as_ref(), b"two".as_ref()] {
            let upload = base.path().join("upload.bin");
            fs::write(&upload, content).unwrap();
            store_attachment(base.path(), "ds1", "l1", "f.bin", &upload, false).unwrap();
        }
        assert_eq!(ls_attachments(base.path(), "ds1").unwrap().len(), 1);
    }
}
