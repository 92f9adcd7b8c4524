//! Per-command output capture and merging.
//!
//! Each command's stdout/stderr is redirected to `<output>.NN`. At the end
//! of the run (including the signal path) the temporaries are merged into
//! `<output>` under `outputNN==…` banners and deleted.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Error, ErrorKind, Result, Write};
use std::path::{Path, PathBuf};

/// Path of command `num`'s temporary output.
pub fn temp_path(base: &Path, num: usize) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(format!(".{num:02}"));
    PathBuf::from(s)
}

/// Validate the output path: create missing parent directories, require
/// write permission, and warn when the file already exists.
pub fn check_output_path(base: &Path) -> Result<()> {
    if base.file_name().is_none() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "output must be a file name, not a directory: {}",
                base.display()
            ),
        ));
    }

    if let Some(parent) = base.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    if base.exists() {
        log::warn!("output file {} already exists", base.display());
    }

    // Probe writability now rather than after the workload has run.
    File::create(base)?;
    Ok(())
}

/// Create (truncating) the temporary output file for command `num`.
pub fn create_temp(base: &Path, num: usize) -> Result<File> {
    File::create(temp_path(base, num))
}

/// Merge the temporaries of commands `0..count` into `base`, one
/// `outputNN==…` banner per section.
pub fn merge_temp_outputs(base: &Path, count: usize) -> Result<()> {
    let merged = File::create(base)?;
    let mut writer = BufWriter::new(merged);

    for num in 0..count {
        let path = temp_path(base, num);
        writeln!(writer, "output{num:02}{}", "=".repeat(78))?;
        match File::open(&path) {
            Ok(file) => {
                let mut reader = BufReader::new(file);
                let mut line = String::new();
                while reader.read_line(&mut line)? > 0 {
                    writer.write_all(line.as_bytes())?;
                    line.clear();
                }
            }
            Err(e) => {
                log::error!("cannot merge {}: {e}", path.display());
            }
        }
    }

    writer.flush()
}

/// Delete the temporaries of commands `0..count`. Best-effort.
pub fn delete_temp_outputs(base: &Path, count: usize) {
    for num in 0..count {
        let path = temp_path(base, num);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != ErrorKind::NotFound
        {
            log::warn!("cannot delete {}: {e}", path.display());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_temp_path_numbering() {
        let base = Path::new("/tmp/run.output");
        assert_eq!(temp_path(base, 0), PathBuf::from("/tmp/run.output.00"));
        assert_eq!(temp_path(base, 13), PathBuf::from("/tmp/run.output.13"));
    }

    #[test]
    fn test_check_output_path_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("deep/nested/run.output");
        check_output_path(&base).unwrap();
        assert!(base.parent().unwrap().is_dir());
        assert!(base.exists());
    }

    #[test]
    fn test_check_output_path_rejects_directories() {
        assert!(check_output_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_merge_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run.output");

        for (num, text) in ["first\n", "second line\nand more\n"].iter().enumerate() {
            let mut f = create_temp(&base, num).unwrap();
            f.write_all(text.as_bytes()).unwrap();
        }

        merge_temp_outputs(&base, 2).unwrap();

        let mut merged = String::new();
        File::open(&base)
            .unwrap()
            .read_to_string(&mut merged)
            .unwrap();

        let lines: Vec<&str> = merged.lines().collect();
        assert!(lines[0].starts_with("output00=="));
        assert_eq!(lines[1], "first");
        assert!(lines[2].starts_with("output01=="));
        assert_eq!(lines[3], "second line");
        assert_eq!(lines[4], "and more");
        assert_eq!(
            merged.matches("output0").count(),
            2,
            "exactly one banner per command"
        );

        delete_temp_outputs(&base, 2);
        assert!(!temp_path(&base, 0).exists());
        assert!(!temp_path(&base, 1).exists());
        assert!(base.exists(), "merged output survives deletion of temps");
    }

    #[test]
    fn test_merge_tolerates_missing_temp() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run.output");
        let mut f = create_temp(&base, 0).unwrap();
        f.write_all(b"only\n").unwrap();

        // Command 1's temp never existed; its banner is still written.
        merge_temp_outputs(&base, 2).unwrap();
        let merged = fs::read_to_string(&base).unwrap();
        assert!(merged.contains("output00"));
        assert!(merged.contains("output01"));
    }
}
