//! Database file naming.
//!
//! All engine files live flat in the database directory:
//!
//! | name            | contents                                |
//! |-----------------|-----------------------------------------|
//! | `CURRENT`       | name of the live manifest, newline-ended |
//! | `LOCK`          | advisory lock file                       |
//! | `LOG`, `LOG.old`| info log and its rotated predecessor     |
//! | `MANIFEST-<n>`  | version-edit log                         |
//! | `<n>.log`       | write-ahead log                          |
//! | `<n>.ldb`       | table file (`<n>.sst` read as legacy)    |
//! | `<n>.dbtmp`     | scratch for atomic CURRENT updates       |

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Log,
    Lock,
    Table,
    Descriptor,
    Current,
    Temp,
    InfoLog,
}

pub fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.ldb"))
}

/// Legacy table name probed when the `.ldb` file is absent.
pub fn sst_table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.sst"))
}

pub fn descriptor_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

pub fn info_log_file_name(dir: &Path) -> PathBuf {
    dir.join("LOG")
}

pub fn old_info_log_file_name(dir: &Path) -> PathBuf {
    dir.join("LOG.old")
}

/// Parses a directory entry name. Returns the owning file number (0 for
/// singleton files) and kind, or `None` for foreign files.
pub fn parse_file_name(name: &str) -> Option<(u64, FileKind)> {
    match name {
        "CURRENT" => return Some((0, FileKind::Current)),
        "LOCK" => return Some((0, FileKind::Lock)),
        "LOG" | "LOG.old" => return Some((0, FileKind::InfoLog)),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = parse_decimal(rest)?;
        return Some((number, FileKind::Descriptor));
    }
    let dot = name.find('.')?;
    let number = parse_decimal(&name[..dot])?;
    let kind = match &name[dot + 1..] {
        "log" => FileKind::Log,
        "ldb" | "sst" => FileKind::Table,
        "dbtmp" => FileKind::Temp,
        _ => return None,
    };
    Some((number, kind))
}

fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Points `CURRENT` at `MANIFEST-<number>` via a temp file and atomic
/// rename, then fsyncs the directory so the pointer survives a crash.
pub fn set_current_file(dir: &Path, descriptor_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{descriptor_number:06}\n");
    let tmp = temp_file_name(dir, descriptor_number);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, current_file_name(dir)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    sync_dir(dir)?;
    Ok(())
}

/// Reads the manifest name out of `CURRENT`.
pub fn read_current_file(dir: &Path) -> Result<String> {
    let contents = fs::read_to_string(current_file_name(dir))?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() || contents == name {
        return Err(crate::corruption!("CURRENT file malformed"));
    }
    Ok(name.to_string())
}

/// fsyncs a directory, making renames within it durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_names() {
        assert_eq!(parse_file_name("CURRENT"), Some((0, FileKind::Current)));
        assert_eq!(parse_file_name("LOCK"), Some((0, FileKind::Lock)));
        assert_eq!(parse_file_name("LOG"), Some((0, FileKind::InfoLog)));
        assert_eq!(parse_file_name("LOG.old"), Some((0, FileKind::InfoLog)));
        assert_eq!(
            parse_file_name("MANIFEST-000004"),
            Some((4, FileKind::Descriptor))
        );
        assert_eq!(parse_file_name("000123.log"), Some((123, FileKind::Log)));
        assert_eq!(parse_file_name("000042.ldb"), Some((42, FileKind::Table)));
        assert_eq!(parse_file_name("000042.sst"), Some((42, FileKind::Table)));
        assert_eq!(parse_file_name("000009.dbtmp"), Some((9, FileKind::Temp)));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_file_name(""), None);
        assert_eq!(parse_file_name("foo"), None);
        assert_eq!(parse_file_name("foo.log"), None);
        assert_eq!(parse_file_name("123.unknown"), None);
        assert_eq!(parse_file_name("MANIFEST-abc"), None);
        assert_eq!(parse_file_name(".log"), None);
    }

    #[test]
    fn test_name_layout() {
        let dir = Path::new("/db");
        assert_eq!(log_file_name(dir, 7), Path::new("/db/000007.log"));
        assert_eq!(table_file_name(dir, 7), Path::new("/db/000007.ldb"));
        assert_eq!(
            descriptor_file_name(dir, 7),
            Path::new("/db/MANIFEST-000007")
        );
    }

    #[test]
    fn test_set_and_read_current() {
        let dir = tempfile::TempDir::new().unwrap();
        set_current_file(dir.path(), 5).unwrap();
        assert_eq!(read_current_file(dir.path()).unwrap(), "MANIFEST-000005");
        // No temp litter left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["CURRENT".to_string()]);
    }
}
