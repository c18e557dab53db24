//! Discovery, identity and eligibility helpers used by the index controller.

use crate::extractor::ExtractorRegistry;
use crate::IngestError;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Format of `--prevrun-dt`, interpreted in local time.
pub const PREVRUN_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Every file under `target` that has a registered extractor, sorted.
/// Symlinks are not followed. A missing target is fatal.
pub fn discover_documents(
    target: &Path,
    registry: &ExtractorRegistry,
) -> Result<Vec<PathBuf>, IngestError> {
    let root = fs::canonicalize(target).map_err(|error| {
        IngestError::Fatal(format!("cannot read target {}: {error}", target.display()))
    })?;

    if root.is_file() {
        if registry.supports(&root) {
            return Ok(vec![root]);
        }
        warn!(path = %root.display(), "target has no registered extractor");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%error, "skipping unreadable directory entry");
                continue;
            }
        };

        if entry.file_type().is_file() && registry.supports(entry.path()) {
            files.push(entry.into_path());
        }
    }

    files.sort_unstable();
    Ok(files)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Stable id of the document at `path`.
pub fn document_id(path: &Path) -> String {
    sha256_hex(path.to_string_lossy().as_bytes())
}

/// Content fingerprint of cleaned text.
pub fn fingerprint(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

pub fn file_title(path: &Path) -> Result<String, IngestError> {
    path.file_stem()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))
}

/// Last-modified time truncated to whole seconds.
pub fn modified_at(path: &Path) -> Result<DateTime<Utc>, IngestError> {
    let modified: DateTime<Utc> = fs::metadata(path)?.modified()?.into();
    Ok(DateTime::from_timestamp(modified.timestamp(), 0).unwrap_or(modified))
}

/// Whether a document modified at `modified` passes the `modified_after` cutoff.
pub fn is_eligible(modified: DateTime<Utc>, modified_after: Option<DateTime<Utc>>) -> bool {
    modified_after.map_or(true, |cutoff| modified.timestamp() > cutoff.timestamp())
}

/// Parses a `YYYY-MM-DD HH:MM:SS` local timestamp.
pub fn parse_prevrun_dt(value: &str) -> Result<DateTime<Utc>, IngestError> {
    let invalid = || IngestError::InvalidTimestamp {
        value: value.to_string(),
    };
    let naive = NaiveDateTime::parse_from_str(value.trim(), PREVRUN_FORMAT).map_err(|_| invalid())?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_and_skips_unsupported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("a.txt"), "alpha")?;
        fs::write(nested.join("b.md"), "# Beta")?;
        fs::write(nested.join("c.bin"), [0u8, 1, 2])?;

        let registry = ExtractorRegistry::with_defaults()?;
        let files = discover_documents(dir.path(), &registry)?;
        let names: Vec<_> = files
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .collect();
        assert_eq!(names, vec!["a.txt", "b.md"]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn discovery_ignores_symlinks() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let outside = tempdir()?;
        fs::write(outside.path().join("hidden.txt"), "outside")?;
        fs::write(dir.path().join("a.txt"), "alpha")?;
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link"))?;
        std::os::unix::fs::symlink(dir.path().join("a.txt"), dir.path().join("alias.txt"))?;

        let files = discover_documents(dir.path(), &ExtractorRegistry::with_defaults()?)?;
        assert_eq!(files.len(), 1);
        Ok(())
    }

    #[test]
    fn single_file_target_is_one_element() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("only.txt");
        fs::write(&path, "content")?;

        let files = discover_documents(&path, &ExtractorRegistry::with_defaults()?)?;
        assert_eq!(files.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_target_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let result = discover_documents(&dir.path().join("nope"), &ExtractorRegistry::with_defaults()?);
        assert!(result.is_err_and(|error| error.is_fatal()));
        Ok(())
    }

    #[test]
    fn identity_is_stable() {
        let path = Path::new("/docs/a.txt");
        assert_eq!(document_id(path), document_id(path));
        assert_ne!(document_id(path), document_id(Path::new("/docs/b.txt")));
        assert_eq!(fingerprint("same text"), fingerprint("same text"));
        assert_eq!(fingerprint("").len(), 64);
    }

    #[test]
    fn eligibility_is_strictly_after_in_whole_seconds() -> Result<(), Box<dyn std::error::Error>> {
        let cutoff = parse_prevrun_dt("2024-03-01 12:00:00")?;
        assert!(is_eligible(cutoff + Duration::seconds(1), Some(cutoff)));
        assert!(!is_eligible(cutoff, Some(cutoff)));
        assert!(!is_eligible(cutoff + Duration::milliseconds(500), Some(cutoff)));
        assert!(!is_eligible(cutoff - Duration::days(1), Some(cutoff)));
        assert!(is_eligible(cutoff - Duration::days(1), None));
        Ok(())
    }

    #[test]
    fn malformed_prevrun_is_rejected() {
        let result = parse_prevrun_dt("2024-03-01T12:00");
        assert!(matches!(result, Err(IngestError::InvalidTimestamp { .. })));
    }

    #[test]
    fn modified_at_has_no_subseconds() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        fs::write(&path, "x")?;
        assert_eq!(modified_at(&path)?.timestamp_subsec_nanos(), 0);
        assert_eq!(file_title(&path)?, "a");
        Ok(())
    }
}
