//! Report files on the local filesystem.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{render, Report, ReportError, ReportFormat, ReportStore};
use crate::catalog::TestType;

/// Stores reports as `<root>/<format>/<test_type>_test_<timestamp>.<ext>`.
#[derive(Debug, Clone)]
pub struct FsReportStore {
    root: PathBuf,
}

impl FsReportStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn format_dir(&self, format: ReportFormat) -> PathBuf {
        self.root.join(format.extension())
    }

    fn prefix(test_type: TestType) -> String {
        format!("{}_test_", test_type.as_str())
    }

    /// First free file name for this report.
    fn target_path(&self, report: &Report, format: ReportFormat) -> PathBuf {
        let dir = self.format_dir(format);
        let stem = format!(
            "{}{}",
            Self::prefix(report.test_type),
            report.generated_at.format("%Y%m%d_%H%M%S_%3f")
        );

        let mut path = dir.join(format!("{}.{}", stem, format.extension()));
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("{}_{}.{}", stem, n, format.extension()));
            n += 1;
        }
        path
    }
}

impl ReportStore for FsReportStore {
    fn write(&self, report: &Report, format: ReportFormat) -> Result<PathBuf, ReportError> {
        let bytes = render(report, format)?;

        fs::create_dir_all(self.format_dir(format))?;
        let path = self.target_path(report, format);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::info!("Wrote {} report: {}", report.test_type, path.display());
        Ok(path)
    }

    fn latest(&self, test_type: TestType, format: ReportFormat) -> Result<PathBuf, ReportError> {
        let not_found = || ReportError::NotFound { test_type, format };

        let entries = match fs::read_dir(self.format_dir(format)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        let prefix = Self::prefix(test_type);
        let suffix = format!(".{}", format.extension());

        // Timestamped names sort chronologically.
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(&prefix) && name.ends_with(&suffix))
            .max()
            .map(|name| self.format_dir(format).join(name))
            .ok_or_else(not_found)
    }
}
