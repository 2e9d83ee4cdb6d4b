use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Number of finish log rows already reported, persisted as the `reported`
/// file next to the log.
///
/// A missing file means nothing was ever reported, which is distinct from a
/// stored `0`.
#[derive(Debug, Clone)]
pub struct ReportedCursor {
    path: PathBuf,
}

impl ReportedCursor {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn in_service_dir(svc_dir: &Path) -> Self {
        Self::new(svc_dir.join("reported"))
    }

    pub fn read(&self) -> Result<Option<usize>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let count = content
                    .trim()
                    .parse()
                    .with_context(|| format!("Corrupt cursor in {}", self.path.display()))?;
                Ok(Some(count))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    /// Replace the stored count. Readers see either the old or the new value.
    pub fn write(&self, count: usize) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix(".reported")
            .tempfile_in(dir)
            .with_context(|| format!("Failed to create temporary cursor in {}", dir.display()))?;
        write!(tmp, "{count}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to persist {}", self.path.display()))?;
        Ok(())
    }
}
