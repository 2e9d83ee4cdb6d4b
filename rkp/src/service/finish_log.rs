use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

/// Services that exit this many times within [`RESTART_RATE_INTERVAL`]
/// seconds are not restarted again.
pub const MAX_RESTART_RATE: usize = 5;
pub const RESTART_RATE_INTERVAL: i64 = 60;

/// One row of the `finished` file: `timestamp rc signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishEntry {
    pub timestamp: i64,
    pub rc: i32,
    pub signal: i32,
}

impl std::str::FromStr for FinishEntry {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [timestamp, rc, signal] = fields.as_slice() else {
            return Err(anyhow!("expected `timestamp rc signal`, got {line:?}"));
        };
        Ok(FinishEntry {
            timestamp: timestamp.parse().context("invalid timestamp")?,
            rc: rc.parse().context("invalid return code")?,
            signal: signal.parse().context("invalid signal")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartStats {
    pub rate_exceeded: bool,
    pub actual_restarts: usize,
}

/// Append-only exit history written by the supervisor's finish hook.
///
/// Always read from disk: the file is the source of truth across agent
/// restarts.
#[derive(Debug, Clone)]
pub struct FinishLog {
    path: PathBuf,
}

impl FinishLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn in_service_dir(svc_dir: &Path) -> Self {
        Self::new(svc_dir.join("finished"))
    }

    /// All rows, oldest first. A missing file has no rows.
    pub fn entries(&self) -> Result<Vec<FinishEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                l.parse::<FinishEntry>()
                    .with_context(|| format!("Malformed row in {}", self.path.display()))
            })
            .collect()
    }

    /// Restart count and whether the restart rate is exceeded at `now`.
    ///
    /// Only the row [`MAX_RESTART_RATE`] places from the end is inspected:
    /// if it is younger than the interval, so are all the rows after it.
    pub fn restart_stats(&self, now: i64) -> Result<RestartStats> {
        let entries = self.entries()?;
        let rate_exceeded = entries.len() >= MAX_RESTART_RATE
            && entries[entries.len() - MAX_RESTART_RATE].timestamp + RESTART_RATE_INTERVAL > now;
        Ok(RestartStats {
            rate_exceeded,
            actual_restarts: entries.len(),
        })
    }
}
