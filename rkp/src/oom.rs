use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

/// Reads the memory cgroup failure counters of the container.
///
/// Inside the container's namespace the memory cgroup is masked, so the
/// counters sit directly at the root of the mounted hierarchy.
#[derive(Debug, Clone)]
pub struct OomProbe {
    root: PathBuf,
}

impl Default for OomProbe {
    fn default() -> Self {
        Self::new("/sys/fs/cgroup/memory")
    }
}

impl OomProbe {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Best effort: any failure to read the counters means "not OOM".
    pub fn is_oom(&self) -> bool {
        match self.read_failcnts() {
            Ok((mem, memsw)) => mem != 0 || memsw != 0,
            Err(e) => {
                info!("Cannot access memory failcnt under {}: {e}", self.root.display());
                false
            }
        }
    }

    fn read_failcnts(&self) -> anyhow::Result<(u64, u64)> {
        let mem = read_counter(&self.root.join("memory.failcnt"))?;
        let memsw = read_counter(&self.root.join("memory.memsw.failcnt"))?;
        Ok((mem, memsw))
    }
}

fn read_counter(path: &Path) -> anyhow::Result<u64> {
    let content = fs::read_to_string(path)?;
    Ok(content.trim().parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_with(mem: Option<&str>, memsw: Option<&str>) -> (tempfile::TempDir, OomProbe) {
        let dir = tempfile::tempdir().unwrap();
        if let Some(v) = mem {
            fs::write(dir.path().join("memory.failcnt"), v).unwrap();
        }
        if let Some(v) = memsw {
            fs::write(dir.path().join("memory.memsw.failcnt"), v).unwrap();
        }
        let probe = OomProbe::new(dir.path());
        (dir, probe)
    }

    #[test]
    fn test_no_failures() {
        let (_dir, probe) = probe_with(Some("0\n"), Some("0\n"));
        assert!(!probe.is_oom());
    }

    #[test]
    fn test_memsw_failures() {
        let (_dir, probe) = probe_with(Some("0\n"), Some("3\n"));
        assert!(probe.is_oom());
    }

    #[test]
    fn test_unreadable_counters_are_not_oom() {
        let (_dir, probe) = probe_with(Some("12\n"), None);
        assert!(!probe.is_oom());
        let (_dir, probe) = probe_with(Some("garbage"), Some("0"));
        assert!(!probe.is_oom());
    }
}
