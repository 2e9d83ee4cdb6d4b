use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Number of service output lines attached to an exit record.
pub const LOG_TAIL_LINES: usize = 10;

/// Outcome of the most recent exit of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub hostname: String,
    pub rc: i32,
    pub sig: i32,
    pub output: String,
    pub oom: bool,
    pub time: i64,
}

/// Content of the container level `exitinfo` file.
///
/// When the app stops without any service having exited (killed, or no
/// service recorded), only `service`, `killed` and `oom` are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub service: Option<String>,
    pub killed: bool,
    pub oom: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

impl ExitInfo {
    pub fn new(
        service: Option<String>,
        last_exit: Option<&ExitRecord>,
        killed: bool,
        oom: bool,
    ) -> Self {
        ExitInfo {
            service,
            killed,
            oom,
            hostname: last_exit.map(|e| e.hostname.clone()),
            rc: last_exit.map(|e| e.rc),
            sig: last_exit.map(|e| e.sig),
            output: last_exit.map(|e| e.output.clone()),
            time: last_exit.map(|e| e.time),
        }
    }
}

/// Last `n` lines of `path`, newline terminated. A missing file yields an
/// empty string since services may exit before writing any output.
///
/// Service output is arbitrary bytes; invalid UTF-8 is replaced rather than
/// rejected.
pub fn tail_lines(path: &Path, n: usize) -> Result<String> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
    };
    let mut reader = BufReader::new(file);
    let mut tail: VecDeque<Vec<u8>> = VecDeque::with_capacity(n);
    loop {
        let mut line = Vec::new();
        let read = reader
            .read_until(b'\n', &mut line)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if tail.len() == n {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Ok(tail
        .iter()
        .map(|l| format!("{}\n", String::from_utf8_lossy(l)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("current");
        let content: String = (1..=15).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, content).unwrap();

        let tail = tail_lines(&path, LOG_TAIL_LINES).unwrap();
        assert_eq!(tail.lines().count(), 10);
        assert!(tail.starts_with("line 6\n"));
        assert!(tail.ends_with("line 15\n"));

        assert_eq!(tail_lines(&dir.path().join("missing"), 10).unwrap(), "");
    }

    #[test]
    fn test_tail_lines_tolerates_binary_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("current");
        std::fs::write(&path, b"ok\n\xff\xfe binary\nlast").unwrap();

        let tail = tail_lines(&path, LOG_TAIL_LINES).unwrap();
        assert_eq!(tail, "ok\n\u{fffd}\u{fffd} binary\nlast\n");
    }

    #[test]
    fn test_exit_info_without_record_omits_details() {
        let info = ExitInfo::new(None, None, true, false);
        let yaml = serde_yaml::to_string(&info).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(value["service"], serde_yaml::Value::Null);
        assert_eq!(value["killed"], serde_yaml::Value::Bool(true));
    }

    #[test]
    fn test_exit_info_merges_last_exit() {
        let record = ExitRecord {
            hostname: "node1".to_string(),
            rc: 2,
            sig: 0,
            output: "boom\n".to_string(),
            oom: false,
            time: 1_700_000_000,
        };
        let info = ExitInfo::new(Some("web".to_string()), Some(&record), false, true);
        let yaml = serde_yaml::to_string(&info).unwrap();
        let parsed: ExitInfo = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(parsed.rc, Some(2));
        assert_eq!(parsed.hostname.as_deref(), Some("node1"));
        assert!(parsed.oom);
    }
}
