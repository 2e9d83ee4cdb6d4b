//! Per-app service lifecycle.
//!
//! Services live under `<container_dir>/services/<name>` and are run by an
//! external supervisor. Every exit is appended to the service's `finished`
//! log by the supervisor; the agent decides whether to start the service
//! again and reports each exit to the event sink exactly once per log row,
//! tracked by the `reported` cursor next to the log.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use common::{Manifest, RestartLimit, ServiceSpec};
use tracing::{error, info, warn};

use crate::events::{AppEvent, EventSink};
use crate::oom::OomProbe;
use crate::supervisor::Supervisor;

pub mod cursor;
pub mod exit;
pub mod finish_log;

pub use cursor::ReportedCursor;
pub use exit::{ExitInfo, ExitRecord};
pub use finish_log::{FinishEntry, FinishLog, RestartStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTiming {
    /// Delay between checks while waiting for supervisors to attach.
    pub poll_interval: Duration,
    /// Grace period after a service goes down, so the finish hook can append
    /// its row before the log is read.
    pub exit_settle: Duration,
    /// `None` waits for supervisors indefinitely.
    pub attach_timeout: Option<Duration>,
}

impl Default for LifecycleTiming {
    fn default() -> Self {
        LifecycleTiming {
            poll_interval: Duration::from_millis(500),
            exit_settle: Duration::from_secs(1),
            attach_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    Down,
    Starting,
    Running,
    Exited,
    Terminal,
}

#[derive(Debug, Clone)]
pub struct ServiceState {
    pub spec: ServiceSpec,
    pub last_exit: Option<ExitRecord>,
    pub phase: ServicePhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefuseReason {
    RateExceeded,
    RetriesExhausted,
}

impl std::fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefuseReason::RateExceeded => write!(f, "exceeded number of restarts per interval"),
            RefuseReason::RetriesExhausted => write!(f, "exceeded retries"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Refused(RefuseReason),
}

/// A service the restart policy will not start again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refusal {
    pub service: String,
    pub reason: RefuseReason,
}

pub struct ServicePresence {
    manifest: Manifest,
    appname: String,
    hostname: String,
    container_dir: PathBuf,
    services_dir: PathBuf,
    services: Vec<ServiceState>,
    supervisor: Arc<dyn Supervisor>,
    events: Arc<dyn EventSink>,
    oom: OomProbe,
    timing: LifecycleTiming,
}

impl ServicePresence {
    pub fn new(
        manifest: Manifest,
        container_dir: impl Into<PathBuf>,
        hostname: impl Into<String>,
        supervisor: Arc<dyn Supervisor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let container_dir = container_dir.into();
        let services = manifest
            .services
            .iter()
            .map(|spec| ServiceState {
                spec: spec.clone(),
                last_exit: None,
                phase: ServicePhase::Down,
            })
            .collect();
        ServicePresence {
            appname: manifest.name.clone(),
            services_dir: container_dir.join("services"),
            container_dir,
            hostname: hostname.into(),
            manifest,
            services,
            supervisor,
            events,
            oom: OomProbe::default(),
            timing: LifecycleTiming::default(),
        }
    }

    pub fn with_oom_probe(mut self, oom: OomProbe) -> Self {
        self.oom = oom;
        self
    }

    pub fn with_timing(mut self, timing: LifecycleTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn appname(&self) -> &str {
        &self.appname
    }

    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    pub fn service_dir(&self, name: &str) -> PathBuf {
        self.services_dir.join(name)
    }

    pub fn service_dirs(&self) -> Vec<PathBuf> {
        self.services
            .iter()
            .map(|s| self.service_dir(&s.spec.name))
            .collect()
    }

    pub fn services(&self) -> &[ServiceState] {
        &self.services
    }

    pub fn phase(&self, name: &str) -> Option<ServicePhase> {
        self.state(name).ok().map(|s| s.phase)
    }

    pub fn last_exit(&self, name: &str) -> Option<&ExitRecord> {
        self.state(name).ok().and_then(|s| s.last_exit.as_ref())
    }

    fn state(&self, name: &str) -> Result<&ServiceState> {
        self.services
            .iter()
            .find(|s| s.spec.name == name)
            .ok_or_else(|| anyhow!("unknown service {name} in {}", self.appname))
    }

    fn state_mut(&mut self, name: &str) -> Result<&mut ServiceState> {
        let appname = &self.appname;
        self.services
            .iter_mut()
            .find(|s| s.spec.name == name)
            .ok_or_else(|| anyhow!("unknown service {name} in {appname}"))
    }

    /// Wait until a supervisor is attached to every service directory.
    pub async fn ensure_supervisors_running(&self) -> Result<()> {
        let wait_all = async {
            for svc_dir in self.service_dirs() {
                while !self.supervisor.is_supervised(&svc_dir).await? {
                    info!("{} not yet supervised, waiting", svc_dir.display());
                    tokio::time::sleep(self.timing.poll_interval).await;
                }
            }
            Ok::<(), anyhow::Error>(())
        };
        match self.timing.attach_timeout {
            Some(limit) => tokio::time::timeout(limit, wait_all).await.map_err(|_| {
                anyhow!("supervisors of {} not running after {limit:?}", self.appname)
            })?,
            None => wait_all.await,
        }
    }

    /// Start services in manifest order, stopping at the first refusal.
    pub async fn start_all(&mut self) -> Result<Option<Refusal>> {
        let names: Vec<String> = self.services.iter().map(|s| s.spec.name.clone()).collect();
        for name in names {
            if let StartOutcome::Refused(reason) = self.start_service(&name).await? {
                error!("Unable to start service {name}: {reason}");
                return Ok(Some(Refusal {
                    service: name,
                    reason,
                }));
            }
        }
        Ok(None)
    }

    /// Start `name` if its restart policy allows it and wait until it is up.
    pub async fn start_service(&mut self, name: &str) -> Result<StartOutcome> {
        let limit: RestartLimit = self.state(name)?.spec.restart_limit();
        let svc_dir = self.service_dir(name);
        let stats = FinishLog::in_service_dir(&svc_dir).restart_stats(Utc::now().timestamp())?;
        info!(
            "starting {name}, retries {}/{limit}",
            stats.actual_restarts
        );

        // Report an exit a previous agent may have missed before deciding.
        self.update_exit_status(name).await?;

        let outcome = if stats.rate_exceeded {
            info!("Exceeded number of restarts per interval");
            StartOutcome::Refused(RefuseReason::RateExceeded)
        } else if limit.allows(stats.actual_restarts) {
            self.state_mut(name)?.phase = ServicePhase::Starting;
            let outcome = if self.supervisor.is_down(&svc_dir).await? {
                self.supervisor
                    .start(&svc_dir)
                    .await
                    .with_context(|| format!("Failed to start {}", svc_dir.display()))?;
                self.report_running(name).await?;
                StartOutcome::Started
            } else {
                info!("{name} is already running");
                StartOutcome::AlreadyRunning
            };
            self.supervisor.wait_up(&svc_dir).await?;
            self.state_mut(name)?.phase = ServicePhase::Running;
            outcome
        } else {
            StartOutcome::Refused(RefuseReason::RetriesExhausted)
        };

        if matches!(outcome, StartOutcome::Refused(_)) {
            self.state_mut(name)?.phase = ServicePhase::Terminal;
        }
        Ok(outcome)
    }

    /// Block until any service, or any of `extra_dirs`, goes down, then
    /// report whatever exits were recorded.
    pub async fn wait_for_exit(&mut self, extra_dirs: &[PathBuf]) -> Result<()> {
        let mut watched = self.service_dirs();
        watched.extend_from_slice(extra_dirs);
        self.supervisor.wait_any_down(&watched).await?;
        tokio::time::sleep(self.timing.exit_settle).await;
        self.update_all_exit_status().await?;
        Ok(())
    }

    /// Flush pending exit reports of every service. Returns how many
    /// services had something new to report.
    pub async fn update_all_exit_status(&mut self) -> Result<usize> {
        let names: Vec<String> = self.services.iter().map(|s| s.spec.name.clone()).collect();
        let mut reported = 0;
        for name in names {
            if self.update_exit_status(&name).await? {
                reported += 1;
            }
        }
        Ok(reported)
    }

    /// Summary of the last exit recorded in `svc_dir` and the number of
    /// rows in its finish log, or `None` if the service never exited.
    pub fn exit_info(&self, svc_dir: &Path) -> Result<Option<(ExitRecord, usize)>> {
        let entries = FinishLog::in_service_dir(svc_dir).entries()?;
        let Some(last) = entries.last() else {
            return Ok(None);
        };
        let output = exit::tail_lines(&svc_dir.join("log").join("current"), exit::LOG_TAIL_LINES)?;
        let record = ExitRecord {
            hostname: self.hostname.clone(),
            rc: last.rc,
            sig: last.signal,
            output,
            oom: self.oom.is_oom(),
            time: last.timestamp,
        };
        Ok(Some((record, entries.len())))
    }

    /// Post the latest exit of `name` unless it was already reported.
    ///
    /// The event is posted before the cursor is persisted: a crash in
    /// between reposts the same exit on the next call.
    pub async fn update_exit_status(&mut self, name: &str) -> Result<bool> {
        self.state(name)?;
        let svc_dir = self.service_dir(name);
        let Some((record, count)) = self.exit_info(&svc_dir)? else {
            info!("{}/finished does not exist.", svc_dir.display());
            return Ok(false);
        };
        if self.manifest.task.is_none() {
            error!("Task id not found in {}", self.appname);
            return Ok(false);
        }

        let cursor = ReportedCursor::in_service_dir(&svc_dir);
        match cursor.read()? {
            Some(prev) if prev == count => {
                info!("Exit status already reported, count: {count}");
                return Ok(false);
            }
            Some(prev) if prev > count => {
                warn!(
                    "{name}: reported count {prev} is ahead of {count} finished rows, not reporting"
                );
                return Ok(false);
            }
            _ => {}
        }

        info!("exit (rc, signal): ({}, {})", record.rc, record.sig);
        let event = AppEvent::Exit {
            service: name.to_string(),
            rc: record.rc,
            signal: record.sig,
        };
        self.events.post(&self.appname, &event).await?;
        cursor.write(count)?;

        let state = self.state_mut(name)?;
        state.last_exit = Some(record);
        state.phase = ServicePhase::Exited;
        Ok(true)
    }

    pub async fn report_running(&self, name: &str) -> Result<()> {
        info!("Service {name} is running.");
        let event = AppEvent::Running {
            service: name.to_string(),
        };
        self.events.post(&self.appname, &event).await
    }

    /// Write the terminal `exitinfo` of the app. Only the first call writes;
    /// later calls keep the existing file.
    pub fn exit_app(&self, service: Option<&str>, killed: bool) -> Result<ExitInfo> {
        info!("Exiting {}", self.appname);
        let last_exit = match service {
            Some(name) => self.state(name)?.last_exit.as_ref(),
            None => None,
        };
        let info = ExitInfo::new(
            service.map(str::to_string),
            last_exit,
            killed,
            self.oom.is_oom(),
        );

        let path = self.container_dir.join("exitinfo");
        let content = serde_yaml::to_string(&info).context("Failed to encode exitinfo")?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".exitinfo")
            .tempfile_in(&self.container_dir)
            .with_context(|| {
                format!(
                    "Failed to create temporary exitinfo in {}",
                    self.container_dir.display()
                )
            })?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!("{} already written, keeping it", path.display());
            }
            Err(e) => {
                return Err(e.error).with_context(|| format!("Failed to write {}", path.display()));
            }
        }
        Ok(info)
    }
}
